//! The two capability-data shapes that cross the kernel/vat boundary.
//!
//! Kernel-side code only ever sees krefs; `VatHandle::deliver` and
//! `VatHandle::apply_syscall` are the sole translation points to and from
//! an endpoint's local eref namespace (§4.C).

use serde::{Deserialize, Serialize};

use crate::ids::{KRef, LocalRef};

/// A method-call payload as the kernel stores and queues it: `body` is an
/// opaque serialized payload that refers to its capabilities positionally,
/// `slots` resolves those positions to kernel-wide references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelCapData {
    pub body: String,
    pub slots: Vec<KRef>,
}

/// The same payload after `VatHandle::deliver` has substituted each slot
/// with the receiving endpoint's local eref (§6.1 `CapData`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCapData {
    pub body: String,
    pub slots: Vec<LocalRef>,
}
