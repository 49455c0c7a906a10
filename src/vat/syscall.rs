//! The vat-issued syscall protocol (§4.C) and its outcome type.

use crate::ids::LocalRef;
use crate::message::WireCapData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Syscall {
    Send { target: LocalRef, methargs: WireCapData, result: Option<LocalRef> },
    Subscribe { vpid: LocalRef },
    /// `[[vpid, rejected, value]]`.
    Resolve(Vec<(LocalRef, bool, WireCapData)>),
    Exit { is_failure: bool, info: String },
    DropImports(Vec<LocalRef>),
    RetireImports(Vec<LocalRef>),
    RetireExports(Vec<LocalRef>),
    AbandonExports(Vec<LocalRef>),
    VatstoreGet(String),
    VatstoreSet(String, String),
    VatstoreDelete(String),
    /// Empty string means "from the start of the map".
    VatstoreGetNextKey(String),
}

/// The payload half of a syscall's `['ok', data]` arm; the `['error', msg]`
/// arm is `SyscallError` (§9 "preserve this two-arm shape").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallOutcome {
    Unit,
    Value(Option<String>),
}
