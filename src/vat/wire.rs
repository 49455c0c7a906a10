//! The vat-facing delivery protocol (§6.1).

use crate::ids::LocalRef;
use crate::message::WireCapData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireDelivery {
    StartVat { params: String },
    Message { target: LocalRef, methargs: WireCapData, result: Option<LocalRef> },
    /// `[[pRef, rejected, value]]`, one entry per settled promise.
    Notify(Vec<(LocalRef, bool, WireCapData)>),
    DropImports(Vec<LocalRef>),
    RetireImports(Vec<LocalRef>),
    RetireExports(Vec<LocalRef>),
    BringOutYourDead,
}
