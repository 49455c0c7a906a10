//! Key builders for the stable, bit-exact schema in §6.3.
//!
//! Every key is built through one of these functions rather than inline
//! `format!` calls scattered across the store, so the schema has exactly
//! one place it can drift from the spec.

use crate::ids::{EndpointId, KRef, SubclusterId};

pub fn clist_forward(ep: EndpointId, kref: KRef) -> String {
    format!("e.{ep}.{kref}")
}

pub fn clist_reverse(ep: EndpointId, eref: &str) -> String {
    format!("e.{ep}.{eref}")
}

pub fn next_object_id(ep: EndpointId) -> String {
    format!("e.nextObjectId.{ep}")
}

pub fn next_promise_id(ep: EndpointId) -> String {
    format!("e.nextPromiseId.{ep}")
}

pub fn promise_state(kpid: crate::ids::KpId) -> String {
    format!("kp.{}.state", crate::ids::KRef::Promise(kpid))
}

pub fn promise_decider(kpid: crate::ids::KpId) -> String {
    format!("kp.{}.decider", crate::ids::KRef::Promise(kpid))
}

pub fn promise_subscribers(kpid: crate::ids::KpId) -> String {
    format!("kp.{}.subscribers", crate::ids::KRef::Promise(kpid))
}

pub fn promise_value(kpid: crate::ids::KpId) -> String {
    format!("kp.{}.value", crate::ids::KRef::Promise(kpid))
}

pub fn promise_slots(kpid: crate::ids::KpId) -> String {
    format!("kp.{}.slots", crate::ids::KRef::Promise(kpid))
}

pub fn object_owner(koid: crate::ids::KoId) -> String {
    format!("ko.{}.owner", crate::ids::KRef::Object(koid))
}

pub fn object_reachable(koid: crate::ids::KoId) -> String {
    format!("ko.{}.reachable", crate::ids::KRef::Object(koid))
}

pub fn object_recognizable(koid: crate::ids::KoId) -> String {
    format!("ko.{}.recognizable", crate::ids::KRef::Object(koid))
}

pub fn object_revoked(koid: crate::ids::KoId) -> String {
    format!("ko.{}.revoked", crate::ids::KRef::Object(koid))
}

pub fn subcluster_config(sid: SubclusterId) -> String {
    format!("subcluster.{sid}")
}

pub fn subcluster_vats(sid: SubclusterId) -> String {
    format!("subclusterVats.{sid}")
}

pub fn vat_subcluster(vid: EndpointId) -> String {
    format!("vatSubcluster.{vid}")
}

pub fn remote_info(rid: EndpointId) -> String {
    format!("remote.{rid}")
}

pub fn remote_seq(rid: EndpointId, field: &str) -> String {
    format!("remoteSeq.{rid}.{field}")
}

pub fn remote_pending(rid: EndpointId, seq: u64) -> String {
    format!("remotePending.{rid}.{seq}")
}

pub fn remote_pending_prefix(rid: EndpointId) -> String {
    format!("remotePending.{rid}.")
}

/// Kernel-wide koid/kpid allocators, distinct from the per-endpoint local
/// eref counters above (`e.nextObjectId.<ep>` numbers `o+N`/`o-N`, not
/// `koN`). Not named in the spec's key schema table; resolved here as an
/// implementation detail, recorded in the design ledger.
pub const NEXT_KOID: &str = "ko.nextId";
pub const NEXT_KPID: &str = "kp.nextId";

pub const GC_ACTIONS: &str = "gcActions";
pub const COMPROMISED_VATS: &str = "compromisedVats";
pub const LAST_ACTIVE_TIME: &str = "lastActiveTime";

pub fn kernel_service(name: &str) -> String {
    format!("kernelService.{name}")
}

/// Per-vat persistent scratch map (§4.C `vatstoreGet/Set/Delete/GetNextKey`).
/// Not named in §6.3's table; added as the obvious extension of that
/// schema's `<prefix>.<id>.<field>` convention.
pub fn vatstore_entry(vid: EndpointId, key: &str) -> String {
    format!("vs.{vid}.{key}")
}

pub fn vatstore_prefix(vid: EndpointId) -> String {
    format!("vs.{vid}.")
}
