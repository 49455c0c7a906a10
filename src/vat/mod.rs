//! The kref/eref boundary for one vat (§4.C).
//!
//! `VatHandle` is the only place a kref is ever substituted for an eref or
//! back: `deliver` walks an outbound `RunQueueItem` and produces the vat's
//! wire form, `apply_syscall` walks an inbound syscall and produces kernel
//! effects. `SystemVatHandle` is the same translation layer with an
//! ephemeral, in-memory vatstore instead of a persistent one.

pub mod state;
pub mod syscall;
pub mod wire;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::error::{KernelError, KernelResult, SyscallError, SyscallResult};
use crate::ids::{Direction, EndpointId, KRef, LocalRef};
use crate::message::{KernelCapData, WireCapData};
use crate::queue::{KernelQueue, RunQueueItem};
use crate::store::{Decider, KernelStore};

pub use state::VatState;
pub use syscall::{Syscall, SyscallOutcome};
pub use wire::WireDelivery;

/// Persistent-vs-ephemeral scratch map abstraction so `VatHandle` and
/// `SystemVatHandle` share every other line of translation logic.
trait Vatstore: Send + Sync {
    fn get(&self, key: &str) -> KernelResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> KernelResult<()>;
    fn delete(&self, key: &str) -> KernelResult<()>;
    fn next_key(&self, after: Option<&str>) -> KernelResult<Option<String>>;
}

struct PersistentVatstore {
    store: Arc<KernelStore>,
    vid: EndpointId,
}

impl Vatstore for PersistentVatstore {
    fn get(&self, key: &str) -> KernelResult<Option<String>> {
        self.store.vatstore_get(self.vid, key)
    }
    fn set(&self, key: &str, value: &str) -> KernelResult<()> {
        self.store.vatstore_set(self.vid, key, value)
    }
    fn delete(&self, key: &str) -> KernelResult<()> {
        self.store.vatstore_delete(self.vid, key)
    }
    fn next_key(&self, after: Option<&str>) -> KernelResult<Option<String>> {
        self.store.vatstore_next_key(self.vid, after)
    }
}

#[derive(Default)]
struct EphemeralVatstore {
    map: DashMap<String, String>,
}

impl Vatstore for EphemeralVatstore {
    fn get(&self, key: &str) -> KernelResult<Option<String>> {
        Ok(self.map.get(key).map(|v| v.clone()))
    }
    fn set(&self, key: &str, value: &str) -> KernelResult<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }
    fn delete(&self, key: &str) -> KernelResult<()> {
        self.map.remove(key);
        Ok(())
    }
    fn next_key(&self, after: Option<&str>) -> KernelResult<Option<String>> {
        let mut keys: Vec<_> = self.map.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys.into_iter().find(|k| match after {
            Some(after) => k.as_str() > after,
            None => true,
        }))
    }
}

/// What actually moves bytes to and from the vat worker. Platform-specific
/// transports implement this over the duplex stream `PlatformServices`
/// returns; only the contract lives in this crate (§1).
#[async_trait]
pub trait VatTransport: Send + Sync {
    /// Delivers one item and returns the ordered batch of syscalls the vat
    /// issued while handling it.
    async fn deliver(&self, delivery: WireDelivery) -> KernelResult<Vec<Syscall>>;
}

pub struct VatHandle {
    id: EndpointId,
    store: Arc<KernelStore>,
    queue: Arc<KernelQueue>,
    transport: Arc<dyn VatTransport>,
    vatstore: Box<dyn Vatstore>,
    state: Mutex<VatState>,
}

impl VatHandle {
    pub fn new(id: EndpointId, store: Arc<KernelStore>, queue: Arc<KernelQueue>, transport: Arc<dyn VatTransport>) -> Self {
        let vatstore: Box<dyn Vatstore> = if id.kind == crate::ids::EndpointKind::SystemVat {
            Box::new(EphemeralVatstore::default())
        } else {
            Box::new(PersistentVatstore { store: store.clone(), vid: id })
        };
        Self {
            id,
            store,
            queue,
            transport,
            vatstore,
            state: Mutex::new(VatState::Uninitialized),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn state(&self) -> VatState {
        *self.state.lock().expect("vat state lock poisoned")
    }

    fn set_state(&self, next: VatState) {
        *self.state.lock().expect("vat state lock poisoned") = next;
    }

    pub fn is_compromised(&self) -> bool {
        matches!(self.state(), VatState::Compromised) || self.store.is_vat_compromised(self.id).unwrap_or(true)
    }

    // ---- translation: kref -> eref (outbound) ----

    /// Translates a kref to this endpoint's eref, minting a new c-list entry
    /// on first crossing. An object's reachable count goes up exactly when
    /// such a new entry is minted (§4.A "translated into a new c-list
    /// entry"); promises carry no refcount pair.
    fn kref_to_wire(&self, kref: KRef) -> KernelResult<LocalRef> {
        if let Some(eref) = self.store.kref_to_eref(self.id, kref)? {
            return Ok(eref);
        }
        let eref = self.store.allocate_eref_for_kref(self.id, kref)?;
        if let KRef::Object(koid) = kref {
            self.store.increment_reachable(koid)?;
        }
        Ok(eref)
    }

    fn cap_data_to_wire(&self, data: &KernelCapData) -> KernelResult<WireCapData> {
        let slots = data.slots.iter().map(|&k| self.kref_to_wire(k)).collect::<KernelResult<_>>()?;
        Ok(WireCapData { body: data.body.clone(), slots })
    }

    /// Translates a `RunQueueItem` into wire form and hands it to the
    /// transport, incrementing reachable counts for any new c-list entry
    /// minted along the way, then applies every syscall the vat issues in
    /// response (§4.C).
    #[instrument(skip(self), fields(vat = %self.id))]
    pub async fn deliver(&self, item: RunQueueItem) -> KernelResult<()> {
        if self.is_compromised() {
            self.reject_as_compromised(&item)?;
            return Ok(());
        }

        let delivery = self.translate_outbound(item)?;
        self.set_state(VatState::Suspended);
        let syscalls = self.transport.deliver(delivery).await;
        self.set_state(VatState::Running);

        let syscalls = match syscalls {
            Ok(s) => s,
            Err(err) => {
                self.mark_compromised()?;
                return Err(err);
            }
        };

        for syscall in syscalls {
            if let Err(SyscallError(message)) = self.apply_syscall(syscall).await {
                tracing::warn!(vat = %self.id, %message, "syscall failed, vat compromised");
                self.mark_compromised()?;
                break;
            }
        }
        Ok(())
    }

    fn translate_outbound(&self, item: RunQueueItem) -> KernelResult<WireDelivery> {
        match item {
            RunQueueItem::Send { target, methargs, result } => {
                let target = self.kref_to_wire(target)?;
                let methargs = self.cap_data_to_wire(&methargs)?;
                let result = result.map(|kpid| self.kref_to_wire(KRef::Promise(kpid))).transpose()?;
                Ok(WireDelivery::Message { target, methargs, result })
            }
            RunQueueItem::Notify { kpid, .. } => {
                let promise = self.store.get_promise(kpid)?.ok_or_else(|| {
                    KernelError::StoreCorruption(format!("notify for unknown promise {kpid:?}"))
                })?;
                let eref = self.kref_to_wire(KRef::Promise(kpid))?;
                let rejected = matches!(promise.state, crate::store::PromiseState::Rejected);
                let value = promise.value.unwrap_or_default();
                let slots = promise
                    .resolution_slots
                    .iter()
                    .map(|&k| self.kref_to_wire(k))
                    .collect::<KernelResult<_>>()?;
                Ok(WireDelivery::Notify(vec![(eref, rejected, WireCapData { body: value, slots })]))
            }
            RunQueueItem::GcDrop { krefs, .. } => {
                let erefs = krefs.into_iter().map(|k| self.kref_to_wire(k)).collect::<KernelResult<_>>()?;
                Ok(WireDelivery::DropImports(erefs))
            }
            RunQueueItem::GcRetire { krefs, .. } => {
                let erefs = krefs.into_iter().map(|k| self.kref_to_wire(k)).collect::<KernelResult<_>>()?;
                Ok(WireDelivery::RetireImports(erefs))
            }
            RunQueueItem::Bringout { .. } => Ok(WireDelivery::BringOutYourDead),
        }
    }

    /// A Send whose target is a revoked object, or whose target vat has
    /// already been marked compromised, resolves the result promise with a
    /// well-known rejection instead of ever reaching the wire (§4.B
    /// cancellation, §8 scenario 5).
    fn reject_as_compromised(&self, item: &RunQueueItem) -> KernelResult<()> {
        if let RunQueueItem::Send { result: Some(kpid), .. } = item {
            self.store.resolve_promise(
                *kpid,
                true,
                format!("{{\"kind\":\"VatCompromised\",\"endpoint\":\"{}\"}}", self.id),
                Vec::new(),
            )?;
        }
        Ok(())
    }

    fn mark_compromised(&self) -> KernelResult<()> {
        self.set_state(VatState::Compromised);
        self.store.mark_vat_as_compromised(self.id)
    }

    pub fn mark_terminating(&self) {
        self.set_state(VatState::Terminating);
    }

    pub fn mark_terminated(&self) {
        self.set_state(VatState::Terminated);
    }

    // ---- syscall execution (inbound, §4.C) ----

    #[instrument(skip(self, syscall), fields(vat = %self.id))]
    async fn apply_syscall(&self, syscall: Syscall) -> SyscallResult<SyscallOutcome> {
        match syscall {
            Syscall::Send { target, methargs, result } => self.syscall_send(target, methargs, result),
            Syscall::Subscribe { vpid } => self.syscall_subscribe(vpid),
            Syscall::Resolve(resolutions) => self.syscall_resolve(resolutions),
            Syscall::Exit { is_failure, info } => self.syscall_exit(is_failure, info),
            Syscall::DropImports(erefs) => self.syscall_drop_imports(erefs),
            Syscall::RetireImports(erefs) => self.syscall_retire_imports(erefs),
            Syscall::RetireExports(erefs) => self.syscall_retire_exports(erefs),
            Syscall::AbandonExports(erefs) => self.syscall_abandon_exports(erefs),
            Syscall::VatstoreGet(key) => {
                Ok(SyscallOutcome::Value(self.vatstore.get(&key).map_err(SyscallError::from)?))
            }
            Syscall::VatstoreSet(key, value) => {
                self.vatstore.set(&key, &value).map_err(SyscallError::from)?;
                Ok(SyscallOutcome::Unit)
            }
            Syscall::VatstoreDelete(key) => {
                self.vatstore.delete(&key).map_err(SyscallError::from)?;
                Ok(SyscallOutcome::Unit)
            }
            Syscall::VatstoreGetNextKey(after) => {
                let after = if after.is_empty() { None } else { Some(after.as_str()) };
                Ok(SyscallOutcome::Value(self.vatstore.next_key(after).map_err(SyscallError::from)?))
            }
        }
    }

    fn eref_to_kref(&self, eref: LocalRef) -> SyscallResult<KRef> {
        self.store
            .eref_to_kref(self.id, eref)?
            .ok_or_else(|| SyscallError::new(format!("unknown eref {eref} for {}", self.id)))
    }

    fn cap_data_to_kernel(&self, data: WireCapData) -> SyscallResult<KernelCapData> {
        let slots = data.slots.into_iter().map(|e| self.eref_to_kref(e)).collect::<SyscallResult<_>>()?;
        Ok(KernelCapData { body: data.body, slots })
    }

    fn syscall_send(
        &self,
        target: LocalRef,
        methargs: WireCapData,
        result: Option<LocalRef>,
    ) -> SyscallResult<SyscallOutcome> {
        let target_kref = self.eref_to_kref(target)?;
        if let KRef::Object(koid) = target_kref {
            if self.store.is_revoked(koid).map_err(SyscallError::from)? {
                return Err(SyscallError::new(format!("object {koid:?} has been revoked")));
            }
        }
        let methargs = self.cap_data_to_kernel(methargs)?;
        let result_kpid = result.map(|r| self.mint_or_find_result_promise(r)).transpose()?;
        self.queue.enqueue_send(target_kref, methargs, result_kpid);
        Ok(SyscallOutcome::Unit)
    }

    /// Resolves a `send` result ref to its kernel promise, minting a new
    /// one with `Decider::Endpoint(self.id)` the first time this vat names
    /// it (§8 scenario 2: "allocates kp7, decider = A").
    fn mint_or_find_result_promise(&self, eref: LocalRef) -> SyscallResult<KpId> {
        if let Some(kref) = self.store.eref_to_kref(self.id, eref).map_err(SyscallError::from)? {
            return kref
                .as_promise()
                .ok_or_else(|| SyscallError::new("send result ref must name a promise"));
        }
        if !matches!(eref, LocalRef::Promise { .. }) {
            return Err(SyscallError::new("send result ref must name a promise"));
        }
        self.store.allocate_kref_for_new_promise(self.id, eref).map_err(SyscallError::from)
    }

    fn syscall_subscribe(&self, vpid: LocalRef) -> SyscallResult<SyscallOutcome> {
        let kref = self.eref_to_kref(vpid)?;
        let kpid = kref.as_promise().ok_or_else(|| SyscallError::new("subscribe target must be a promise"))?;
        self.store.subscribe(kpid, self.id).map_err(SyscallError::from)?;
        Ok(SyscallOutcome::Unit)
    }

    fn syscall_resolve(&self, resolutions: Vec<(LocalRef, bool, WireCapData)>) -> SyscallResult<SyscallOutcome> {
        let mut translated = Vec::with_capacity(resolutions.len());
        for (vpid, rejected, value) in resolutions {
            let kref = self.eref_to_kref(vpid)?;
            let kpid = kref.as_promise().ok_or_else(|| SyscallError::new("resolve target must be a promise"))?;
            let promise = self.store.get_promise(kpid).map_err(SyscallError::from)?;
            let decides = matches!(promise.and_then(|p| p.decider), Some(Decider::Endpoint(ep)) if ep == self.id);
            if !decides {
                return Err(SyscallError::new(format!("{} is not the decider for {kpid:?}", self.id)));
            }
            let data = self.cap_data_to_kernel(value)?;
            translated.push((kpid, rejected, data.body, data.slots));
        }
        self.queue.resolve_promises(&translated).map_err(SyscallError::from)?;
        Ok(SyscallOutcome::Unit)
    }

    fn syscall_exit(&self, is_failure: bool, info: String) -> SyscallResult<SyscallOutcome> {
        self.mark_terminating();
        tracing::info!(vat = %self.id, is_failure, info, "vat exited");
        Ok(SyscallOutcome::Unit)
    }

    fn syscall_drop_imports(&self, erefs: Vec<LocalRef>) -> SyscallResult<SyscallOutcome> {
        for eref in erefs {
            let kref = self.eref_to_kref(eref)?;
            self.store.clear_reachable_flag(self.id, kref).map_err(SyscallError::from)?;
        }
        Ok(SyscallOutcome::Unit)
    }

    fn syscall_retire_imports(&self, erefs: Vec<LocalRef>) -> SyscallResult<SyscallOutcome> {
        for eref in erefs {
            let kref = self.eref_to_kref(eref)?;
            if let KRef::Object(koid) = kref {
                self.store.decrement_ref_count(self.id, koid, false, true).map_err(SyscallError::from)?;
            }
            self.store.delete_clist_entry(self.id, kref, eref).map_err(SyscallError::from)?;
        }
        Ok(SyscallOutcome::Unit)
    }

    fn syscall_retire_exports(&self, erefs: Vec<LocalRef>) -> SyscallResult<SyscallOutcome> {
        for eref in erefs {
            let kref = self.eref_to_kref(eref)?;
            if let KRef::Object(koid) = kref {
                self.store.decrement_ref_count(self.id, koid, true, true).map_err(SyscallError::from)?;
            }
            self.store.delete_clist_entry(self.id, kref, eref).map_err(SyscallError::from)?;
        }
        Ok(SyscallOutcome::Unit)
    }

    /// Owner disowns these exports outright; analogous to a compromise
    /// scoped to just these refs (§4.C) — every reachable holder is
    /// notified via the same `retireExport` GC path.
    fn syscall_abandon_exports(&self, erefs: Vec<LocalRef>) -> SyscallResult<SyscallOutcome> {
        for eref in erefs {
            let kref = self.eref_to_kref(eref)?;
            if let KRef::Object(koid) = kref {
                self.store.revoke(koid).map_err(SyscallError::from)?;
                self.store.decrement_ref_count(self.id, koid, true, false).map_err(SyscallError::from)?;
            }
        }
        Ok(SyscallOutcome::Unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GcActionKind;

    struct EchoTransport;

    #[async_trait]
    impl VatTransport for EchoTransport {
        async fn deliver(&self, _delivery: WireDelivery) -> KernelResult<Vec<Syscall>> {
            Ok(Vec::new())
        }
    }

    fn handle(id: EndpointId) -> (Arc<KernelStore>, Arc<KernelQueue>, VatHandle) {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        let queue = Arc::new(KernelQueue::new(store.clone()));
        let handle = VatHandle::new(id, store.clone(), queue.clone(), Arc::new(EchoTransport));
        (store, queue, handle)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deliver_allocates_eref_for_unseen_kref() {
        let (store, queue, handle) = handle(EndpointId::vat(1));
        let koid = store.create_object(EndpointId::vat(99)).unwrap();
        queue.start_crank().unwrap();
        handle
            .deliver(RunQueueItem::Send {
                target: KRef::Object(koid),
                methargs: KernelCapData { body: "{}".into(), slots: vec![] },
                result: None,
            })
            .await
            .unwrap();
        queue.end_crank().unwrap();
        let eref = store.kref_to_eref(handle.id(), KRef::Object(koid)).unwrap();
        assert_eq!(eref, Some(LocalRef::object(0, Direction::Imported)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn compromised_vat_rejects_send_with_result() {
        let (store, queue, handle) = handle(EndpointId::vat(2));
        store.mark_vat_as_compromised(handle.id()).unwrap();
        let kpid = store.create_promise(Decider::Kernel).unwrap();
        queue.start_crank().unwrap();
        handle
            .deliver(RunQueueItem::Send {
                target: KRef::Object(store.create_object(EndpointId::vat(1)).unwrap()),
                methargs: KernelCapData { body: "{}".into(), slots: vec![] },
                result: Some(kpid),
            })
            .await
            .unwrap();
        queue.end_crank().unwrap();
        let promise = store.get_promise(kpid).unwrap().unwrap();
        assert_eq!(promise.state, crate::store::PromiseState::Rejected);
    }

    #[test]
    fn gc_action_kind_is_reexported_for_downstream_matching() {
        let _ = GcActionKind::DropExport;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_with_unseen_result_ref_mints_a_vat_decided_promise() {
        let (store, queue, handle) = handle(EndpointId::vat(3));
        let target = KRef::Object(store.create_object(EndpointId::vat(9)).unwrap());
        let result_eref = LocalRef::promise(0, Direction::Exported);

        queue.start_crank().unwrap();
        handle
            .apply_syscall(Syscall::Send {
                target: handle.kref_to_wire(target).unwrap(),
                methargs: WireCapData { body: "{}".into(), slots: vec![] },
                result: Some(result_eref),
            })
            .await
            .unwrap();
        queue.end_crank().unwrap();

        let kref = store.eref_to_kref(handle.id(), result_eref).unwrap().unwrap();
        let kpid = kref.as_promise().unwrap();
        let promise = store.get_promise(kpid).unwrap().unwrap();
        assert_eq!(promise.decider, Some(Decider::Endpoint(handle.id())));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn new_clist_entry_for_an_object_increments_reachable_count() {
        let (store, queue, handle) = handle(EndpointId::vat(4));
        let koid = store.create_object(EndpointId::vat(9)).unwrap();
        assert_eq!(store.get_object(koid).unwrap().unwrap().reachable_count, 0);

        queue.start_crank().unwrap();
        handle.kref_to_wire(KRef::Object(koid)).unwrap();
        queue.end_crank().unwrap();

        assert_eq!(store.get_object(koid).unwrap().unwrap().reachable_count, 1);
    }
}
