//! The run-queue scheduler and crank lifecycle (§4.B).
//!
//! `KernelQueue` is deliberately ignorant of vats: it hands finished
//! `RunQueueItem`s to whatever `Dispatcher` the caller supplies, the same
//! way `knhk-workflow-engine`'s `StateManager` stays ignorant of the HTTP
//! layer that eventually calls it. The kernel binds a vat-aware dispatcher
//! to the queue in `lib.rs`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{instrument, Span};

use crate::error::{KernelError, KernelResult};
use crate::gc;
use crate::ids::{EndpointId, KRef, KpId};
use crate::message::KernelCapData;
use crate::store::{Decider, KernelStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunQueueItem {
    Send { target: KRef, methargs: KernelCapData, result: Option<KpId> },
    Notify { endpoint: EndpointId, kpid: KpId },
    GcDrop { endpoint: EndpointId, krefs: Vec<KRef> },
    GcRetire { endpoint: EndpointId, krefs: Vec<KRef> },
    Bringout { endpoint: EndpointId, krefs: Vec<KRef> },
}

/// Whatever turns a finished `RunQueueItem` into an actual delivery.
/// Implemented by the kernel's vat-aware core; `KernelQueue` itself only
/// orders and hands off items.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, item: RunQueueItem) -> KernelResult<()>;
}

/// One resolution to apply via `resolve_promises`: `(kpid, rejected, value, slots)`.
pub type Resolution = (KpId, bool, String, Vec<KRef>);

struct CrankState {
    in_crank: AtomicBool,
    savepoint_names: Mutex<Vec<String>>,
    settled: tokio::sync::Notify,
}

impl CrankState {
    fn new() -> Self {
        Self {
            in_crank: AtomicBool::new(false),
            savepoint_names: Mutex::new(Vec::new()),
            settled: tokio::sync::Notify::new(),
        }
    }
}

pub struct KernelQueue {
    store: Arc<KernelStore>,
    items: Mutex<VecDeque<RunQueueItem>>,
    crank: CrankState,
    /// Vats with a bootstrap Send still pending dispatch; while non-empty,
    /// `run()` prefers draining the queue over any GC batch (§4.B exception).
    bootstrap_pending: Mutex<HashSet<EndpointId>>,
}

impl KernelQueue {
    pub fn new(store: Arc<KernelStore>) -> Self {
        Self {
            store,
            items: Mutex::new(VecDeque::new()),
            crank: CrankState::new(),
            bootstrap_pending: Mutex::new(HashSet::new()),
        }
    }

    fn items_mut(&self) -> std::sync::MutexGuard<'_, VecDeque<RunQueueItem>> {
        self.items.lock().expect("run queue lock poisoned")
    }

    // ---- enqueueing ----

    pub fn enqueue_send(&self, target: KRef, methargs: KernelCapData, result: Option<KpId>) {
        self.items_mut().push_back(RunQueueItem::Send { target, methargs, result });
    }

    pub fn enqueue_notify(&self, endpoint: EndpointId, kpid: KpId) {
        self.items_mut().push_back(RunQueueItem::Notify { endpoint, kpid });
    }

    /// High-level wrapper: allocates a kernel-decided result promise and
    /// enqueues the Send in one step.
    pub fn enqueue_message(
        &self,
        target: KRef,
        body: impl Into<String>,
        slots: Vec<KRef>,
    ) -> KernelResult<KpId> {
        let kpid = self.store.create_promise(Decider::Kernel)?;
        self.enqueue_send(target, KernelCapData { body: body.into(), slots }, Some(kpid));
        Ok(kpid)
    }

    /// Updates the promise table, enqueues a Notify for every subscriber
    /// (in `subscribe` insertion order) and clears the subscriber list.
    pub fn resolve_promises(&self, resolutions: &[Resolution]) -> KernelResult<()> {
        for (kpid, rejected, value, slots) in resolutions {
            self.store.resolve_promise(*kpid, *rejected, value.clone(), slots.clone())?;
            let Some(promise) = self.store.get_promise(*kpid)? else {
                return Err(KernelError::StoreCorruption(format!(
                    "resolve_promises: promise {kpid:?} vanished mid-crank"
                )));
            };
            for subscriber in &promise.subscribers {
                self.enqueue_notify(*subscriber, *kpid);
            }
            self.store.clear_subscribers(*kpid)?;
        }
        Ok(())
    }

    pub fn mark_bootstrap_pending(&self, vat: EndpointId) {
        self.bootstrap_pending.lock().expect("bootstrap set lock poisoned").insert(vat);
    }

    fn clear_bootstrap_pending(&self, vat: EndpointId) {
        self.bootstrap_pending.lock().expect("bootstrap set lock poisoned").remove(&vat);
    }

    fn has_bootstrap_pending(&self) -> bool {
        !self.bootstrap_pending.lock().expect("bootstrap set lock poisoned").is_empty()
    }

    // ---- crank lifecycle (§4.B) ----

    pub fn in_crank(&self) -> bool {
        self.crank.in_crank.load(Ordering::SeqCst)
    }

    pub fn start_crank(&self) -> KernelResult<()> {
        if self.crank.in_crank.swap(true, Ordering::SeqCst) {
            return Err(KernelError::CrankProtocol("startCrank while already in a crank".into()));
        }
        debug_assert!(self
            .crank
            .savepoint_names
            .lock()
            .expect("savepoint name lock poisoned")
            .is_empty());
        Ok(())
    }

    /// Pushes a named savepoint; the underlying store savepoint is always
    /// `t<depth>`, reusing ordinals once a nested frame rolls back.
    pub fn create_savepoint(&self, name: impl Into<String>) -> KernelResult<()> {
        if !self.in_crank() {
            return Err(KernelError::CrankProtocol("createCrankSavepoint outside a crank".into()));
        }
        let mut names = self.crank.savepoint_names.lock().expect("savepoint name lock poisoned");
        let ordinal = names.len();
        self.store.create_savepoint(format!("t{ordinal}"));
        names.push(name.into());
        Ok(())
    }

    pub fn rollback_crank(&self, name: &str) -> KernelResult<()> {
        let mut names = self.crank.savepoint_names.lock().expect("savepoint name lock poisoned");
        let Some(position) = names.iter().rposition(|n| n == name) else {
            return Err(KernelError::SavepointMissing(name.to_string()));
        };
        self.store.rollback(&format!("t{position}"))?;
        names.truncate(position);
        Ok(())
    }

    pub fn release_all_savepoints(&self) {
        self.store.release_all_savepoints();
        self.crank.savepoint_names.lock().expect("savepoint name lock poisoned").clear();
    }

    pub fn end_crank(&self) -> KernelResult<()> {
        if !self.crank.in_crank.swap(false, Ordering::SeqCst) {
            return Err(KernelError::CrankProtocol("endCrank outside a crank".into()));
        }
        self.release_all_savepoints();
        self.crank.settled.notify_waiters();
        Ok(())
    }

    /// Settles immediately if no crank is active; otherwise waits for the
    /// next `end_crank`.
    pub async fn wait_for_crank(&self) {
        if !self.in_crank() {
            return;
        }
        let notified = self.crank.settled.notified();
        if self.in_crank() {
            notified.await;
        }
    }

    // ---- scheduling loop ----

    /// Picks the next item to dispatch: while a bootstrap is pending, the
    /// regular queue is drained first; otherwise a live GC batch (if any)
    /// is preferred over the next regular item (§4.B).
    fn next_item(&self) -> KernelResult<Option<RunQueueItem>> {
        if self.has_bootstrap_pending() {
            if let Some(item) = self.items_mut().pop_front() {
                return Ok(Some(item));
            }
        }

        if let Some(batch) = gc::drain_live_batch(&self.store)? {
            gc::remove_batch(&self.store, &batch)?;
            let item = match batch.kind {
                crate::store::GcActionKind::DropExport => {
                    RunQueueItem::GcDrop { endpoint: batch.endpoint, krefs: batch.krefs }
                }
                crate::store::GcActionKind::RetireExport | crate::store::GcActionKind::RetireImport => {
                    RunQueueItem::GcRetire { endpoint: batch.endpoint, krefs: batch.krefs }
                }
            };
            return Ok(Some(item));
        }

        Ok(self.items_mut().pop_front())
    }

    /// Pumps items until the queue and the GC action set are both empty.
    /// Each item is processed as its own crank: `start_crank`, dispatch,
    /// `end_crank` runs even if the dispatch returned an error, via a
    /// drop guard (§9 "scoped acquisition").
    pub async fn run(&self, dispatcher: &dyn Dispatcher) -> KernelResult<()> {
        loop {
            let Some(item) = self.next_item()? else {
                if self.store.gc_action_set()?.is_empty() && self.items_mut().is_empty() {
                    return Ok(());
                }
                continue;
            };

            self.start_crank()?;
            let span = tracing::info_span!("crank", item = ?crank_label(&item));
            let _entered = span.enter();
            let result = self.dispatch_and_settle(dispatcher, item).await;
            drop(_entered);
            result?;
        }
    }

    #[instrument(skip(self, dispatcher, item), fields(outcome))]
    async fn dispatch_and_settle(
        &self,
        dispatcher: &dyn Dispatcher,
        item: RunQueueItem,
    ) -> KernelResult<()> {
        struct EndCrankGuard<'a>(&'a KernelQueue);
        impl Drop for EndCrankGuard<'_> {
            fn drop(&mut self) {
                if let Err(err) = self.0.end_crank() {
                    tracing::error!(%err, "end_crank failed inside drop guard");
                }
            }
        }

        let guard = EndCrankGuard(self);
        let outcome = dispatcher.dispatch(item).await;
        Span::current().record("outcome", outcome.is_ok());
        drop(guard);
        outcome
    }

    pub fn clear_bootstrap_pending_for(&self, vat: EndpointId) {
        self.clear_bootstrap_pending(vat);
    }

    pub fn store(&self) -> &KernelStore {
        &self.store
    }
}

fn crank_label(item: &RunQueueItem) -> &'static str {
    match item {
        RunQueueItem::Send { .. } => "send",
        RunQueueItem::Notify { .. } => "notify",
        RunQueueItem::GcDrop { .. } => "gc_drop",
        RunQueueItem::GcRetire { .. } => "gc_retire",
        RunQueueItem::Bringout { .. } => "bringout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingDispatcher {
        seen: Mutex<Vec<RunQueueItem>>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, item: RunQueueItem) -> KernelResult<()> {
            self.seen.lock().unwrap().push(item);
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_drains_queue_and_settles() {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        let queue = KernelQueue::new(store);
        let koid = queue.store().create_object(EndpointId::vat(1)).unwrap();
        queue.enqueue_send(KRef::Object(koid), KernelCapData { body: "{}".into(), slots: vec![] }, None);

        let dispatcher = RecordingDispatcher { seen: Mutex::new(Vec::new()) };
        queue.run(&dispatcher).await.unwrap();
        assert_eq!(dispatcher.seen.lock().unwrap().len(), 1);
        assert!(!queue.in_crank());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn wait_for_crank_settles_after_end_crank() {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        let queue = Arc::new(KernelQueue::new(store));
        queue.start_crank().unwrap();

        let waiter_queue = queue.clone();
        let waiter = tokio::spawn(async move {
            waiter_queue.wait_for_crank().await;
        });

        tokio::task::yield_now().await;
        queue.end_crank().unwrap();
        waiter.await.unwrap();
    }

    #[test]
    fn rollback_to_unknown_savepoint_errors() {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        let queue = KernelQueue::new(store);
        queue.start_crank().unwrap();
        assert!(matches!(queue.rollback_crank("missing"), Err(KernelError::SavepointMissing(_))));
    }

    #[test]
    fn double_start_crank_is_a_protocol_error() {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        let queue = KernelQueue::new(store);
        queue.start_crank().unwrap();
        assert!(matches!(queue.start_crank(), Err(KernelError::CrankProtocol(_))));
    }
}
