//! Object-capability kernel: transactional message routing and reference
//! counted garbage collection between isolated vats.
//!
//! `Kernel` wires the store, run-queue, subcluster manager and facet
//! together and supplies the one piece none of them can provide on their
//! own: routing a `RunQueueItem` to the vat that owns its target. Everything
//! else is delegated straight through to the component that owns it.

pub mod config;
pub mod error;
pub mod facet;
pub mod gc;
pub mod ids;
pub mod message;
pub mod platform;
pub mod queue;
pub mod remote;
pub mod store;
pub mod subcluster;
pub mod vat;

use std::sync::Arc;

use async_trait::async_trait;

use config::KernelConfig;
use error::KernelResult;
use facet::KernelFacet;
use ids::{EndpointId, KRef, KpId};
use platform::PlatformServices;
use queue::{Dispatcher, KernelQueue, RunQueueItem};
use store::{Decider, KernelStore};
use subcluster::SubclusterManager;

pub use error::KernelError as Error;

/// The assembled kernel: store, scheduler, subcluster manager and facet,
/// plus the routing logic that turns a queued item into a delivery to a
/// specific `VatHandle` (§2, §4.B "Run-queue dispatch order").
pub struct Kernel {
    store: Arc<KernelStore>,
    queue: Arc<KernelQueue>,
    subclusters: Arc<SubclusterManager>,
    facet: Arc<KernelFacet>,
}

impl Kernel {
    pub fn open(config: &KernelConfig, platform: Arc<dyn PlatformServices>) -> KernelResult<Self> {
        let store = Arc::new(KernelStore::open(&config.store_path)?);
        Ok(Self::with_store(store, platform))
    }

    pub fn open_temporary(platform: Arc<dyn PlatformServices>) -> KernelResult<Self> {
        let store = Arc::new(KernelStore::open_temporary()?);
        Ok(Self::with_store(store, platform))
    }

    fn with_store(store: Arc<KernelStore>, platform: Arc<dyn PlatformServices>) -> Self {
        let queue = Arc::new(KernelQueue::new(store.clone()));
        let subclusters = Arc::new(SubclusterManager::new(store.clone(), queue.clone(), platform));
        let facet = Arc::new(KernelFacet::new(store.clone(), queue.clone(), subclusters.clone()));
        Self { store, queue, subclusters, facet }
    }

    pub fn store(&self) -> &Arc<KernelStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<KernelQueue> {
        &self.queue
    }

    pub fn subclusters(&self) -> &Arc<SubclusterManager> {
        &self.subclusters
    }

    pub fn facet(&self) -> &Arc<KernelFacet> {
        &self.facet
    }

    /// Pumps the run queue to quiescence, dispatching through `self`.
    pub async fn run(&self) -> KernelResult<()> {
        self.queue.run(self).await
    }

    /// Cross-incarnation wake detection (§4.A `detectWake`): compares the
    /// stored `lastActiveTime` against now.
    pub fn detect_wake(&self, config: &KernelConfig) -> KernelResult<bool> {
        self.store.detect_wake(now_millis(), config.wake_threshold)
    }

    /// Records the current time as the kernel's last-active mark; call this
    /// on graceful shutdown so the next incarnation's `detect_wake` has a
    /// meaningful baseline.
    pub fn shutdown(&self) -> KernelResult<()> {
        self.store.record_last_active_time(now_millis())
    }

    /// The owning endpoint of a kref: an object's `owner` field, or an
    /// unresolved promise's endpoint decider. A resolved promise or a
    /// kernel-decided promise has no owning endpoint to route a Send to.
    fn owner_of(&self, kref: KRef) -> KernelResult<Option<EndpointId>> {
        match kref {
            KRef::Object(koid) => Ok(self.store.get_object(koid)?.map(|object| object.owner)),
            KRef::Promise(kpid) => Ok(self.store.get_promise(kpid)?.and_then(|promise| match promise.decider {
                Some(Decider::Endpoint(ep)) => Some(ep),
                _ => None,
            })),
        }
    }

    fn reject_send(&self, result: Option<KpId>, kind: &str, target: KRef) -> KernelResult<()> {
        if let Some(kpid) = result {
            self.queue.resolve_promises(&[(
                kpid,
                true,
                format!("{{\"kind\":\"{kind}\",\"kref\":\"{target}\"}}"),
                Vec::new(),
            )])?;
        }
        Ok(())
    }

    /// Looks up the live `VatHandle` for `endpoint` and delivers; a
    /// terminated or never-launched endpoint rejects the item's result
    /// promise (if any) the same way a compromised vat would, since from
    /// the sender's perspective the two are indistinguishable (§4.B
    /// cancellation).
    async fn deliver_to(&self, endpoint: EndpointId, item: RunQueueItem, result: Option<KpId>) -> KernelResult<()> {
        let Some(handle) = self.subclusters.vat(endpoint) else {
            if let Some(kpid) = result {
                self.queue.resolve_promises(&[(
                    kpid,
                    true,
                    format!("{{\"kind\":\"VatCompromised\",\"endpoint\":\"{endpoint}\"}}"),
                    Vec::new(),
                )])?;
            }
            return Ok(());
        };
        handle.deliver(item).await
    }
}

/// What `Kernel::dispatch` decided about one `RunQueueItem` before it looks
/// at `item` itself again — computed from a plain reference so the borrow
/// it needs is over well before `item` is moved into `deliver_to`.
enum Route {
    Send { target: KRef, result: Option<KpId> },
    ToEndpoint { endpoint: EndpointId },
}

fn route(item: &RunQueueItem) -> Route {
    match item {
        RunQueueItem::Send { target, result, .. } => Route::Send { target: *target, result: *result },
        RunQueueItem::Notify { endpoint, .. }
        | RunQueueItem::GcDrop { endpoint, .. }
        | RunQueueItem::GcRetire { endpoint, .. }
        | RunQueueItem::Bringout { endpoint, .. } => Route::ToEndpoint { endpoint: *endpoint },
    }
}

#[async_trait]
impl Dispatcher for Kernel {
    async fn dispatch(&self, item: RunQueueItem) -> KernelResult<()> {
        match route(&item) {
            Route::Send { target, result } => {
                if let KRef::Object(koid) = target {
                    if self.store.is_revoked(koid)? {
                        return self.reject_send(result, "ObjectRevoked", target);
                    }
                }

                let Some(owner) = self.owner_of(target)? else {
                    return self.reject_send(result, "TargetNotFound", target);
                };

                self.queue.clear_bootstrap_pending_for(owner);
                self.deliver_to(owner, item, result).await
            }
            Route::ToEndpoint { endpoint } => self.deliver_to(endpoint, item, None).await,
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::message::KernelCapData;
    use crate::platform::{ClosureBehavior, LoopbackPlatform};
    use crate::store::{SubclusterConfig, VatSpec};
    use crate::vat::WireDelivery;

    #[tokio::test(flavor = "current_thread")]
    async fn send_to_revoked_object_rejects_without_dispatch() {
        let platform = Arc::new(LoopbackPlatform::new());
        let kernel = Kernel::open_temporary(platform).unwrap();

        let owner = EndpointId::vat(0);
        let koid = kernel.store().create_object(owner).unwrap();
        kernel.store().revoke(koid).unwrap();

        let kpid = kernel
            .queue()
            .enqueue_message(KRef::Object(koid), "{}".to_string(), Vec::new())
            .unwrap();
        kernel.run().await.unwrap();

        let promise = kernel.store().get_promise(kpid).unwrap().unwrap();
        assert_eq!(promise.state, crate::store::PromiseState::Rejected);
        assert!(promise.value.unwrap().contains("ObjectRevoked"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_to_unknown_target_rejects_without_dispatch() {
        let platform = Arc::new(LoopbackPlatform::new());
        let kernel = Kernel::open_temporary(platform).unwrap();

        let kpid = kernel.store().create_promise(Decider::Kernel).unwrap();
        kernel.queue().enqueue_send(
            KRef::Object(ids::KoId(9999)),
            KernelCapData { body: "{}".into(), slots: Vec::new() },
            Some(kpid),
        );
        kernel.run().await.unwrap();

        let promise = kernel.store().get_promise(kpid).unwrap().unwrap();
        assert_eq!(promise.state, crate::store::PromiseState::Rejected);
        assert!(promise.value.unwrap().contains("TargetNotFound"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn launch_subcluster_dispatches_bootstrap_through_kernel_run() {
        let received: Arc<Mutex<Vec<WireDelivery>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = received.clone();
        let behavior = ClosureBehavior(move |delivery: WireDelivery| {
            recorder.lock().expect("recorder lock poisoned").push(delivery);
            Vec::new()
        });
        let platform = Arc::new(LoopbackPlatform::new().with_behavior("alice.js", Arc::new(behavior)));
        let kernel = Kernel::open_temporary(platform).unwrap();

        let config = SubclusterConfig {
            bootstrap: "alice".into(),
            vats: vec![VatSpec { name: "alice".into(), source_spec: "alice.js".into() }],
            services: Vec::new(),
        };
        kernel.subclusters().launch_subcluster(config).await.unwrap();
        kernel.run().await.unwrap();

        let deliveries = received.lock().expect("recorder lock poisoned");
        assert_eq!(deliveries.len(), 1);
        assert!(matches!(deliveries[0], WireDelivery::Message { .. }));
    }

    #[test]
    fn detect_wake_round_trips_through_kernel() {
        let platform = Arc::new(LoopbackPlatform::new());
        let kernel = Kernel::open_temporary(platform).unwrap();
        kernel.shutdown().unwrap();
        let config = KernelConfig::default();
        assert!(!kernel.detect_wake(&config).unwrap());
    }
}
