//! The privileged capability handed to system vats (§4.F).
//!
//! `KernelFacet` is a single, hardened object delegating a fixed, closed
//! method list to the kernel's own state; it is immutable after
//! construction — every method reaches through the `Arc`s bound at
//! construction time, never through a global. Mirrors the teacher's
//! `StateManager` (`knhk-workflow-engine/src/state/manager.rs`): a thin,
//! `Clone`-free façade over shared kernel state, handed out by reference
//! rather than duplicated.

use std::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::ids::{EndpointId, KRef, KpId, SubclusterId};
use crate::queue::KernelQueue;
use crate::store::{KernelStore, SubclusterConfig, SubclusterRecord};
use crate::subcluster::{LaunchOutcome, SubclusterManager};

/// The `getStatus()` reply: a narrow, serializable snapshot safe to expose
/// across the privileged boundary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KernelStatus {
    pub compromised_vats: Vec<EndpointId>,
    pub subcluster_count: usize,
}

pub struct KernelFacet {
    store: Arc<KernelStore>,
    queue: Arc<KernelQueue>,
    subclusters: Arc<SubclusterManager>,
}

impl KernelFacet {
    pub fn new(store: Arc<KernelStore>, queue: Arc<KernelQueue>, subclusters: Arc<SubclusterManager>) -> Self {
        Self { store, queue, subclusters }
    }

    /// Whether `kref` currently names a live object or promise; `iface` is
    /// accepted for forward compatibility with an interface-tagged presence
    /// scheme but is not interpreted (no interface registry exists, §1).
    pub fn get_presence(&self, kref: KRef, _iface: Option<&str>) -> KernelResult<bool> {
        Ok(match kref {
            KRef::Object(koid) => self.store.get_object(koid)?.is_some(),
            KRef::Promise(kpid) => self.store.get_promise(kpid)?.is_some(),
        })
    }

    pub fn get_status(&self) -> KernelResult<KernelStatus> {
        Ok(KernelStatus {
            compromised_vats: self.store.get_compromised_vats()?,
            subcluster_count: self.store.get_subclusters()?.len(),
        })
    }

    pub fn get_subcluster(&self, sid: SubclusterId) -> KernelResult<SubclusterRecord> {
        self.store.get_subcluster(sid)?.ok_or(KernelError::SubclusterNotFound(sid))
    }

    pub fn get_subclusters(&self) -> KernelResult<Vec<SubclusterId>> {
        self.store.get_subclusters()
    }

    /// The root presence of a named system subcluster, if one with that name
    /// was registered as a kernel service at bootstrap time (by convention
    /// under `systemSubclusterRoot.<name>`, alongside the plain
    /// `kernelService.<name>` entries §6.3 already names).
    pub fn get_system_subcluster_root(&self, name: &str) -> KernelResult<Option<KRef>> {
        self.store.get_kernel_service(&format!("systemSubclusterRoot.{name}"))
    }

    /// Queues a method invocation and returns its result promise; `method`
    /// is folded into the serialized body rather than given its own wire
    /// slot, since the vat-facing `CapData` body is already an opaque,
    /// positionally-addressed payload (§6.1).
    pub fn invoke_method(&self, target: KRef, method: &str, args: Vec<KRef>) -> KernelResult<KpId> {
        self.queue_message(target, method, args)
    }

    pub async fn launch_subcluster(&self, config: SubclusterConfig) -> KernelResult<LaunchOutcome> {
        self.subclusters.launch_subcluster(config).await
    }

    pub fn ping_vat(&self, vid: EndpointId) -> KernelResult<bool> {
        Ok(!self.store.is_vat_compromised(vid)?)
    }

    pub fn queue_message(&self, target: KRef, method: &str, args: Vec<KRef>) -> KernelResult<KpId> {
        let body = serde_json::json!({ "method": method }).to_string();
        self.queue.enqueue_message(target, body, args)
    }

    /// Terminates every live subcluster; the facet's own durably-registered
    /// kernel services are untouched (`reset` clears running state, not the
    /// service registry).
    pub async fn reset(&self) -> KernelResult<()> {
        for sid in self.store.get_subclusters()? {
            self.subclusters.terminate_subcluster(sid).await?;
        }
        Ok(())
    }

    pub async fn terminate_subcluster(&self, sid: SubclusterId) -> KernelResult<()> {
        self.subclusters.terminate_subcluster(sid).await
    }

    pub fn ping(&self) -> &'static str {
        "pong"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::LoopbackPlatform;

    fn facet() -> KernelFacet {
        let store = Arc::new(KernelStore::open_temporary().unwrap());
        let queue = Arc::new(KernelQueue::new(store.clone()));
        let subclusters = Arc::new(SubclusterManager::new(store.clone(), queue.clone(), Arc::new(LoopbackPlatform::new())));
        KernelFacet::new(store, queue, subclusters)
    }

    #[test]
    fn ping_replies_pong() {
        assert_eq!(facet().ping(), "pong");
    }

    #[test]
    fn get_status_reports_empty_kernel() {
        let status = facet().get_status().unwrap();
        assert_eq!(status.subcluster_count, 0);
        assert!(status.compromised_vats.is_empty());
    }

    #[test]
    fn get_subcluster_rejects_unknown_id() {
        let f = facet();
        let sid = SubclusterId { number: 7, system: false };
        assert!(matches!(f.get_subcluster(sid), Err(KernelError::SubclusterNotFound(_))));
    }
}
