//! Platform worker spawning (§6.1 `PlatformServices` contract).
//!
//! Platform-specific process/thread spawning is an external collaborator
//! per §1 — this crate only specifies the trait `SubclusterManager` drives
//! vat launches through, plus the in-memory loopback double that is the
//! only implementation shipped here (mirrors the teacher's pattern of
//! taking transport/IO collaborators as trait objects rather than owning a
//! concrete implementation, e.g. `knhk-sidecar`'s `ExecutorTransport`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::KernelResult;
use crate::ids::EndpointId;
use crate::vat::{Syscall, VatTransport, WireDelivery};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to launch vat: {0}")]
    LaunchFailed(String),
    #[error("failed to terminate vat: {0}")]
    TerminateFailed(String),
}

/// Launches and terminates vat workers, returning a bidirectional transport
/// per launch (§1). A real implementation spawns an OS process or thread and
/// frames messages over a pipe/socket; this crate ships only a test double.
#[async_trait]
pub trait PlatformServices: Send + Sync {
    async fn launch(
        &self,
        vat_id: EndpointId,
        source_spec: &str,
    ) -> Result<Arc<dyn VatTransport>, PlatformError>;

    async fn terminate(&self, vat_id: EndpointId) -> Result<(), PlatformError>;
}

/// A vat's response behavior to a delivery, decoupled from any particular
/// transport so the same behavior can be reused across tests that launch the
/// same `sourceSpec` under different vat ids.
#[async_trait]
pub trait VatBehavior: Send + Sync {
    async fn handle(&self, delivery: WireDelivery) -> KernelResult<Vec<Syscall>>;
}

/// A behavior that issues no syscalls in response to any delivery; the
/// default for a `sourceSpec` nobody registered an explicit behavior for.
pub struct NoopBehavior;

#[async_trait]
impl VatBehavior for NoopBehavior {
    async fn handle(&self, _delivery: WireDelivery) -> KernelResult<Vec<Syscall>> {
        Ok(Vec::new())
    }
}

/// Wraps a plain closure as a `VatBehavior`, for tests that want to script a
/// vat's reply inline rather than define a named type.
pub struct ClosureBehavior<F>(pub F);

#[async_trait]
impl<F> VatBehavior for ClosureBehavior<F>
where
    F: Fn(WireDelivery) -> Vec<Syscall> + Send + Sync,
{
    async fn handle(&self, delivery: WireDelivery) -> KernelResult<Vec<Syscall>> {
        Ok((self.0)(delivery))
    }
}

struct LoopbackTransport {
    behavior: Arc<dyn VatBehavior>,
}

#[async_trait]
impl VatTransport for LoopbackTransport {
    async fn deliver(&self, delivery: WireDelivery) -> KernelResult<Vec<Syscall>> {
        self.behavior.handle(delivery).await
    }
}

/// The in-memory loopback vat driven by a Rust closure (§6.1 expansion): the
/// only `PlatformServices` implementation this crate ships. Behaviors are
/// keyed by `sourceSpec` so a test can launch several vats sharing one
/// scripted behavior.
#[derive(Default)]
pub struct LoopbackPlatform {
    behaviors: HashMap<String, Arc<dyn VatBehavior>>,
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, source_spec: impl Into<String>, behavior: Arc<dyn VatBehavior>) -> Self {
        self.behaviors.insert(source_spec.into(), behavior);
        self
    }
}

#[async_trait]
impl PlatformServices for LoopbackPlatform {
    async fn launch(
        &self,
        _vat_id: EndpointId,
        source_spec: &str,
    ) -> Result<Arc<dyn VatTransport>, PlatformError> {
        let behavior = self
            .behaviors
            .get(source_spec)
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopBehavior));
        Ok(Arc::new(LoopbackTransport { behavior }))
    }

    async fn terminate(&self, _vat_id: EndpointId) -> Result<(), PlatformError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn unregistered_source_spec_gets_a_noop_behavior() {
        let platform = LoopbackPlatform::new();
        let transport = platform.launch(EndpointId::vat(0), "unknown.js").await.unwrap();
        let syscalls = transport.deliver(WireDelivery::BringOutYourDead).await.unwrap();
        assert!(syscalls.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registered_behavior_is_dispatched_by_source_spec() {
        let platform = LoopbackPlatform::new().with_behavior(
            "alice.js",
            Arc::new(ClosureBehavior(|_delivery| vec![Syscall::Exit { is_failure: false, info: "bye".into() }])),
        );
        let transport = platform.launch(EndpointId::vat(0), "alice.js").await.unwrap();
        let syscalls = transport.deliver(WireDelivery::BringOutYourDead).await.unwrap();
        assert_eq!(syscalls, vec![Syscall::Exit { is_failure: false, info: "bye".into() }]);
    }
}
