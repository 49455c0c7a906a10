//! Groups cooperating vats under one id and orchestrates their joint
//! lifecycle (§4.D).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::instrument;

use crate::error::{KernelError, KernelResult};
use crate::ids::{EndpointId, SubclusterId};
use crate::message::KernelCapData;
use crate::platform::PlatformServices;
use crate::queue::KernelQueue;
use crate::store::{KernelStore, SubclusterConfig, SubclusterRecord, VatSpec};
use crate::vat::{VatHandle, VatTransport};

/// What `launchSubcluster` returns (§4.D step 7).
pub struct LaunchOutcome {
    pub subcluster_id: SubclusterId,
    pub root_kref: crate::ids::KRef,
    pub bootstrap_result: crate::ids::KpId,
}

/// Owns the live `VatHandle`s for every launched subcluster; `VatHandle`
/// itself is oblivious to subcluster membership (§2 dependency order).
pub struct SubclusterManager {
    store: Arc<KernelStore>,
    queue: Arc<KernelQueue>,
    platform: Arc<dyn PlatformServices>,
    next_subcluster_id: Mutex<u64>,
    next_vat_id: Mutex<u64>,
    vats: Mutex<HashMap<EndpointId, Arc<VatHandle>>>,
}

impl SubclusterManager {
    pub fn new(store: Arc<KernelStore>, queue: Arc<KernelQueue>, platform: Arc<dyn PlatformServices>) -> Self {
        Self {
            store,
            queue,
            platform,
            next_subcluster_id: Mutex::new(0),
            next_vat_id: Mutex::new(0),
            vats: Mutex::new(HashMap::new()),
        }
    }

    pub fn vat(&self, id: EndpointId) -> Option<Arc<VatHandle>> {
        self.vats.lock().expect("vat registry lock poisoned").get(&id).cloned()
    }

    fn allocate_subcluster_id(&self) -> SubclusterId {
        let mut next = self.next_subcluster_id.lock().expect("subcluster id lock poisoned");
        let id = SubclusterId { number: *next, system: false };
        *next += 1;
        id
    }

    #[instrument(skip(self, config))]
    pub async fn launch_subcluster(&self, config: SubclusterConfig) -> KernelResult<LaunchOutcome> {
        self.queue.wait_for_crank().await;

        if !config.vats.iter().any(|v| v.name == config.bootstrap) {
            return Err(KernelError::InvalidClusterConfig(format!(
                "bootstrap {:?} is not among the declared vats",
                config.bootstrap
            )));
        }

        let mut services = HashMap::new();
        for name in &config.services {
            let kref = self
                .store
                .get_kernel_service(name)?
                .ok_or_else(|| KernelError::KernelServiceMissing(name.clone()))?;
            services.insert(name.clone(), kref);
        }

        let sid = self.allocate_subcluster_id();
        let mut vat_ids = Vec::with_capacity(config.vats.len());
        let mut launched: Vec<(EndpointId, Arc<VatHandle>)> = Vec::new();
        let mut roots = HashMap::new();

        let launch_result = self.launch_declared_vats(&config, &mut vat_ids, &mut launched, &mut roots).await;
        if let Err(err) = launch_result {
            for (id, handle) in launched.into_iter().rev() {
                handle.mark_terminating();
                if let Err(teardown_err) = self.platform.terminate(id).await {
                    tracing::warn!(vat = %id, %teardown_err, "rollback teardown failed");
                }
            }
            return Err(err);
        }

        let record = SubclusterRecord {
            id: sid,
            config: config.clone(),
            vat_ids: vat_ids.clone(),
            bootstrap_vat: vat_ids[config
                .vats
                .iter()
                .position(|v| v.name == config.bootstrap)
                .expect("validated above")],
        };
        self.store.add_subcluster(&record)?;

        {
            let mut registry = self.vats.lock().expect("vat registry lock poisoned");
            for (id, handle) in launched {
                registry.insert(id, handle);
            }
        }

        let bootstrap_body = serde_json::json!({
            "roots": roots.iter().map(|(name, kref): (&String, &crate::ids::KRef)| (name.clone(), kref.to_string())).collect::<HashMap<_, _>>(),
            "services": services.iter().map(|(name, kref): (&String, &crate::ids::KRef)| (name.clone(), kref.to_string())).collect::<HashMap<_, _>>(),
        })
        .to_string();
        let slots: Vec<_> = roots.values().copied().chain(services.values().copied()).collect();

        self.queue.mark_bootstrap_pending(record.bootstrap_vat);
        let bootstrap_kpid = self.queue.enqueue_message(
            roots[&config.bootstrap],
            bootstrap_body,
            slots,
        )?;

        Ok(LaunchOutcome {
            subcluster_id: sid,
            root_kref: roots[&config.bootstrap],
            bootstrap_result: bootstrap_kpid,
        })
    }

    async fn launch_declared_vats(
        &self,
        config: &SubclusterConfig,
        vat_ids: &mut Vec<EndpointId>,
        launched: &mut Vec<(EndpointId, Arc<VatHandle>)>,
        roots: &mut HashMap<String, crate::ids::KRef>,
    ) -> KernelResult<()> {
        for spec in &config.vats {
            let (id, root, handle) = self.launch_one_vat(spec).await?;
            vat_ids.push(id);
            roots.insert(spec.name.clone(), root);
            launched.push((id, handle));
        }
        Ok(())
    }

    /// Launches one vat via the platform, mints the kernel-wide koid for
    /// its root presence, and wires a `VatHandle` around the returned
    /// transport (§4.D step 5).
    async fn launch_one_vat(
        &self,
        spec: &VatSpec,
    ) -> KernelResult<(EndpointId, crate::ids::KRef, Arc<VatHandle>)> {
        let id = self.next_vat_id();
        let transport = self
            .platform
            .launch(id, &spec.source_spec)
            .await
            .map_err(|e| KernelError::InvalidClusterConfig(format!("launch {} failed: {e}", spec.name)))?;
        let koid = self.store.create_object(id)?;
        self.store.add_clist_entry(
            id,
            crate::ids::KRef::Object(koid),
            crate::ids::LocalRef::object(0, crate::ids::Direction::Exported),
        )?;
        let handle = Arc::new(VatHandle::new(id, self.store.clone(), self.queue.clone(), transport));
        Ok((id, crate::ids::KRef::Object(koid), handle))
    }

    /// Allocated from a dedicated counter, not the live registry's length:
    /// the registry isn't populated until the whole launch loop finishes
    /// (`launch_subcluster` inserts every handle in one batch after
    /// `launch_declared_vats` returns), so a length-derived id would hand
    /// out the same `EndpointId` to every vat in one multi-vat launch.
    fn next_vat_id(&self) -> EndpointId {
        let mut next = self.next_vat_id.lock().expect("vat id lock poisoned");
        let id = EndpointId::vat(*next);
        *next += 1;
        id
    }

    #[instrument(skip(self))]
    pub async fn terminate_subcluster(&self, sid: SubclusterId) -> KernelResult<()> {
        self.queue.wait_for_crank().await;
        let record = self.store.get_subcluster(sid)?.ok_or(KernelError::SubclusterNotFound(sid))?;

        for &vid in record.vat_ids.iter().rev() {
            if let Err(err) = self.teardown_vat(vid).await {
                tracing::warn!(vat = %vid, %err, "vat teardown failed during terminate_subcluster");
            }
        }
        self.store.delete_subcluster(sid)?;
        Ok(())
    }

    /// Rejects pending promises this vat decides, clears its c-list entries
    /// (decrementing counts), and asks the platform to tear down the
    /// worker. Best-effort: always runs to completion (§4.D step 2, full
    /// cleanup path — the canonical resolution of the disconnectSystemVat
    /// open question).
    async fn teardown_vat(&self, vid: EndpointId) -> KernelResult<()> {
        for kpid in self.store.scan_promises_decided_by(vid)? {
            self.queue.resolve_promises(&[(
                kpid,
                true,
                format!("{{\"kind\":\"VatTerminated\",\"endpoint\":\"{vid}\"}}"),
                Vec::new(),
            )])?;
        }

        for (kref, eref) in self.store.scan_clist_entries(vid)? {
            if let crate::ids::KRef::Object(koid) = kref {
                let is_export = eref.direction() == crate::ids::Direction::Exported;
                self.store.decrement_ref_count(vid, koid, is_export, false)?;
            }
            self.store.delete_clist_entry(vid, kref, eref)?;
        }

        let handle = self.vats.lock().expect("vat registry lock poisoned").remove(&vid);
        if let Some(h) = &handle {
            h.mark_terminating();
        }
        self.store.mark_vat_as_compromised(vid)?;
        self.platform.terminate(vid).await.map_err(|e| KernelError::SyscallFailed(e.to_string()))?;
        if let Some(h) = handle {
            h.mark_terminated();
        }
        Ok(())
    }

    pub async fn reload_subcluster(&self, sid: SubclusterId) -> KernelResult<LaunchOutcome> {
        let record = self.store.get_subcluster(sid)?.ok_or(KernelError::SubclusterNotFound(sid))?;
        self.terminate_subcluster(sid).await?;
        self.launch_subcluster(record.config).await
    }
}
