//! Derives live GC actions from the durable action set and groups them into
//! dispatchable batches (§4.E).
//!
//! Kept as a pure function of `KernelStore` state rather than a stateful
//! engine: `drain_live_batch` is called by `KernelQueue::run` between
//! regular run-queue items and returns at most one batch per call, mirroring
//! `knhk-workflow-engine`'s preference for small, testable, store-driven
//! passes over a long-lived background worker.

use std::collections::BTreeMap;

use crate::error::KernelResult;
use crate::ids::{EndpointId, KRef};
use crate::store::{GcActionKind, KernelStore};

/// One dispatchable batch: all live krefs for a single `(endpoint, kind)`
/// bucket, already sorted lexicographically by their string form (§4.E).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcBatch {
    pub endpoint: EndpointId,
    pub kind: GcActionKind,
    pub krefs: Vec<KRef>,
}

/// True iff the action still reflects live kernel state (§4.E); actions
/// that no longer apply are dropped rather than dispatched.
fn is_live(store: &KernelStore, endpoint: EndpointId, kind: GcActionKind, kref: KRef) -> KernelResult<bool> {
    let has_clist = store.has_clist_entry(endpoint, kref)?;
    match kind {
        GcActionKind::DropExport => {
            let Some(koid) = kref.as_object() else { return Ok(false) };
            let Some(object) = store.get_object(koid)? else { return Ok(false) };
            Ok(object.reachable_count == 0 && has_clist)
        }
        GcActionKind::RetireExport => {
            let Some(koid) = kref.as_object() else { return Ok(false) };
            let Some(object) = store.get_object(koid)? else { return Ok(false) };
            Ok(object.reachable_count == 0 && object.recognizable_count == 0 && has_clist)
        }
        GcActionKind::RetireImport => Ok(has_clist),
    }
}

/// Scans the durable action set, drops actions that are no longer live, and
/// returns the highest-priority non-empty `(endpoint, kind)` bucket as one
/// batch. Returns `None` once the set is empty of live actions.
///
/// The caller (`KernelQueue::run`) is responsible for persisting the pruned
/// set and for re-deriving further actions once the batch's deliveries land.
pub fn drain_live_batch(store: &KernelStore) -> KernelResult<Option<GcBatch>> {
    let set = store.gc_action_set()?;
    if set.is_empty() {
        return Ok(None);
    }

    let mut buckets: BTreeMap<(EndpointId, GcActionKind), Vec<KRef>> = BTreeMap::new();
    let mut dead = Vec::new();
    for action in set.iter() {
        if is_live(store, action.endpoint, action.kind, action.kref)? {
            buckets.entry((action.endpoint, action.kind)).or_default().push(action.kref);
        } else {
            dead.push(action);
        }
    }
    for action in &dead {
        store.remove_gc_action(action)?;
    }

    let Some(((endpoint, kind), mut krefs)) = buckets
        .into_iter()
        .min_by_key(|((_, kind), _)| kind.priority())
    else {
        return Ok(None);
    };
    krefs.sort_by_key(|k| k.to_string());
    Ok(Some(GcBatch { endpoint, kind, krefs }))
}

/// Removes every action in a dispatched batch from the durable set; called
/// once the corresponding `GCDrop`/`GCRetire` run-queue item has been
/// enqueued, since dispatch (not delivery) is what retires the candidate.
pub fn remove_batch(store: &KernelStore, batch: &GcBatch) -> KernelResult<()> {
    for &kref in &batch.krefs {
        store.remove_gc_action(&crate::store::GcAction { endpoint: batch.endpoint, kind: batch.kind, kref })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::KoId;
    use crate::store::GcAction;

    #[test]
    fn dead_action_for_retired_clist_entry_is_pruned() {
        let store = KernelStore::open_temporary().unwrap();
        let ep = EndpointId::vat(1);
        let koid = store.create_object(ep).unwrap();
        // no c-list entry exists for this kref/endpoint pair, so the action is dead.
        store
            .insert_gc_action(GcAction {
                endpoint: ep,
                kind: GcActionKind::RetireImport,
                kref: KRef::Object(koid),
            })
            .unwrap();
        let batch = drain_live_batch(&store).unwrap();
        assert!(batch.is_none());
        assert!(store.gc_action_set().unwrap().is_empty());
    }

    #[test]
    fn drop_export_outranks_retire_import() {
        let store = KernelStore::open_temporary().unwrap();
        let ep = EndpointId::vat(2);

        let dropped = store.create_object(ep).unwrap();
        let eref_a = store.allocate_eref_for_kref(ep, KRef::Object(dropped)).unwrap();
        let _ = eref_a;
        store
            .insert_gc_action(GcAction {
                endpoint: ep,
                kind: GcActionKind::DropExport,
                kref: KRef::Object(dropped),
            })
            .unwrap();

        let retired = store.create_object(ep).unwrap();
        store.allocate_eref_for_kref(ep, KRef::Object(retired)).unwrap();
        store
            .insert_gc_action(GcAction {
                endpoint: ep,
                kind: GcActionKind::RetireImport,
                kref: KRef::Object(retired),
            })
            .unwrap();

        let batch = drain_live_batch(&store).unwrap().unwrap();
        assert_eq!(batch.kind, GcActionKind::DropExport);
        assert_eq!(batch.krefs, vec![KRef::Object(dropped)]);
    }
}
