//! The kernel's durable state (§4.A): c-lists, refcounts, the promise
//! table, object owners, subclusters, and the GC action set, all layered
//! over an embedded `sled` database using the stable key schema in §6.3.
//!
//! Mirrors `knhk-workflow-engine::state::store::StateStore`: a thin,
//! synchronous, typed-accessor layer over a raw `sled::Db`, with
//! `serde_json` for anything structured. `sled` has no native named
//! savepoint API, so the crank savepoint stack specified in §4.B is
//! implemented here as an in-memory undo log recorded alongside each
//! mutation and replayed in reverse on rollback — see `savepoint` below.

mod keys;
pub mod model;

use std::collections::HashSet;
use std::sync::Mutex;

use sled::Db;

use crate::error::{KernelError, KernelResult, StoreError};
use crate::ids::{EndpointId, KRef, KoId, KpId, LocalRef, SubclusterId};
pub use model::{
    Decider, GcAction, GcActionKind, GcActionSet, KernelObject, KernelPromise, PromiseState,
    RemoteInfo, SubclusterConfig, SubclusterRecord, VatSpec,
};

/// One recorded mutation, enough to undo it: the key and the value that was
/// there immediately before the write (`None` if the key didn't exist).
enum UndoEntry {
    Write { key: String, previous: Option<Vec<u8>> },
}

/// A named frame on the crank savepoint stack; `ordinal` is the frame's
/// depth at creation time (`t<ordinal>` in spec terms), reused once the
/// frame above it rolls back.
struct SavepointFrame {
    name: String,
    undo: Vec<UndoEntry>,
}

pub struct KernelStore {
    db: Db,
    savepoints: Mutex<Vec<SavepointFrame>>,
}

impl KernelStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> KernelResult<Self> {
        let db = sled::open(path).map_err(StoreError::from)?;
        Ok(Self { db, savepoints: Mutex::new(Vec::new()) })
    }

    /// In-memory store for tests and loopback platform services; never
    /// durable across process restarts. Not test-gated: integration tests
    /// outside this crate's own `#[cfg(test)]` unit tests, and `Kernel`'s own
    /// test-harness constructor, both need it as ordinary public API.
    pub fn open_temporary() -> KernelResult<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(StoreError::from)?;
        Ok(Self { db, savepoints: Mutex::new(Vec::new()) })
    }

    // ---- savepoint stack (backs KernelQueue's crank lifecycle, §4.B) ----

    pub fn create_savepoint(&self, name: impl Into<String>) {
        self.savepoints
            .lock()
            .expect("savepoint stack lock poisoned")
            .push(SavepointFrame { name: name.into(), undo: Vec::new() });
    }

    /// Rolls back to the named savepoint: undoes every write recorded since
    /// it (and since any savepoint nested after it) and removes those
    /// frames from the stack. Fails with `SavepointMissing` if `name` is
    /// not currently on the stack (§7).
    pub fn rollback(&self, name: &str) -> KernelResult<()> {
        let mut stack = self.savepoints.lock().expect("savepoint stack lock poisoned");
        let Some(position) = stack.iter().rposition(|frame| frame.name == name) else {
            return Err(KernelError::SavepointMissing(name.to_string()));
        };
        let removed: Vec<_> = stack.drain(position..).collect();
        drop(stack);
        for frame in removed.into_iter().rev() {
            for entry in frame.undo.into_iter().rev() {
                let UndoEntry::Write { key, previous } = entry;
                match previous {
                    Some(bytes) => {
                        self.db.insert(key.as_bytes(), bytes).map_err(StoreError::from)?;
                    }
                    None => {
                        self.db.remove(key.as_bytes()).map_err(StoreError::from)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases every savepoint from `t0` (the bottom of the stack): the
    /// underlying KV collapses descendants, so this is simply clearing the
    /// in-memory stack without replaying any undo entries.
    pub fn release_all_savepoints(&self) {
        self.savepoints.lock().expect("savepoint stack lock poisoned").clear();
    }

    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.lock().expect("savepoint stack lock poisoned").len()
    }

    fn record_undo(&self, key: &str, previous: Option<Vec<u8>>) {
        if let Some(frame) = self.savepoints.lock().expect("savepoint stack lock poisoned").last_mut() {
            frame.undo.push(UndoEntry::Write { key: key.to_string(), previous });
        }
    }

    fn put_raw(&self, key: &str, value: &[u8]) -> KernelResult<()> {
        let previous = self.db.insert(key.as_bytes(), value).map_err(StoreError::from)?;
        self.record_undo(key, previous.map(|v| v.to_vec()));
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> KernelResult<()> {
        let previous = self.db.remove(key.as_bytes()).map_err(StoreError::from)?;
        self.record_undo(key, previous.map(|v| v.to_vec()));
        Ok(())
    }

    fn get_raw(&self, key: &str) -> KernelResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes()).map_err(StoreError::from)?.map(|v| v.to_vec()))
    }

    fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> KernelResult<()> {
        let bytes = serde_json::to_vec(value).map_err(StoreError::from)?;
        self.put_raw(key, &bytes)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> KernelResult<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_u64(&self, key: &str, value: u64) -> KernelResult<()> {
        self.put_raw(key, value.to_string().as_bytes())
    }

    fn get_u64(&self, key: &str) -> KernelResult<Option<u64>> {
        match self.get_raw(key)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| {
                    KernelError::from(StoreError::MalformedValue {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })
                })?;
                let n = text.parse().map_err(|e: std::num::ParseIntError| {
                    KernelError::from(StoreError::MalformedValue {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })
                })?;
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    // ---- c-list (§4.A "Base / c-list") ----

    pub fn has_clist_entry(&self, ep: EndpointId, kref: KRef) -> KernelResult<bool> {
        Ok(self.get_raw(&keys::clist_forward(ep, kref))?.is_some())
    }

    pub fn add_clist_entry(&self, ep: EndpointId, kref: KRef, eref: LocalRef) -> KernelResult<()> {
        debug_assert!(
            !self.has_clist_entry(ep, kref)?,
            "addCListEntry precondition: kref not already mapped for {ep}"
        );
        let entry = ClistEntryValue { eref: eref.to_string(), reachable: true };
        self.put_json(&keys::clist_forward(ep, kref), &entry)?;
        self.put_raw(&keys::clist_reverse(ep, &eref.to_string()), kref.to_string().as_bytes())?;
        Ok(())
    }

    pub fn kref_to_eref(&self, ep: EndpointId, kref: KRef) -> KernelResult<Option<LocalRef>> {
        let entry: Option<ClistEntryValue> = self.get_json(&keys::clist_forward(ep, kref))?;
        entry.map(|e| e.eref.parse()).transpose()
    }

    pub fn eref_to_kref(&self, ep: EndpointId, eref: LocalRef) -> KernelResult<Option<KRef>> {
        match self.get_raw(&keys::clist_reverse(ep, &eref.to_string()))? {
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| {
                    KernelError::StoreCorruption(format!("non-utf8 kref for {ep}/{eref}: {e}"))
                })?;
                Ok(Some(text.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Clears the reachable flag: "dropped, not retired" (§3.2 CListEntry).
    pub fn clear_reachable_flag(&self, ep: EndpointId, kref: KRef) -> KernelResult<()> {
        let key = keys::clist_forward(ep, kref);
        let Some(mut entry): Option<ClistEntryValue> = self.get_json(&key)? else {
            return Err(KernelError::StoreCorruption(format!(
                "clear_reachable_flag: no c-list entry for {ep}/{kref}"
            )));
        };
        entry.reachable = false;
        self.put_json(&key, &entry)
    }

    /// Clears both directions of a c-list entry, decrementing the matching
    /// refcount (`is_export` chooses which half to decrement — see
    /// `decrement_ref_count`).
    pub fn delete_clist_entry(&self, ep: EndpointId, kref: KRef, eref: LocalRef) -> KernelResult<()> {
        self.delete_raw(&keys::clist_forward(ep, kref))?;
        self.delete_raw(&keys::clist_reverse(ep, &eref.to_string()))?;
        Ok(())
    }

    pub fn forget_eref(&self, ep: EndpointId, eref: LocalRef) -> KernelResult<()> {
        self.delete_raw(&keys::clist_reverse(ep, &eref.to_string()))
    }

    pub fn forget_kref(&self, ep: EndpointId, kref: KRef) -> KernelResult<()> {
        self.delete_raw(&keys::clist_forward(ep, kref))
    }

    pub fn krefs_to_existing_erefs(
        &self,
        ep: EndpointId,
        krefs: &[KRef],
    ) -> KernelResult<Vec<(KRef, LocalRef)>> {
        let mut found = Vec::new();
        for &kref in krefs {
            if let Some(eref) = self.kref_to_eref(ep, kref)? {
                found.push((kref, eref));
            }
        }
        Ok(found)
    }

    /// Allocates the next `o-N`/`p-N` for a first-crossing import and adds
    /// the c-list entry in one step (§4.A).
    pub fn allocate_eref_for_kref(&self, ep: EndpointId, kref: KRef) -> KernelResult<LocalRef> {
        let eref = match kref {
            KRef::Object(_) => {
                let n = self.next_id(&keys::next_object_id(ep))?;
                LocalRef::object(n, crate::ids::Direction::Imported)
            }
            KRef::Promise(_) => {
                let n = self.next_id(&keys::next_promise_id(ep))?;
                LocalRef::promise(n, crate::ids::Direction::Imported)
            }
        };
        self.add_clist_entry(ep, kref, eref)?;
        Ok(eref)
    }

    fn next_id(&self, key: &str) -> KernelResult<u64> {
        let current = self.get_u64(key)?.unwrap_or(0);
        self.put_u64(key, current + 1)?;
        Ok(current)
    }

    /// Mints a new promise with `Decider::Endpoint(ep)` for a vat-originated
    /// result ref that has no kernel mapping yet, and registers the c-list
    /// entry for it in the same step (§8 scenario 2 "Send with result
    /// promise": "allocates kp7, decider = A").
    pub fn allocate_kref_for_new_promise(&self, ep: EndpointId, eref: LocalRef) -> KernelResult<KpId> {
        let kpid = self.create_promise(Decider::Endpoint(ep))?;
        self.add_clist_entry(ep, KRef::Promise(kpid), eref)?;
        Ok(kpid)
    }

    // ---- objects & refcounts (§4.A "Refcount & reachability") ----

    pub fn create_object(&self, owner: EndpointId) -> KernelResult<KoId> {
        let n = self.next_id(keys::NEXT_KOID)?;
        let koid = KoId(n);
        let object = KernelObject::new(owner);
        self.put_json(&keys::object_owner(koid), &object.owner)?;
        self.put_u64(&keys::object_reachable(koid), object.reachable_count)?;
        self.put_u64(&keys::object_recognizable(koid), object.recognizable_count)?;
        self.put_json(&keys::object_revoked(koid), &object.revoked)?;
        Ok(koid)
    }

    pub fn get_object(&self, koid: KoId) -> KernelResult<Option<KernelObject>> {
        let Some(owner) = self.get_json(&keys::object_owner(koid))? else {
            return Ok(None);
        };
        let reachable_count = self.get_u64(&keys::object_reachable(koid))?.unwrap_or(0);
        let recognizable_count = self.get_u64(&keys::object_recognizable(koid))?.unwrap_or(0);
        let revoked = self.get_json(&keys::object_revoked(koid))?.unwrap_or(false);
        Ok(Some(KernelObject { owner, reachable_count, recognizable_count, revoked }))
    }

    /// Revocation is monotonic: once true, never reset back to false (§3.2).
    pub fn revoke(&self, koid: KoId) -> KernelResult<()> {
        self.put_json(&keys::object_revoked(koid), &true)
    }

    pub fn is_revoked(&self, koid: KoId) -> KernelResult<bool> {
        Ok(self.get_json(&keys::object_revoked(koid))?.unwrap_or(false))
    }

    pub fn increment_reachable(&self, koid: KoId) -> KernelResult<u64> {
        let n = self.get_u64(&keys::object_reachable(koid))?.unwrap_or(0) + 1;
        self.put_u64(&keys::object_reachable(koid), n)?;
        let recognizable = self.get_u64(&keys::object_recognizable(koid))?.unwrap_or(0);
        if n > recognizable {
            self.put_u64(&keys::object_recognizable(koid), n)?;
        }
        Ok(n)
    }

    /// Applies one half of the reachable/recognizable pair (`only_recognizable`
    /// selects which half) and, when a count crosses to zero, inserts the
    /// matching GC action (§4.A `decrementRefCount`).
    pub fn decrement_ref_count(
        &self,
        ep: EndpointId,
        koid: KoId,
        is_export: bool,
        only_recognizable: bool,
    ) -> KernelResult<()> {
        let reachable_key = keys::object_reachable(koid);
        let recognizable_key = keys::object_recognizable(koid);

        if !only_recognizable {
            let reachable = self.get_u64(&reachable_key)?.unwrap_or(0).saturating_sub(1);
            self.put_u64(&reachable_key, reachable)?;
            if reachable == 0 {
                let kind =
                    if is_export { GcActionKind::DropExport } else { GcActionKind::RetireImport };
                self.insert_gc_action(GcAction { endpoint: ep, kind, kref: KRef::Object(koid) })?;
            }
        }

        let recognizable = self.get_u64(&recognizable_key)?.unwrap_or(0).saturating_sub(1);
        self.put_u64(&recognizable_key, recognizable)?;
        let reachable_now = self.get_u64(&reachable_key)?.unwrap_or(0);
        if recognizable == 0 && reachable_now == 0 && is_export {
            self.insert_gc_action(GcAction {
                endpoint: ep,
                kind: GcActionKind::RetireExport,
                kref: KRef::Object(koid),
            })?;
        }
        Ok(())
    }

    // ---- promise table (§4.A "Promise table") ----

    pub fn create_promise(&self, decider: Decider) -> KernelResult<KpId> {
        let n = self.next_id(keys::NEXT_KPID)?;
        let kpid = KpId(n);
        self.put_json(&keys::promise_state(kpid), &PromiseState::Unresolved)?;
        self.put_json(&keys::promise_decider(kpid), &Some(decider))?;
        self.put_json(&keys::promise_subscribers(kpid), &Vec::<EndpointId>::new())?;
        self.put_json(&keys::promise_slots(kpid), &Vec::<KRef>::new())?;
        Ok(kpid)
    }

    pub fn get_promise(&self, kpid: KpId) -> KernelResult<Option<KernelPromise>> {
        let Some(state) = self.get_json(&keys::promise_state(kpid))? else {
            return Ok(None);
        };
        let decider = self.get_json(&keys::promise_decider(kpid))?.unwrap_or(None);
        let subscribers = self.get_json(&keys::promise_subscribers(kpid))?.unwrap_or_default();
        let value = self.get_json(&keys::promise_value(kpid))?;
        let resolution_slots = self.get_json(&keys::promise_slots(kpid))?.unwrap_or_default();
        Ok(Some(KernelPromise { state, decider, subscribers, value, resolution_slots }))
    }

    pub fn subscribe(&self, kpid: KpId, ep: EndpointId) -> KernelResult<()> {
        let key = keys::promise_subscribers(kpid);
        let mut subscribers: Vec<EndpointId> = self.get_json(&key)?.unwrap_or_default();
        if !subscribers.contains(&ep) {
            subscribers.push(ep);
        }
        self.put_json(&key, &subscribers)
    }

    /// Clears `subscribers` once every Notify for this resolution has been
    /// enqueued (§3.2 invariant).
    pub fn clear_subscribers(&self, kpid: KpId) -> KernelResult<()> {
        self.put_json(&keys::promise_subscribers(kpid), &Vec::<EndpointId>::new())
    }

    pub fn resolve_promise(
        &self,
        kpid: KpId,
        rejected: bool,
        value: String,
        slots: Vec<KRef>,
    ) -> KernelResult<()> {
        let state = if rejected { PromiseState::Rejected } else { PromiseState::Fulfilled };
        self.put_json(&keys::promise_state(kpid), &state)?;
        self.put_json(&keys::promise_decider(kpid), &Option::<Decider>::None)?;
        self.put_json(&keys::promise_value(kpid), &value)?;
        self.put_json(&keys::promise_slots(kpid), &slots)?;
        Ok(())
    }

    // ---- subclusters (§4.A "Subclusters / vats") ----

    pub fn add_subcluster(&self, record: &SubclusterRecord) -> KernelResult<()> {
        self.put_json(&keys::subcluster_config(record.id), &record.config)?;
        self.put_json(&keys::subcluster_vats(record.id), &record.vat_ids)?;
        for &vid in &record.vat_ids {
            self.put_json(&keys::vat_subcluster(vid), &record.id)?;
        }
        Ok(())
    }

    pub fn get_subcluster(&self, sid: SubclusterId) -> KernelResult<Option<SubclusterRecord>> {
        let Some(config): Option<SubclusterConfig> = self.get_json(&keys::subcluster_config(sid))?
        else {
            return Ok(None);
        };
        let vat_ids: Vec<EndpointId> = self.get_json(&keys::subcluster_vats(sid))?.unwrap_or_default();
        let bootstrap_index = config
            .vats
            .iter()
            .position(|v| v.name == config.bootstrap)
            .expect("bootstrap was validated to name a declared vat at launch time");
        let bootstrap_vat = vat_ids[bootstrap_index];
        Ok(Some(SubclusterRecord { id: sid, config, vat_ids, bootstrap_vat }))
    }

    pub fn get_subcluster_vats(&self, sid: SubclusterId) -> KernelResult<Vec<EndpointId>> {
        Ok(self.get_json(&keys::subcluster_vats(sid))?.unwrap_or_default())
    }

    pub fn get_vat_subcluster(&self, vid: EndpointId) -> KernelResult<Option<SubclusterId>> {
        self.get_json(&keys::vat_subcluster(vid))
    }

    pub fn delete_subcluster(&self, sid: SubclusterId) -> KernelResult<()> {
        let vat_ids = self.get_subcluster_vats(sid)?;
        for vid in vat_ids {
            self.delete_raw(&keys::vat_subcluster(vid))?;
        }
        self.delete_raw(&keys::subcluster_config(sid))?;
        self.delete_raw(&keys::subcluster_vats(sid))?;
        Ok(())
    }

    /// Every currently-registered subcluster id, by scanning the
    /// `subcluster.<sid>` config prefix (§4.A `getSubclusters`). The trailing
    /// dot keeps this from matching the unrelated `subclusterVats.<sid>` keys.
    pub fn get_subclusters(&self) -> KernelResult<Vec<SubclusterId>> {
        let prefix = "subcluster.";
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(StoreError::from)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| KernelError::StoreCorruption(format!("non-utf8 subcluster key: {e}")))?;
            let suffix = &key[prefix.len()..];
            out.push(suffix.parse()?);
        }
        Ok(out)
    }

    // ---- compromise & activity (§4.A) ----

    pub fn mark_vat_as_compromised(&self, vid: EndpointId) -> KernelResult<()> {
        let mut set = self.get_compromised_vats_set()?;
        set.insert(vid);
        self.put_compromised_vats_set(&set)
    }

    pub fn clear_vat_compromised_status(&self, vid: EndpointId) -> KernelResult<()> {
        let mut set = self.get_compromised_vats_set()?;
        set.remove(&vid);
        self.put_compromised_vats_set(&set)
    }

    pub fn is_vat_compromised(&self, vid: EndpointId) -> KernelResult<bool> {
        Ok(self.get_compromised_vats_set()?.contains(&vid))
    }

    pub fn get_compromised_vats(&self) -> KernelResult<Vec<EndpointId>> {
        Ok(self.get_compromised_vats_set()?.into_iter().collect())
    }

    fn get_compromised_vats_set(&self) -> KernelResult<HashSet<EndpointId>> {
        let vats: Vec<EndpointId> = self.get_json(keys::COMPROMISED_VATS)?.unwrap_or_default();
        Ok(vats.into_iter().collect())
    }

    fn put_compromised_vats_set(&self, set: &HashSet<EndpointId>) -> KernelResult<()> {
        let vats: Vec<EndpointId> = set.iter().copied().collect();
        self.put_json(keys::COMPROMISED_VATS, &vats)
    }

    /// Compares the stored `lastActiveTime` to now; true if the gap exceeds
    /// `threshold` (one hour by default, §4.A).
    pub fn detect_wake(&self, now_millis: u64, threshold: std::time::Duration) -> KernelResult<bool> {
        let Some(last) = self.get_u64(keys::LAST_ACTIVE_TIME)? else {
            return Ok(false);
        };
        Ok(now_millis.saturating_sub(last) > threshold.as_millis() as u64)
    }

    pub fn record_last_active_time(&self, now_millis: u64) -> KernelResult<()> {
        self.put_u64(keys::LAST_ACTIVE_TIME, now_millis)
    }

    // ---- GC action set (§4.A, §4.E) ----

    pub fn gc_action_set(&self) -> KernelResult<GcActionSet> {
        Ok(self.get_json(keys::GC_ACTIONS)?.unwrap_or_default())
    }

    pub fn insert_gc_action(&self, action: GcAction) -> KernelResult<()> {
        let mut set = self.gc_action_set()?;
        set.insert(action);
        self.put_json(keys::GC_ACTIONS, &set)
    }

    pub fn remove_gc_action(&self, action: &GcAction) -> KernelResult<()> {
        let mut set = self.gc_action_set()?;
        set.remove(action);
        self.put_json(keys::GC_ACTIONS, &set)
    }

    pub fn replace_gc_action_set(&self, set: &GcActionSet) -> KernelResult<()> {
        self.put_json(keys::GC_ACTIONS, set)
    }

    /// Every `(kref, eref)` c-list entry this endpoint currently owns, by
    /// scanning its `e.<ep>.*` prefix and keeping only the forward
    /// (`koN`/`kpN`-suffixed) half. Used by subcluster teardown to clear a
    /// terminated vat's c-list in full (§4.D, §9 "full-cleanup path").
    pub fn scan_clist_entries(&self, ep: EndpointId) -> KernelResult<Vec<(KRef, LocalRef)>> {
        let prefix = format!("e.{ep}.");
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.map_err(StoreError::from)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| KernelError::StoreCorruption(format!("non-utf8 clist key: {e}")))?;
            let suffix = &key[prefix.len()..];
            if !(suffix.starts_with("ko") || suffix.starts_with("kp")) {
                continue;
            }
            let kref: KRef = suffix.parse()?;
            let entry: ClistEntryValue = serde_json::from_slice(&value).map_err(StoreError::from)?;
            let eref: LocalRef = entry.eref.parse()?;
            out.push((kref, eref));
        }
        Ok(out)
    }

    /// Every outstanding promise whose decider is `ep`, by scanning
    /// `kp.*.decider` keys. O(n) in the number of live promises; acceptable
    /// for the teardown path, which already touches every c-list entry.
    pub fn scan_promises_decided_by(&self, ep: EndpointId) -> KernelResult<Vec<KpId>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(b"kp") {
            let (key, _) = entry.map_err(StoreError::from)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| KernelError::StoreCorruption(format!("non-utf8 promise key: {e}")))?;
            let Some(kref_part) = key.strip_suffix(".decider") else { continue };
            // The decider key holds `Option<Decider>`: `null` for a resolved
            // promise, so this must deserialize to the outer `Option`, not
            // `Decider` directly — a direct `Decider` target turns every
            // `null` into a deserialize error and aborts the whole scan.
            if let Some(Decider::Endpoint(decider_ep)) = self.get_json::<Option<Decider>>(&key)?.flatten() {
                if decider_ep == ep {
                    if let Some(kpid) = kref_part.parse::<KRef>()?.as_promise() {
                        out.push(kpid);
                    }
                }
            }
        }
        Ok(out)
    }

    // ---- per-vat persistent scratch map (§4.C) ----

    pub fn vatstore_get(&self, vid: EndpointId, key: &str) -> KernelResult<Option<String>> {
        match self.get_raw(&keys::vatstore_entry(vid, key))? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes).map_err(|e| {
                KernelError::StoreCorruption(format!("non-utf8 vatstore value for {vid}/{key}: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn vatstore_set(&self, vid: EndpointId, key: &str, value: &str) -> KernelResult<()> {
        self.put_raw(&keys::vatstore_entry(vid, key), value.as_bytes())
    }

    pub fn vatstore_delete(&self, vid: EndpointId, key: &str) -> KernelResult<()> {
        self.delete_raw(&keys::vatstore_entry(vid, key))
    }

    /// Lexicographically next key strictly after `after` (or the first key
    /// if `after` is `None`), scoped to this vat's scratch map.
    pub fn vatstore_next_key(&self, vid: EndpointId, after: Option<&str>) -> KernelResult<Option<String>> {
        let prefix = keys::vatstore_prefix(vid);
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(StoreError::from)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| KernelError::StoreCorruption(format!("non-utf8 vatstore key: {e}")))?;
            let suffix = &key[prefix.len()..];
            match after {
                Some(after) if suffix <= after => continue,
                _ => return Ok(Some(suffix.to_string())),
            }
        }
        Ok(None)
    }

    // ---- kernel services (§4.F) ----

    pub fn register_kernel_service(&self, name: &str, kref: KRef) -> KernelResult<()> {
        self.put_raw(&keys::kernel_service(name), kref.to_string().as_bytes())
    }

    pub fn get_kernel_service(&self, name: &str) -> KernelResult<Option<KRef>> {
        match self.get_raw(&keys::kernel_service(name))? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| KernelError::StoreCorruption(format!("bad service kref: {e}")))?;
                Ok(Some(text.parse()?))
            }
            None => Ok(None),
        }
    }

    // ---- remote adapter (§4.G) ----

    pub fn remote_seq_get(&self, rid: EndpointId, field: &str) -> KernelResult<u64> {
        Ok(self.get_u64(&keys::remote_seq(rid, field))?.unwrap_or(0))
    }

    /// Unlike `remote_seq_get`, does not default to zero: lets callers tell
    /// "never recorded" apart from "recorded as zero", which matters for the
    /// first-message edge case on `highestReceivedSeq` (§4.G).
    pub fn remote_seq_get_opt(&self, rid: EndpointId, field: &str) -> KernelResult<Option<u64>> {
        self.get_u64(&keys::remote_seq(rid, field))
    }

    pub fn remote_seq_put(&self, rid: EndpointId, field: &str, value: u64) -> KernelResult<()> {
        self.put_u64(&keys::remote_seq(rid, field), value)
    }

    pub fn put_remote_info(&self, rid: EndpointId, info: &RemoteInfo) -> KernelResult<()> {
        self.put_json(&keys::remote_info(rid), info)
    }

    pub fn get_remote_info(&self, rid: EndpointId) -> KernelResult<Option<RemoteInfo>> {
        self.get_json(&keys::remote_info(rid))
    }

    pub fn remote_pending_put(&self, rid: EndpointId, seq: u64, message: &[u8]) -> KernelResult<()> {
        self.put_raw(&keys::remote_pending(rid, seq), message)
    }

    pub fn remote_pending_delete(&self, rid: EndpointId, seq: u64) -> KernelResult<()> {
        self.delete_raw(&keys::remote_pending(rid, seq))
    }

    /// Iterates the outbox in ascending sequence order, by scanning the
    /// prefix and parsing the trailing sequence number out of each key.
    pub fn remote_pending_iter(&self, rid: EndpointId) -> KernelResult<Vec<(u64, Vec<u8>)>> {
        let prefix = keys::remote_pending_prefix(rid);
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry.map_err(StoreError::from)?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| KernelError::StoreCorruption(format!("non-utf8 pending key: {e}")))?;
            let seq: u64 = key[prefix.len()..].parse().map_err(|e: std::num::ParseIntError| {
                KernelError::StoreCorruption(format!("malformed pending key {key}: {e}"))
            })?;
            out.push((seq, value.to_vec()));
        }
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ClistEntryValue {
    eref: String,
    reachable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Direction;

    fn store() -> KernelStore {
        KernelStore::open_temporary().unwrap()
    }

    #[test]
    fn clist_entry_round_trips_both_directions() {
        let s = store();
        let ep = EndpointId::vat(1);
        let kref = KRef::Object(KoId(10));
        let eref = LocalRef::object(5, Direction::Exported);
        s.add_clist_entry(ep, kref, eref).unwrap();
        assert_eq!(s.kref_to_eref(ep, kref).unwrap(), Some(eref));
        assert_eq!(s.eref_to_kref(ep, eref).unwrap(), Some(kref));
    }

    #[test]
    fn allocate_eref_uses_endpoint_counter() {
        let s = store();
        let ep = EndpointId::vat(2);
        let first = s.allocate_eref_for_kref(ep, KRef::Object(KoId(1))).unwrap();
        let second = s.allocate_eref_for_kref(ep, KRef::Object(KoId(2))).unwrap();
        assert_eq!(first, LocalRef::object(0, Direction::Imported));
        assert_eq!(second, LocalRef::object(1, Direction::Imported));
    }

    #[test]
    fn decrement_to_zero_inserts_drop_export_action() {
        let s = store();
        let ep = EndpointId::vat(1);
        let koid = s.create_object(ep).unwrap();
        s.increment_reachable(koid).unwrap();
        s.decrement_ref_count(ep, koid, true, false).unwrap();
        let actions: Vec<_> = s.gc_action_set().unwrap().iter().collect();
        assert_eq!(
            actions,
            vec![GcAction { endpoint: ep, kind: GcActionKind::DropExport, kref: KRef::Object(koid) }]
        );
    }

    #[test]
    fn rollback_undoes_writes_since_savepoint() {
        let s = store();
        let ep = EndpointId::vat(3);
        let koid = s.create_object(ep).unwrap();
        s.create_savepoint("t0");
        s.increment_reachable(koid).unwrap();
        assert_eq!(s.get_object(koid).unwrap().unwrap().reachable_count, 1);
        s.rollback("t0").unwrap();
        assert_eq!(s.get_object(koid).unwrap().unwrap().reachable_count, 0);
    }

    #[test]
    fn rollback_unknown_savepoint_is_an_error() {
        let s = store();
        assert!(matches!(s.rollback("missing"), Err(KernelError::SavepointMissing(_))));
    }

    #[test]
    fn gc_action_encoding_is_space_separated_triple() {
        let action = GcAction {
            endpoint: EndpointId::vat(1),
            kind: GcActionKind::RetireImport,
            kref: KRef::Object(KoId(9)),
        };
        assert_eq!(action.encode(), "v1 retireImport ko9");
        assert_eq!(GcAction::decode(&action.encode()), Some(action));
    }

    #[test]
    fn compromised_vats_persist_across_mark_and_clear() {
        let s = store();
        let vid = EndpointId::vat(7);
        assert!(!s.is_vat_compromised(vid).unwrap());
        s.mark_vat_as_compromised(vid).unwrap();
        assert!(s.is_vat_compromised(vid).unwrap());
        s.clear_vat_compromised_status(vid).unwrap();
        assert!(!s.is_vat_compromised(vid).unwrap());
    }

    #[test]
    fn get_subclusters_lists_registered_ids_only() {
        let s = store();
        let sid = SubclusterId { number: 0, system: false };
        let record = SubclusterRecord {
            id: sid,
            config: SubclusterConfig {
                bootstrap: "alice".into(),
                vats: vec![VatSpec { name: "alice".into(), source_spec: "a.js".into() }],
                services: Vec::new(),
            },
            vat_ids: vec![EndpointId::vat(0)],
            bootstrap_vat: EndpointId::vat(0),
        };
        s.add_subcluster(&record).unwrap();
        assert_eq!(s.get_subclusters().unwrap(), vec![sid]);
    }

    #[test]
    fn remote_info_round_trips() {
        let s = store();
        let rid = EndpointId::remote(1);
        assert_eq!(s.get_remote_info(rid).unwrap(), None);
        s.put_remote_info(rid, &RemoteInfo { label: "peer-a".into() }).unwrap();
        assert_eq!(s.get_remote_info(rid).unwrap(), Some(RemoteInfo { label: "peer-a".into() }));
    }

    #[test]
    fn detect_wake_true_after_threshold_then_false() {
        let s = store();
        let threshold = std::time::Duration::from_secs(3600);
        s.record_last_active_time(0).unwrap();
        assert!(s.detect_wake(2 * 3600 * 1000, threshold).unwrap());
        s.record_last_active_time(2 * 3600 * 1000).unwrap();
        assert!(!s.detect_wake(2 * 3600 * 1000, threshold).unwrap());
    }
}
