//! Durable record shapes layered over the raw key/value store (§3.2).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{EndpointId, KRef, SubclusterId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelObject {
    pub owner: EndpointId,
    pub reachable_count: u64,
    pub recognizable_count: u64,
    pub revoked: bool,
}

impl KernelObject {
    pub fn new(owner: EndpointId) -> Self {
        Self { owner, reachable_count: 0, recognizable_count: 0, revoked: false }
    }

    /// `0 ≤ reachable ≤ recognizable` (invariant 2, §8).
    pub fn check_invariant(&self) -> bool {
        self.reachable_count <= self.recognizable_count
    }

    pub fn is_retirement_eligible(&self) -> bool {
        self.reachable_count == 0 && self.recognizable_count == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

/// Who currently has the authority to resolve a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decider {
    Endpoint(EndpointId),
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPromise {
    pub state: PromiseState,
    /// `None` once resolved (invariant: a resolved promise has no decider).
    pub decider: Option<Decider>,
    pub subscribers: Vec<EndpointId>,
    pub value: Option<String>,
    pub resolution_slots: Vec<KRef>,
}

impl KernelPromise {
    pub fn new(decider: Decider) -> Self {
        Self {
            state: PromiseState::Unresolved,
            decider: Some(decider),
            subscribers: Vec::new(),
            value: None,
            resolution_slots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcActionKind {
    DropExport,
    RetireExport,
    RetireImport,
}

impl GcActionKind {
    /// Fixed priority order used to group dispatch (§4.E).
    pub fn priority(self) -> u8 {
        match self {
            GcActionKind::DropExport => 0,
            GcActionKind::RetireExport => 1,
            GcActionKind::RetireImport => 2,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            GcActionKind::DropExport => "dropExport",
            GcActionKind::RetireExport => "retireExport",
            GcActionKind::RetireImport => "retireImport",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "dropExport" => Some(GcActionKind::DropExport),
            "retireExport" => Some(GcActionKind::RetireExport),
            "retireImport" => Some(GcActionKind::RetireImport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcAction {
    pub endpoint: EndpointId,
    pub kind: GcActionKind,
    pub kref: KRef,
}

impl GcAction {
    /// `"ep type kref"`, space-separated — must stay bit-exact (§6.3) to
    /// support cross-version recovery, so this is the one place the
    /// encoding is produced or parsed.
    pub fn encode(&self) -> String {
        format!("{} {} {}", self.endpoint, self.kind.tag(), self.kref)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ' ');
        let endpoint = parts.next()?.parse().ok()?;
        let kind = GcActionKind::parse(parts.next()?)?;
        let kref = parts.next()?.parse().ok()?;
        Some(Self { endpoint, kind, kref })
    }
}

impl PartialOrd for GcActionKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GcActionKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority().cmp(&other.priority())
    }
}

/// A set of GC actions, serialized as a JSON array of `"ep type kref"`
/// strings under the `gcActions` key (§6.3). A `BTreeSet` gives duplicate
/// rejection for free (invariant 4, §8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcActionSet(pub BTreeSet<String>);

impl GcActionSet {
    pub fn insert(&mut self, action: GcAction) -> bool {
        self.0.insert(action.encode())
    }

    pub fn remove(&mut self, action: &GcAction) -> bool {
        self.0.remove(&action.encode())
    }

    pub fn iter(&self) -> impl Iterator<Item = GcAction> + '_ {
        self.0.iter().filter_map(|s| GcAction::decode(s))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubclusterConfig {
    pub bootstrap: String,
    pub vats: Vec<VatSpec>,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatSpec {
    pub name: String,
    pub source_spec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubclusterRecord {
    pub id: SubclusterId,
    pub config: SubclusterConfig,
    pub vat_ids: Vec<EndpointId>,
    pub bootstrap_vat: EndpointId,
}

/// The peer record stored at `remote.<rid>` (§6.3); the sequence/outbox
/// state that drives delivery lives alongside it under `remoteSeq.<rid>.*`
/// and `remotePending.<rid>.<seq>` (§4.G), kept separate since it churns on
/// every send while this record is written once at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub label: String,
}
