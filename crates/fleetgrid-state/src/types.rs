//! Persisted document types.
//!
//! A [`Config`] tracks one manifest: its raw text and state machine, plus
//! per-cluster current/desired snapshots, queued task events and the
//! workflow status reported by builders. Configs are stored whole as JSON
//! and versioned as a unit.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_core::{K8sCluster, LoadBalancers};
use serde::{Deserialize, Serialize};

// ── Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Unique key of the document.
    pub name: String,
    /// Compare-and-swap token, bumped by one on every accepted write.
    pub version: u64,
    pub manifest: Manifest,
    #[serde(default)]
    pub k8s_ctx: K8sContext,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterState>,
}

impl Config {
    /// A freshly upserted config: version 0, state Pending.
    pub fn new(name: &str, raw: &str, checksum: &str, k8s_ctx: K8sContext) -> Self {
        Self {
            name: name.to_string(),
            version: 0,
            manifest: Manifest {
                raw: raw.to_string(),
                checksum: Some(checksum.to_string()),
                last_applied_checksum: None,
                scheduled_checksum: None,
                state: ManifestState::Pending,
            },
            k8s_ctx,
            clusters: BTreeMap::new(),
        }
    }

    /// True when no cluster has a current or a desired state.
    pub fn all_clusters_empty(&self) -> bool {
        self.clusters
            .values()
            .all(|c| c.current.is_empty() && c.desired.is_empty())
    }
}

/// Where the manifest came from (the CRD that produced it), if anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sContext {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

// ── Manifest ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Raw manifest text; empty once marked for deletion.
    #[serde(default)]
    pub raw: String,
    pub checksum: Option<String>,
    pub last_applied_checksum: Option<String>,
    /// Checksum the scheduled desired state was synthesized from; becomes
    /// `last_applied_checksum` once every cluster settles.
    #[serde(default)]
    pub scheduled_checksum: Option<String>,
    pub state: ManifestState,
}

impl Manifest {
    /// A manifest with no raw text or no checksum marks its config for
    /// deletion.
    pub fn is_deletion_marker(&self) -> bool {
        self.raw.is_empty() || self.checksum.is_none()
    }

    /// The manifest changed since it was last fully applied.
    pub fn has_unapplied_changes(&self) -> bool {
        self.checksum != self.last_applied_checksum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestState {
    /// Desired state needs (re)computation.
    Pending,
    /// Tasks are queued or in flight.
    Scheduled,
    /// Every cluster finished without error.
    Done,
    /// At least one cluster failed.
    Error,
}

impl fmt::Display for ManifestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManifestState::Pending => "pending",
            ManifestState::Scheduled => "scheduled",
            ManifestState::Done => "done",
            ManifestState::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ManifestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ManifestState::Pending),
            "scheduled" => Ok(ManifestState::Scheduled),
            "done" => Ok(ManifestState::Done),
            "error" => Ok(ManifestState::Error),
            other => Err(format!("unknown manifest state: {other}")),
        }
    }
}

// ── Clusters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub current: ClusterSnapshot,
    #[serde(default)]
    pub desired: ClusterSnapshot,
    #[serde(default)]
    pub events: Events,
    #[serde(default)]
    pub workflow: Workflow,
}

/// One K8s cluster plus the load balancers attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub k8s: Option<K8sCluster>,
    #[serde(default)]
    pub load_balancers: LoadBalancers,
}

impl ClusterSnapshot {
    pub fn is_empty(&self) -> bool {
        self.k8s.is_none() && self.load_balancers.is_empty()
    }
}

/// Per-cluster FIFO of task events plus its lease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Events {
    #[serde(default)]
    pub task_events: Vec<TaskEvent>,
    /// Remaining watcher ticks on the lease of the head event.
    #[serde(default)]
    pub ttl: u32,
    /// Events were injected by the autoscaler path.
    #[serde(default)]
    pub autoscaled: bool,
}

impl Events {
    pub fn head(&self) -> Option<&TaskEvent> {
        self.task_events.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub status: WorkflowStatus,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub description: String,
    /// Unix timestamp (seconds) of the last status change.
    #[serde(default)]
    pub timestamp: u64,
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            status: WorkflowStatus::Done,
            stage: String::new(),
            description: String::new(),
            timestamp: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Done,
    InProgress,
    Error,
}

// ── Task events ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: String,
    /// Unix timestamp (seconds) of creation.
    pub timestamp: u64,
    pub event: EventKind,
    pub task: Task,
    #[serde(default)]
    pub description: String,
}

impl TaskEvent {
    /// New event with a fresh unique id.
    pub fn new(event: EventKind, task: Task, description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: epoch_secs(),
            event,
            task,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Create(CreateState),
    Update(UpdateState),
    Delete(DeleteState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateState {
    pub k8s: K8sCluster,
    #[serde(default)]
    pub load_balancers: LoadBalancers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub k8s: K8sCluster,
    #[serde(default)]
    pub load_balancers: LoadBalancers,
    /// Set when the node serving the API endpoint is going away and the
    /// endpoint must move to another control node.
    #[serde(default)]
    pub api_endpoint_replace: Option<ApiEndpointReplace>,
}

impl UpdateState {
    pub fn is_control_plane_with_api_endpoint_replace(&self) -> bool {
        self.api_endpoint_replace.is_some()
    }
}

/// The API endpoint being moved away from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpointReplace {
    pub nodepool: String,
    /// `None` when the endpoint is fronted by a load balancer role rather
    /// than a node.
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteState {
    /// Full snapshot when the whole cluster is destroyed.
    #[serde(default)]
    pub k8s: Option<K8sCluster>,
    #[serde(default)]
    pub load_balancers: LoadBalancers,
    /// Nodepool name → names of the nodes to remove.
    #[serde(default)]
    pub nodepools: BTreeMap<String, Vec<String>>,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
