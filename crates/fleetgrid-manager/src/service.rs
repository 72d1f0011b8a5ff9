//! The manager service.
//!
//! Holds the store, the in-memory task queue, the metrics object and the
//! manager configuration. Every operation reads a config, computes the new
//! document and writes it back conditioned on the version it read.
//! Operations that are not given a version by their caller retry dirty
//! writes through [`retry_with_backoff`]; operations that are given one
//! surface the mismatch instead.

use std::sync::Arc;

use fleet_core::manifest;
use fleetgrid_state::{
    ClusterSnapshot, Config, DeleteState, K8sContext, ManifestState, StateStore, Task, TaskEvent,
    Workflow, WorkflowStatus, epoch_secs, retry_with_backoff,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::metrics::ManagerMetrics;
use crate::queue::{QueuedTask, TaskQueue};

/// A task handed to a builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextTask {
    pub config: String,
    pub cluster: String,
    /// Current state of the cluster the task applies to.
    pub current: ClusterSnapshot,
    pub event: TaskEvent,
    pub ttl: u32,
    /// Config version after the claim was recorded.
    pub version: u64,
}

pub struct Manager {
    store: StateStore,
    queue: TaskQueue,
    metrics: Arc<ManagerMetrics>,
    config: ManagerConfig,
}

impl Manager {
    pub fn new(store: StateStore, config: ManagerConfig, metrics: Arc<ManagerMetrics>) -> Self {
        Self {
            store,
            queue: TaskQueue::new(),
            metrics,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Run a read-modify-write until it lands or fails for another reason
    /// than a dirty write.
    async fn with_retry<T, F>(&self, op: &str, mut f: F) -> ManagerResult<T>
    where
        F: FnMut() -> ManagerResult<T>,
    {
        let retry = self.config.retry_config();
        retry_with_backoff(
            &retry,
            op,
            |e: &ManagerError| {
                let dirty = e.is_dirty_write();
                if dirty {
                    ManagerMetrics::inc(&self.metrics.dirty_writes);
                }
                dirty
            },
            || {
                let result = f();
                async move { result }
            },
        )
        .await
    }

    /// Record a dirty write surfaced to a caller that presented a version.
    pub(crate) fn note_dirty(&self, err: &ManagerError) {
        if err.is_dirty_write() {
            ManagerMetrics::inc(&self.metrics.dirty_writes);
        }
    }

    // ── Manifest operations ───────────────────────────────────────

    /// Create the config or replace its manifest. Returns the config name
    /// and the version after the write.
    pub async fn upsert_manifest(
        &self,
        name: &str,
        raw: &str,
        k8s_ctx: K8sContext,
    ) -> ManagerResult<(String, u64)> {
        if name.trim().is_empty() {
            return Err(ManagerError::InvalidArgument("config name must not be empty".into()));
        }
        if raw.trim().is_empty() {
            return Err(ManagerError::InvalidArgument(format!(
                "manifest of {name} is empty, use mark_for_deletion to remove it"
            )));
        }
        let checksum = manifest::checksum(raw);

        let (version, written) = self
            .with_retry("upsert_manifest", || match self.store.get_config(name)? {
                None => {
                    let config = Config::new(name, raw, &checksum, k8s_ctx.clone());
                    Ok((self.store.create_config(&config)?, true))
                }
                Some(mut config) => {
                    if config.manifest.checksum.as_deref() == Some(checksum.as_str())
                        && config.k8s_ctx == k8s_ctx
                    {
                        return Ok((config.version, false));
                    }
                    config.manifest.raw = raw.to_string();
                    config.manifest.checksum = Some(checksum.clone());
                    config.k8s_ctx = k8s_ctx.clone();
                    Ok((self.store.update_config(&config)?, true))
                }
            })
            .await?;

        if written {
            ManagerMetrics::inc(&self.metrics.manifests_upserted);
            info!(config = %name, version, checksum = %checksum, "manifest upserted");
        } else {
            debug!(config = %name, version, "manifest unchanged");
        }
        Ok((name.to_string(), version))
    }

    /// Clear the manifest so the watchers tear down every cluster.
    pub async fn mark_for_deletion(&self, name: &str) -> ManagerResult<u64> {
        let version = self
            .with_retry("mark_for_deletion", || {
                let config = self
                    .store
                    .get_config(name)?
                    .ok_or_else(|| ManagerError::NotFound(format!("config {name}")))?;
                if config.manifest.is_deletion_marker() {
                    return Ok(config.version);
                }
                Ok(self.store.mark_for_deletion(name, config.version)?)
            })
            .await?;
        info!(config = %name, version, "config marked for deletion");
        Ok(version)
    }

    pub fn list_configs(&self, states: &[ManifestState]) -> ManagerResult<Vec<Config>> {
        Ok(self.store.list_configs(states)?)
    }

    pub fn get_config(&self, name: &str) -> ManagerResult<Config> {
        self.store
            .get_config(name)?
            .ok_or_else(|| ManagerError::NotFound(format!("config {name}")))
    }

    /// Number of configs per manifest state, for the metrics endpoint.
    pub fn configs_by_state(&self) -> ManagerResult<Vec<(String, usize)>> {
        let configs = self.store.list_configs(&[])?;
        let states = [
            ManifestState::Pending,
            ManifestState::Scheduled,
            ManifestState::Done,
            ManifestState::Error,
        ];
        Ok(states
            .iter()
            .map(|state| {
                let count = configs.iter().filter(|c| c.manifest.state == *state).count();
                (state.to_string(), count)
            })
            .collect())
    }

    // ── Task protocol ─────────────────────────────────────────────

    /// Claim the next queued task. Entries whose event is no longer the
    /// head of its cluster are dropped. A dirty write while recording the
    /// claim puts the entry back and fails with `Aborted`.
    pub async fn next_task(&self) -> ManagerResult<NextTask> {
        loop {
            let Some(task) = self.queue.dequeue() else {
                return Err(ManagerError::NotFound("no task queued".into()));
            };
            let Some(config) = self.store.get_config(&task.config)? else {
                debug!(config = %task.config, "dropping task of deleted config");
                continue;
            };
            if let Some(claimed) = self.claim(task, config)? {
                return Ok(claimed);
            }
        }
    }

    /// Lease `task` against `config` as read. `None` drops a stale entry.
    fn claim(&self, task: QueuedTask, mut config: Config) -> ManagerResult<Option<NextTask>> {
        let Some(state) = config.clusters.get_mut(&task.cluster) else {
            debug!(config = %task.config, cluster = %task.cluster, "dropping task of removed cluster");
            return Ok(None);
        };
        let Some(event) = state.events.head().filter(|e| e.id == task.event.id).cloned() else {
            debug!(
                config = %task.config,
                cluster = %task.cluster,
                task = %task.event.id,
                "dropping stale task"
            );
            return Ok(None);
        };

        state.workflow = Workflow {
            status: WorkflowStatus::InProgress,
            stage: String::new(),
            description: event.description.clone(),
            timestamp: epoch_secs(),
        };
        state.events.ttl = self.config.task_ttl;
        let current = state.current.clone();

        match self.store.update_config(&config) {
            Ok(version) => {
                ManagerMetrics::inc(&self.metrics.tasks_claimed);
                info!(
                    config = %task.config,
                    cluster = %task.cluster,
                    task = %event.id,
                    kind = ?event.event,
                    version,
                    "task claimed"
                );
                Ok(Some(NextTask {
                    config: task.config,
                    cluster: task.cluster,
                    current,
                    event,
                    ttl: self.config.task_ttl,
                    version,
                }))
            }
            Err(err) if err.is_dirty_write() => {
                ManagerMetrics::inc(&self.metrics.dirty_writes);
                let msg = format!("config {} changed while claiming task {}", task.config, event.id);
                self.queue.enqueue(task);
                Err(ManagerError::Aborted(msg))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Report progress of the claimed head task of a cluster.
    pub async fn task_update(
        &self,
        config_name: &str,
        cluster: &str,
        task_id: &str,
        version: u64,
        workflow: Workflow,
    ) -> ManagerResult<u64> {
        let mut config = self.get_config(config_name)?;
        check_version(&config, version)?;
        let state = config
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {cluster} of config {config_name}")))?;
        if state.events.head().map(|e| e.id.as_str()) != Some(task_id) {
            return Err(ManagerError::NotFound(format!(
                "task {task_id} is not the head of cluster {cluster}"
            )));
        }

        match workflow.status {
            WorkflowStatus::Done => {
                let done = state.events.task_events.remove(0);
                state.events.ttl = 0;
                // A finished whole-cluster delete leaves nothing behind.
                if let Task::Delete(DeleteState { k8s: Some(_), .. }) = done.task {
                    state.current = ClusterSnapshot::default();
                }
                ManagerMetrics::inc(&self.metrics.tasks_completed);
            }
            WorkflowStatus::Error => {
                state.events.ttl = 0;
                ManagerMetrics::inc(&self.metrics.tasks_failed);
                warn!(
                    config = %config_name,
                    cluster = %cluster,
                    task = %task_id,
                    description = %workflow.description,
                    "task failed"
                );
            }
            WorkflowStatus::InProgress => {}
        }
        state.workflow = Workflow {
            timestamp: epoch_secs(),
            ..workflow
        };

        let version = self.store.update_config(&config).map_err(|e| {
            let err = ManagerError::from(e);
            self.note_dirty(&err);
            err
        })?;
        debug!(config = %config_name, cluster = %cluster, task = %task_id, version, "task updated");
        Ok(version)
    }

    /// Persist the state a builder produced for a cluster.
    pub async fn update_current_state(
        &self,
        config_name: &str,
        cluster: &str,
        version: u64,
        current: ClusterSnapshot,
    ) -> ManagerResult<u64> {
        let mut config = self.get_config(config_name)?;
        check_version(&config, version)?;
        let state = config
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {cluster} of config {config_name}")))?;
        state.current = current;

        let version = self.store.update_config(&config).map_err(|e| {
            let err = ManagerError::from(e);
            self.note_dirty(&err);
            err
        })?;
        debug!(config = %config_name, cluster = %cluster, version, "current state updated");
        Ok(version)
    }
}

pub(crate) fn check_version(config: &Config, presented: u64) -> ManagerResult<()> {
    if config.version != presented {
        return Err(ManagerError::VersionMismatch {
            name: config.name.clone(),
            presented,
            stored: config.version,
        });
    }
    Ok(())
}
