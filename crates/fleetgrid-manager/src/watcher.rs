//! Watcher loops driving configs through the manifest state machine.
//!
//! Each watcher lists the configs in the states it owns and advances every
//! one of them independently; a failure is logged and that config is left
//! for the next tick. All writes are version-gated, so a pass that loses a
//! race to another writer simply does nothing.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_state::{Config, Events, ManifestState, Workflow, WorkflowStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::desired::create_desired_state;
use crate::diff::diff;
use crate::error::{ManagerError, ManagerResult};
use crate::metrics::ManagerMetrics;
use crate::queue::QueuedTask;
use crate::service::Manager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watcher {
    /// Pending configs: synthesize and schedule.
    Pending,
    /// Scheduled configs: offer tasks, track leases, settle.
    Scheduled,
    /// Done and Error configs: reschedule on change, delete when torn down.
    Done,
}

impl Watcher {
    pub const ALL: [Watcher; 3] = [Watcher::Pending, Watcher::Scheduled, Watcher::Done];

    fn name(self) -> &'static str {
        match self {
            Watcher::Pending => "pending",
            Watcher::Scheduled => "scheduled",
            Watcher::Done => "done",
        }
    }

    /// Run one pass. Returns the number of configs written.
    pub fn pass(self, manager: &Manager) -> ManagerResult<usize> {
        match self {
            Watcher::Pending => manager.pending_pass(),
            Watcher::Scheduled => manager.scheduled_pass(),
            Watcher::Done => manager.done_pass(),
        }
    }
}

/// Run one watcher until `shutdown` fires.
pub async fn run_watcher(
    manager: Arc<Manager>,
    watcher: Watcher,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(watcher = watcher.name(), interval_secs = interval.as_secs(), "watcher started");

    // First tick fires at once; a slow pass skips ticks instead of bunching them.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match watcher.pass(&manager) {
                    Ok(0) => {}
                    Ok(written) => debug!(watcher = watcher.name(), written, "watcher pass complete"),
                    Err(e) => error!(watcher = watcher.name(), error = %e, "watcher pass failed"),
                }
            }
            _ = shutdown.changed() => {
                info!(watcher = watcher.name(), "watcher shutting down");
                break;
            }
        }
    }
}

/// Spawn all three watchers.
pub fn spawn_watchers(
    manager: Arc<Manager>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    Watcher::ALL
        .into_iter()
        .map(|watcher| tokio::spawn(run_watcher(manager.clone(), watcher, interval, shutdown.clone())))
        .collect()
}

/// Log a per-config failure. Dirty writes are expected under concurrency.
fn report(watcher: Watcher, config: &str, err: &ManagerError) {
    if err.is_dirty_write() {
        debug!(watcher = watcher.name(), config = %config, "config changed during pass, retrying next tick");
    } else {
        warn!(watcher = watcher.name(), config = %config, error = %err, "failed to advance config");
    }
}

impl Manager {
    // ── Pending ───────────────────────────────────────────────────

    pub fn pending_pass(&self) -> ManagerResult<usize> {
        let mut written = 0;
        for config in self.store().list_configs(&[ManifestState::Pending])? {
            let name = config.name.clone();
            match self.schedule_config(config) {
                Ok(()) => written += 1,
                Err(e) => {
                    self.note_dirty(&e);
                    report(Watcher::Pending, &name, &e);
                }
            }
        }
        Ok(written)
    }

    /// Synthesize desired state, replace every cluster's events with a
    /// fresh diff and move the config to Scheduled.
    pub(crate) fn schedule_config(&self, mut config: Config) -> ManagerResult<()> {
        let desired = create_desired_state(&config.manifest, &config.clusters)?;
        ManagerMetrics::inc(&self.metrics().desired_states_synthesized);

        for (cluster, snapshot) in desired {
            config.clusters.entry(cluster).or_default().desired = snapshot;
        }

        let mut scheduled = 0usize;
        for (cluster, state) in &mut config.clusters {
            let events = diff(
                state.current.k8s.as_ref(),
                state.desired.k8s.as_ref(),
                &state.current.load_balancers,
                &state.desired.load_balancers,
            );
            if !events.is_empty() {
                debug!(config = %config.name, cluster = %cluster, events = events.len(), "cluster scheduled");
            }
            scheduled += events.len();
            state.events = Events {
                task_events: events,
                ttl: 0,
                autoscaled: false,
            };
            state.workflow = Workflow::default();
        }
        config
            .clusters
            .retain(|_, state| !(state.current.is_empty() && state.desired.is_empty()));

        config.manifest.scheduled_checksum = config.manifest.checksum.clone();
        config.manifest.transition(ManifestState::Scheduled)?;
        let version = self.store().update_config(&config)?;

        ManagerMetrics::add(&self.metrics().task_events_scheduled, scheduled as u64);
        info!(
            config = %config.name,
            version,
            clusters = config.clusters.len(),
            events = scheduled,
            "config scheduled"
        );
        Ok(())
    }

    // ── Scheduled ─────────────────────────────────────────────────

    pub fn scheduled_pass(&self) -> ManagerResult<usize> {
        let mut written = 0;
        for config in self.store().list_configs(&[ManifestState::Scheduled])? {
            let name = config.name.clone();
            match self.advance_config(config) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    self.note_dirty(&e);
                    report(Watcher::Scheduled, &name, &e);
                }
            }
        }
        Ok(written)
    }

    /// Offer head tasks, age leases and settle the config once no cluster
    /// has work in flight. Returns whether the config was written.
    pub(crate) fn advance_config(&self, mut config: Config) -> ManagerResult<bool> {
        let mut changed = false;
        let mut in_flight = false;
        let mut errored = false;

        for (cluster, state) in &mut config.clusters {
            let Some(head) = state.events.head().cloned() else {
                continue;
            };
            if state.workflow.status == WorkflowStatus::Error {
                errored = true;
                continue;
            }
            in_flight = true;

            if state.workflow.status == WorkflowStatus::InProgress && state.events.ttl > 0 {
                state.events.ttl -= 1;
                changed = true;
                if state.events.ttl > 0 {
                    continue;
                }
                ManagerMetrics::inc(&self.metrics().lease_expirations);
                warn!(
                    config = %config.name,
                    cluster = %cluster,
                    task = %head.id,
                    "task lease expired, offering it again"
                );
            }

            let offered = self.queue().enqueue(QueuedTask {
                config: config.name.clone(),
                cluster: cluster.clone(),
                event: head.clone(),
                ttl: state.events.ttl,
                version: config.version,
            });
            if offered {
                debug!(config = %config.name, cluster = %cluster, task = %head.id, "task queued");
            }
        }

        if !in_flight {
            config
                .clusters
                .retain(|_, state| !(state.current.is_empty() && state.desired.is_empty()));
            if errored {
                config.manifest.transition(ManifestState::Error)?;
            } else {
                config.manifest.last_applied_checksum = config.manifest.scheduled_checksum.clone();
                config.manifest.transition(ManifestState::Done)?;
            }
            changed = true;
        }

        if !changed {
            return Ok(false);
        }
        let version = self.store().update_config(&config)?;
        if !in_flight {
            info!(config = %config.name, version, state = %config.manifest.state, "config settled");
        }
        Ok(true)
    }

    // ── Done / Error ──────────────────────────────────────────────

    pub fn done_pass(&self) -> ManagerResult<usize> {
        let mut written = 0;
        for config in self
            .store()
            .list_configs(&[ManifestState::Done, ManifestState::Error])?
        {
            let name = config.name.clone();
            match self.retire_config(config) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    self.note_dirty(&e);
                    report(Watcher::Done, &name, &e);
                }
            }
        }
        Ok(written)
    }

    /// Send a changed config back to Pending, or delete a torn-down one.
    pub(crate) fn retire_config(&self, mut config: Config) -> ManagerResult<bool> {
        if config.manifest.has_unapplied_changes() {
            config.manifest.transition(ManifestState::Pending)?;
            let version = self.store().update_config(&config)?;
            info!(config = %config.name, version, "manifest changed, config pending");
            return Ok(true);
        }

        if config.manifest.state == ManifestState::Done
            && config.manifest.raw.is_empty()
            && config.all_clusters_empty()
        {
            self.store().delete_config(&config.name, config.version)?;
            ManagerMetrics::inc(&self.metrics().configs_deleted);
            info!(config = %config.name, "config deleted");
            return Ok(true);
        }
        Ok(false)
    }
}
