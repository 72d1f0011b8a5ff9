//! Manager counters and their Prometheus text exposition.
//!
//! One [`ManagerMetrics`] is built by the daemon and handed to the service;
//! nothing here is global.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ManagerMetrics {
    pub manifests_upserted: AtomicU64,
    pub desired_states_synthesized: AtomicU64,
    pub task_events_scheduled: AtomicU64,
    pub tasks_claimed: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub lease_expirations: AtomicU64,
    pub dirty_writes: AtomicU64,
    pub configs_deleted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub manifests_upserted: u64,
    pub desired_states_synthesized: u64,
    pub task_events_scheduled: u64,
    pub tasks_claimed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub lease_expirations: u64,
    pub dirty_writes: u64,
    pub configs_deleted: u64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            manifests_upserted: load(&self.manifests_upserted),
            desired_states_synthesized: load(&self.desired_states_synthesized),
            task_events_scheduled: load(&self.task_events_scheduled),
            tasks_claimed: load(&self.tasks_claimed),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            lease_expirations: load(&self.lease_expirations),
            dirty_writes: load(&self.dirty_writes),
            configs_deleted: load(&self.configs_deleted),
        }
    }
}

/// Render counters plus the per-state config gauge in Prometheus text format.
pub fn render_prometheus(snapshot: &MetricsSnapshot, configs_by_state: &[(String, usize)]) -> String {
    let mut out = String::new();

    let counters: [(&str, &str, u64); 9] = [
        ("manifests_upserted_total", "Manifests accepted by UpsertManifest.", snapshot.manifests_upserted),
        ("desired_states_synthesized_total", "Desired states computed by the pending watcher.", snapshot.desired_states_synthesized),
        ("task_events_scheduled_total", "Task events produced by the diff engine or the autoscaler path.", snapshot.task_events_scheduled),
        ("tasks_claimed_total", "Tasks handed out by NextTask.", snapshot.tasks_claimed),
        ("tasks_completed_total", "Tasks reported done.", snapshot.tasks_completed),
        ("tasks_failed_total", "Tasks reported failed.", snapshot.tasks_failed),
        ("lease_expirations_total", "Task leases that expired and were re-offered.", snapshot.lease_expirations),
        ("dirty_writes_total", "Writes rejected by the version check.", snapshot.dirty_writes),
        ("configs_deleted_total", "Configs physically removed from the store.", snapshot.configs_deleted),
    ];
    for (name, help, value) in counters {
        out.push_str(&format!("# HELP fleetgrid_{name} {help}\n"));
        out.push_str(&format!("# TYPE fleetgrid_{name} counter\n"));
        out.push_str(&format!("fleetgrid_{name} {value}\n"));
    }

    out.push_str("# HELP fleetgrid_configs Configs per manifest state.\n");
    out.push_str("# TYPE fleetgrid_configs gauge\n");
    for (state, count) in configs_by_state {
        out.push_str(&format!("fleetgrid_configs{{state=\"{state}\"}} {count}\n"));
    }

    out
}
