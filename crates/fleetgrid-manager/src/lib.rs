//! fleetgrid-manager: reconciliation engine for fleetgrid configs.
//!
//! Turns a manifest into a desired infrastructure state per cluster, diffs
//! it against what the builders last reported, and hands the resulting
//! task events out one cluster head at a time.
//!
//! # Lifecycle
//!
//! ```text
//! upsert ──► Pending ──(synthesize + diff)──► Scheduled ──(all idle)──► Done
//!               ▲                                  │                     │
//!               │                                  └──(any error)──► Error
//!               └────────────(checksum != last applied)──────────────────┘
//! ```
//!
//! Builders poll [`Manager::next_task`], report through
//! [`Manager::task_update`] and persist what they built through
//! [`Manager::update_current_state`]. A claimed task whose builder goes
//! silent is offered again once its lease of `task_ttl` watcher ticks runs
//! out. The autoscaler path, [`Manager::update_nodepool`], injects resize
//! events into an idle cluster without a synthesis pass.

pub mod autoscale;
pub mod config;
pub mod desired;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod nodepools;
pub mod queue;
pub mod service;
pub mod watcher;

pub use config::{ManagerConfig, RetrySettings};
pub use error::{Code, ManagerError, ManagerResult};
pub use metrics::{ManagerMetrics, MetricsSnapshot, render_prometheus};
pub use queue::{QueuedTask, TaskQueue};
pub use service::{Manager, NextTask};
pub use watcher::{Watcher, run_watcher, spawn_watchers};
