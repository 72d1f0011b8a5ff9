//! Autoscaler-driven nodepool resize.
//!
//! A cluster autoscaler presents the nodepool it wants: the target `count`
//! and the nodes it keeps. Nodes of the current pool missing from the
//! request are deleted, the rest are reused, and the remainder up to
//! `count` is added under fresh names. The resulting events go straight
//! into the cluster's queue without a synthesis pass.

use std::collections::{BTreeMap, HashSet};

use fleet_core::{Node, NodePool, NodeType};
use fleetgrid_state::{DeleteState, EventKind, ManifestState, Task, TaskEvent, UpdateState};
use tracing::{debug, info};

use crate::error::{ManagerError, ManagerResult};
use crate::metrics::ManagerMetrics;
use crate::nodepools::{fresh_node_names, member_type};
use crate::service::{Manager, check_version};

/// Current nodes split by what the request does with them.
#[derive(Debug, Default, PartialEq, Eq)]
struct Classified {
    deleted: Vec<String>,
    reused: Vec<Node>,
    added: usize,
}

fn classify(current: &NodePool, requested: &NodePool, count: u32) -> ManagerResult<Classified> {
    let keep: HashSet<&str> = requested.nodes.iter().map(|n| n.name.as_str()).collect();
    let mut out = Classified::default();
    for node in &current.nodes {
        if keep.contains(node.name.as_str()) {
            out.reused.push(node.clone());
        } else if node.node_type == NodeType::ApiEndpoint {
            return Err(ManagerError::InvalidArgument(format!(
                "node {} serves the api endpoint of nodepool {} and cannot be removed",
                node.name, current.name
            )));
        } else {
            out.deleted.push(node.name.clone());
        }
    }
    let count = count as usize;
    if count < out.reused.len() {
        return Err(ManagerError::InvalidArgument(format!(
            "count {count} of nodepool {} is below the {} nodes it keeps",
            current.name,
            out.reused.len()
        )));
    }
    out.added = count - out.reused.len();
    Ok(out)
}

impl Manager {
    /// Resize an autoscaled nodepool of an idle cluster. Returns the new
    /// config version, or the presented one when nothing changes.
    pub async fn update_nodepool(
        &self,
        config_name: &str,
        cluster: &str,
        version: u64,
        nodepool: NodePool,
    ) -> ManagerResult<u64> {
        let mut config = self.get_config(config_name)?;
        check_version(&config, version)?;

        if config.manifest.state != ManifestState::Scheduled {
            return Err(ManagerError::FailedPrecondition(format!(
                "config {config_name} is {}, nodepools are only resized while scheduled",
                config.manifest.state
            )));
        }
        let state = config
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {cluster} of config {config_name}")))?;
        if !state.events.task_events.is_empty() {
            return Err(ManagerError::FailedPrecondition(format!(
                "cluster {cluster} still has {} queued tasks",
                state.events.task_events.len()
            )));
        }

        let pool_missing = || ManagerError::NotFound(format!("nodepool {} of cluster {cluster}", nodepool.name));
        let current = state
            .current
            .k8s
            .as_ref()
            .and_then(|k8s| k8s.cluster_info.nodepool(&nodepool.name))
            .ok_or_else(pool_missing)?;
        let desired_pool = state
            .desired
            .k8s
            .as_ref()
            .and_then(|k8s| k8s.cluster_info.nodepool(&nodepool.name))
            .ok_or_else(pool_missing)?;

        let Some(bounds) = desired_pool.dynamic().and_then(|d| d.autoscaler) else {
            return Err(ManagerError::FailedPrecondition(format!(
                "nodepool {} is not autoscaled",
                nodepool.name
            )));
        };
        let Some(count) = nodepool.dynamic().map(|d| d.count) else {
            return Err(ManagerError::InvalidArgument(format!(
                "nodepool {} must be presented as a dynamic nodepool",
                nodepool.name
            )));
        };
        if !bounds.contains(count) {
            return Err(ManagerError::InvalidArgument(format!(
                "count {count} of nodepool {} is outside [{}, {}]",
                nodepool.name, bounds.min, bounds.max
            )));
        }

        let classified = classify(current, &nodepool, count)?;
        if classified.deleted.is_empty() && classified.added == 0 {
            debug!(config = %config_name, cluster = %cluster, nodepool = %nodepool.name, "nodepool unchanged");
            return Ok(version);
        }

        let taken: HashSet<String> = current.nodes.iter().map(|n| n.name.clone()).collect();
        let is_control = desired_pool.is_control;
        let mut nodes = classified.reused.clone();
        nodes.extend(
            fresh_node_names(&nodepool.name, &taken, classified.added)
                .into_iter()
                .map(|name| Node {
                    name,
                    private: String::new(),
                    public: String::new(),
                    node_type: member_type(is_control),
                    username: "root".to_string(),
                }),
        );

        let Some(desired_k8s) = state.desired.k8s.as_mut() else {
            return Err(pool_missing());
        };
        let Some(pool) = desired_k8s.cluster_info.nodepool_mut(&nodepool.name) else {
            return Err(pool_missing());
        };
        if let Some(d) = pool.dynamic_mut() {
            d.count = count;
        }
        pool.nodes = nodes;

        let desired_k8s = desired_k8s.clone();
        let desired_lbs = state.desired.load_balancers.clone();
        let mut events = Vec::new();
        if !classified.deleted.is_empty() {
            events.push(TaskEvent::new(
                EventKind::Delete,
                Task::Delete(DeleteState {
                    k8s: None,
                    load_balancers: desired_lbs.clone(),
                    nodepools: BTreeMap::from([(nodepool.name.clone(), classified.deleted.clone())]),
                }),
                &format!("autoscaler removing nodes from nodepool {}", nodepool.name),
            ));
        }
        events.push(TaskEvent::new(
            EventKind::Update,
            Task::Update(UpdateState {
                k8s: desired_k8s,
                load_balancers: desired_lbs,
                api_endpoint_replace: None,
            }),
            &format!("autoscaler resizing nodepool {} to {count}", nodepool.name),
        ));

        let scheduled = events.len() as u64;
        state.events.task_events = events;
        state.events.ttl = 0;
        state.events.autoscaled = true;
        config.manifest.transition(ManifestState::Scheduled)?;

        let new_version = self.store().update_config(&config).map_err(|e| {
            let err = ManagerError::from(e);
            self.note_dirty(&err);
            err
        })?;
        ManagerMetrics::add(&self.metrics().task_events_scheduled, scheduled);
        info!(
            config = %config_name,
            cluster = %cluster,
            nodepool = %nodepool.name,
            count,
            deleted = classified.deleted.len(),
            added = classified.added,
            version = new_version,
            "autoscaler nodepool update scheduled"
        );
        Ok(new_version)
    }
}
