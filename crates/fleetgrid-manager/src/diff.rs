//! Current-vs-desired diff producing ordered task events.
//!
//! Capacity grows before it shrinks: when a reconciliation both adds and
//! removes nodes, an UPDATE with an intermediate snapshot (desired plus
//! everything still to be removed) precedes the DELETE. The API server
//! endpoint is never removed before a substitute control pool is attached
//! to the API-server load balancer role.
//!
//! Emission order, each step only when required:
//!
//! 1. UPDATE(intermediate) on endpoint fixup, or on growth together with
//!    a shrink or with an API-server role change.
//! 2. UPDATE(intermediate, endpoint replace) when the endpoint is deleted.
//! 3. DELETE(per-nodepool node names) on any shrink.
//! 4. UPDATE(desired) for whatever still differs after 1-3.

use std::collections::{BTreeMap, HashSet};

use fleet_core::{K8sCluster, LoadBalancers, NodePool, NodePoolKind, NodeType};
use fleetgrid_state::{
    ApiEndpointReplace, CreateState, DeleteState, EventKind, Task, TaskEvent, UpdateState,
};

/// Diff one cluster. Inputs are only read; every event carries its own
/// clone of the snapshots.
pub fn diff(
    current: Option<&K8sCluster>,
    desired: Option<&K8sCluster>,
    current_lbs: &LoadBalancers,
    desired_lbs: &LoadBalancers,
) -> Vec<TaskEvent> {
    match (current, desired) {
        (None, None) => Vec::new(),
        (None, Some(desired)) => vec![TaskEvent::new(
            EventKind::Create,
            Task::Create(CreateState {
                k8s: desired.clone(),
                load_balancers: desired_lbs.clone(),
            }),
            &format!("creating cluster {}", desired.name()),
        )],
        (Some(current), None) => vec![TaskEvent::new(
            EventKind::Delete,
            Task::Delete(DeleteState {
                k8s: Some(current.clone()),
                load_balancers: current_lbs.clone(),
                nodepools: BTreeMap::new(),
            }),
            &format!("deleting cluster {}", current.name()),
        )],
        (Some(current), Some(desired)) => diff_existing(current, desired, current_lbs, desired_lbs),
    }
}

/// Intermediate state and flags computed for a cluster present on both sides.
struct Plan {
    ir: K8sCluster,
    ir_lbs: LoadBalancers,
    adding: bool,
    endpoint_fixup: bool,
    endpoint_replace: Option<ApiEndpointReplace>,
    /// Nodepool → nodes to remove.
    deletions: BTreeMap<String, Vec<String>>,
    /// Nodepools removed entirely.
    removed: HashSet<String>,
}

impl Plan {
    fn deleting(&self) -> bool {
        !self.deletions.is_empty()
    }
}

fn diff_existing(
    current: &K8sCluster,
    desired: &K8sCluster,
    current_lbs: &LoadBalancers,
    desired_lbs: &LoadBalancers,
) -> Vec<TaskEvent> {
    let plan = plan(current, desired, current_lbs);
    let api_role_changed = current_lbs.has_api_server_role() != desired_lbs.has_api_server_role();
    let name = desired.name();
    let mut events = Vec::new();

    let intermediate =
        plan.endpoint_fixup || (plan.adding && plan.deleting()) || (plan.adding && api_role_changed);
    if intermediate {
        events.push(update(&plan.ir, &plan.ir_lbs, None, &format!("growing cluster {name} before shrinking")));
    }
    if let Some(replace) = &plan.endpoint_replace {
        events.push(update(
            &plan.ir,
            &plan.ir_lbs,
            Some(replace.clone()),
            &format!("moving api endpoint of cluster {name} off nodepool {}", replace.nodepool),
        ));
    }
    if plan.deleting() {
        events.push(TaskEvent::new(
            EventKind::Delete,
            Task::Delete(DeleteState {
                k8s: None,
                load_balancers: plan.ir_lbs.clone(),
                nodepools: plan.deletions.clone(),
            }),
            &format!("removing nodes from cluster {name}"),
        ));
    }

    let updated = intermediate || plan.endpoint_replace.is_some();
    let (mut projected, mut projected_lbs) = if updated {
        (plan.ir.clone(), plan.ir_lbs.clone())
    } else {
        (current.clone(), current_lbs.clone())
    };
    apply_deletions(&mut projected, &mut projected_lbs, &plan, desired);
    if normalized(&projected) != normalized(desired)
        || normalized_lbs(&projected_lbs) != normalized_lbs(desired_lbs)
    {
        events.push(update(desired, desired_lbs, None, &format!("reconciling cluster {name}")));
    }

    events
}

fn plan(current: &K8sCluster, desired: &K8sCluster, current_lbs: &LoadBalancers) -> Plan {
    let mut ir = desired.clone();
    let mut adding = false;
    let mut deletions = BTreeMap::new();
    let mut removed = HashSet::new();

    for want in &desired.cluster_info.node_pools {
        let Some(have) = current.cluster_info.nodepool(&want.name) else {
            adding = true;
            continue;
        };
        match (&have.kind, &want.kind) {
            (NodePoolKind::Dynamic(h), NodePoolKind::Dynamic(w)) => {
                if w.count > h.count {
                    adding = true;
                } else if w.count < h.count {
                    let victims = dynamic_victims(have, (h.count - w.count) as usize);
                    // Keep the current size until the DELETE runs.
                    if let Some(pool) = ir.cluster_info.nodepool_mut(&want.name)
                        && let Some(d) = pool.dynamic_mut()
                    {
                        d.count = h.count;
                        pool.nodes = have.nodes.clone();
                    }
                    deletions.insert(want.name.clone(), victims);
                }
            }
            (NodePoolKind::Static(h), NodePoolKind::Static(w)) => {
                if w.node_keys.keys().any(|endpoint| !h.node_keys.contains_key(endpoint)) {
                    adding = true;
                }
                let gone: Vec<_> = have
                    .nodes
                    .iter()
                    .filter(|n| !w.node_keys.contains_key(&n.public))
                    .collect();
                if gone.is_empty() {
                    continue;
                }
                if let Some(pool) = ir.cluster_info.nodepool_mut(&want.name) {
                    for node in &gone {
                        pool.nodes.push((*node).clone());
                        if let NodePoolKind::Static(s) = &mut pool.kind
                            && let Some(key) = h.node_keys.get(&node.public)
                        {
                            s.node_keys.insert(node.public.clone(), key.clone());
                        }
                    }
                }
                deletions.insert(want.name.clone(), gone.iter().map(|n| n.name.clone()).collect());
            }
            // Same name, different kind: rebuild the pool.
            _ => {
                adding = true;
                deletions.insert(want.name.clone(), node_names(have));
            }
        }
    }

    for have in &current.cluster_info.node_pools {
        if desired.cluster_info.nodepool(&have.name).is_none() {
            ir.cluster_info.node_pools.push(have.clone());
            deletions.insert(have.name.clone(), node_names(have));
            removed.insert(have.name.clone());
        }
    }

    let mut endpoint_replace = current.api_endpoint_nodepool().and_then(|pool| {
        let node = pool.api_endpoint_node()?;
        deletions
            .get(&pool.name)
            .is_some_and(|victims| victims.contains(&node.name))
            .then(|| ApiEndpointReplace {
                nodepool: pool.name.clone(),
                node: Some(node.name.clone()),
            })
    });

    // An API-server role left with only removed targets gets a surviving
    // control pool attached before anything is deleted.
    let substitute = desired
        .cluster_info
        .control_nodepools()
        .next()
        .map(|pool| pool.name.clone());
    let mut ir_lbs = current_lbs.clone();
    let mut endpoint_fixup = false;
    for lb in &mut ir_lbs.clusters {
        for role in lb.roles.iter_mut().filter(|r| r.is_api_server()) {
            let orphaned = !role.target_pools.is_empty()
                && role.target_pools.iter().all(|t| removed.contains(t));
            if !orphaned {
                continue;
            }
            let Some(substitute) = &substitute else {
                continue;
            };
            if endpoint_replace.is_none() {
                endpoint_replace = Some(ApiEndpointReplace {
                    nodepool: role.target_pools[0].clone(),
                    node: None,
                });
            }
            role.target_pools.push(substitute.clone());
            endpoint_fixup = true;
        }
    }

    Plan {
        ir,
        ir_lbs,
        adding,
        endpoint_fixup,
        endpoint_replace,
        deletions,
        removed,
    }
}

/// `count` nodes to remove from a dynamic pool, taken from the tail and
/// sparing the API endpoint node unless nothing else is left.
fn dynamic_victims(pool: &NodePool, count: usize) -> Vec<String> {
    let mut victims: Vec<String> = pool
        .nodes
        .iter()
        .rev()
        .filter(|n| n.node_type != NodeType::ApiEndpoint)
        .take(count)
        .map(|n| n.name.clone())
        .collect();
    if victims.len() < count
        && let Some(endpoint) = pool.api_endpoint_node()
    {
        victims.push(endpoint.name.clone());
    }
    victims
}

fn node_names(pool: &NodePool) -> Vec<String> {
    pool.nodes.iter().map(|n| n.name.clone()).collect()
}

fn update(
    k8s: &K8sCluster,
    lbs: &LoadBalancers,
    api_endpoint_replace: Option<ApiEndpointReplace>,
    description: &str,
) -> TaskEvent {
    TaskEvent::new(
        EventKind::Update,
        Task::Update(UpdateState {
            k8s: k8s.clone(),
            load_balancers: lbs.clone(),
            api_endpoint_replace,
        }),
        description,
    )
}

/// What the cluster looks like once the DELETE of `plan` has run.
fn apply_deletions(k8s: &mut K8sCluster, lbs: &mut LoadBalancers, plan: &Plan, desired: &K8sCluster) {
    k8s.cluster_info
        .node_pools
        .retain(|pool| !plan.removed.contains(&pool.name));
    for pool in &mut k8s.cluster_info.node_pools {
        let Some(victims) = plan.deletions.get(&pool.name) else {
            continue;
        };
        let gone: Vec<String> = pool
            .nodes
            .iter()
            .filter(|n| victims.contains(&n.name))
            .map(|n| n.public.clone())
            .collect();
        pool.nodes.retain(|n| !victims.contains(&n.name));
        match &mut pool.kind {
            NodePoolKind::Dynamic(d) => {
                if let Some(target) = desired.cluster_info.nodepool(&pool.name).and_then(NodePool::dynamic) {
                    d.count = target.count;
                }
            }
            NodePoolKind::Static(s) => {
                for endpoint in gone {
                    s.node_keys.remove(&endpoint);
                }
            }
        }
    }
    for lb in &mut lbs.clusters {
        for role in &mut lb.roles {
            role.target_pools.retain(|t| !plan.removed.contains(t));
        }
    }
}

/// Node lists belong to the builders; compare pool shape only.
fn normalized(k8s: &K8sCluster) -> K8sCluster {
    let mut out = k8s.clone();
    for pool in &mut out.cluster_info.node_pools {
        pool.nodes.clear();
    }
    out.cluster_info.node_pools.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn normalized_lbs(lbs: &LoadBalancers) -> LoadBalancers {
    let mut out = lbs.clone();
    for lb in &mut out.clusters {
        for pool in &mut lb.cluster_info.node_pools {
            pool.nodes.clear();
        }
    }
    out.clusters
        .sort_by(|a, b| a.cluster_info.name.cmp(&b.cluster_info.name));
    out
}
