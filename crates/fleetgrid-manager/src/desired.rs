//! Desired-state synthesis.
//!
//! Turns a raw manifest plus the current per-cluster state into the desired
//! snapshot of every cluster. Synthesis works on clones only; the caller
//! decides what to persist.
//!
//! Identity that a builder may already have acted on (cluster hashes,
//! nodepool suffixes, keypairs, DNS hostnames) is carried from current
//! state, or from the previous desired state for anything not built yet.

use std::collections::{BTreeMap, HashSet};

use fleet_core::keys::generate_ssh_keypair;
use fleet_core::manifest::{self, DynamicNodePoolSpec, LbClusterSpec, StaticNodePoolSpec};
use fleet_core::names::{self, HASH_LENGTH};
use fleet_core::{
    ClusterInfo, Dns, DynamicNodePool, K8sCluster, LbCluster, NodePool, NodePoolKind, Role,
    RoleType, StaticNodePool,
};
use fleetgrid_state::{ClusterSnapshot, ClusterState, Manifest};
use tracing::debug;

use crate::error::{ManagerError, ManagerResult};
use crate::nodepools::{self, SuffixRegistry};

/// Desired snapshot per cluster name. Every cluster present in `clusters`
/// appears in the result; clusters no longer declared map to an empty
/// snapshot.
pub fn create_desired_state(
    manifest: &Manifest,
    clusters: &BTreeMap<String, ClusterState>,
) -> ManagerResult<BTreeMap<String, ClusterSnapshot>> {
    let mut desired: BTreeMap<String, ClusterSnapshot> = clusters
        .keys()
        .map(|name| (name.clone(), ClusterSnapshot::default()))
        .collect();

    if manifest.is_deletion_marker() {
        debug!(clusters = desired.len(), "manifest marked for deletion, clearing desired state");
        return Ok(desired);
    }

    let parsed = manifest::Manifest::parse(&manifest.raw)?;
    let mut registry = SuffixRegistry::seeded(clusters.values().flat_map(known_pools));

    for cluster in &parsed.kubernetes.clusters {
        let name = cluster.name.to_lowercase();
        let state = clusters.get(&name);
        let current = state.and_then(|c| c.current.k8s.as_ref());
        let previous = state.and_then(|c| c.desired.k8s.as_ref());
        let siblings: Vec<&NodePool> = current
            .into_iter()
            .chain(previous)
            .flat_map(|k8s| k8s.cluster_info.node_pools.iter())
            .collect();

        let mut node_pools = Vec::new();
        for (templates, is_control) in [(&cluster.pools.control, true), (&cluster.pools.compute, false)] {
            for template in templates {
                let pool = if let Some(np) = parsed.dynamic_pool(template) {
                    let pool_name = registry.reference_name(template, is_control, siblings.iter().copied());
                    dynamic_nodepool(&parsed, np, pool_name, is_control)?
                } else if let Some(np) = parsed.static_pool(template) {
                    static_nodepool(np, is_control)
                } else {
                    return Err(ManagerError::Validation(format!(
                        "cluster {name} references undeclared nodepool {template}"
                    )));
                };
                node_pools.push(pool);
            }
        }

        let mut k8s = K8sCluster {
            cluster_info: ClusterInfo {
                name: name.clone(),
                hash: current
                    .or(previous)
                    .map_or_else(|| names::create_hash(HASH_LENGTH), |c| c.cluster_info.hash.clone()),
                node_pools,
            },
            network: cluster.network.clone(),
            kubernetes: cluster.version.clone(),
            kubeconfig: current.map(|c| c.kubeconfig.clone()).unwrap_or_default(),
        };
        transfer_pools(
            &mut k8s.cluster_info,
            current.map(|c| &c.cluster_info),
            previous.map(|c| &c.cluster_info),
        )?;

        desired.insert(
            name,
            ClusterSnapshot {
                k8s: Some(k8s),
                load_balancers: Default::default(),
            },
        );
    }

    for lb in &parsed.load_balancers.clusters {
        let target = lb.targeted_k8s.to_lowercase();
        let lb_name = lb.name.to_lowercase();
        let state = clusters.get(&target);
        let current_lb = state.and_then(|c| c.current.load_balancers.cluster(&lb_name)).cloned();
        let previous_lb = state.and_then(|c| c.desired.load_balancers.cluster(&lb_name)).cloned();
        let target_k8s = desired
            .get(&target)
            .and_then(|snapshot| snapshot.k8s.as_ref())
            .ok_or_else(|| {
                ManagerError::Internal(format!(
                    "load balancer {} targets kubernetes cluster {target} which was not synthesized",
                    lb.name
                ))
            })?;

        let lb_cluster = lb_cluster(
            &parsed,
            lb,
            target_k8s,
            current_lb.as_ref(),
            previous_lb.as_ref(),
            &mut registry,
        )?;
        if let Some(snapshot) = desired.get_mut(&target) {
            snapshot.load_balancers.clusters.push(lb_cluster);
        }
    }

    Ok(desired)
}

fn snapshot_pools(snapshot: &ClusterSnapshot) -> impl Iterator<Item = &NodePool> {
    let k8s = snapshot
        .k8s
        .iter()
        .flat_map(|k8s| k8s.cluster_info.node_pools.iter());
    let lbs = snapshot
        .load_balancers
        .clusters
        .iter()
        .flat_map(|lb| lb.cluster_info.node_pools.iter());
    k8s.chain(lbs)
}

fn known_pools(state: &ClusterState) -> impl Iterator<Item = &NodePool> {
    snapshot_pools(&state.current).chain(snapshot_pools(&state.desired))
}

fn dynamic_nodepool(
    parsed: &manifest::Manifest,
    np: &DynamicNodePoolSpec,
    name: String,
    is_control: bool,
) -> ManagerResult<NodePool> {
    let provider = parsed.provider(&np.provider).ok_or_else(|| {
        ManagerError::Validation(format!(
            "nodepool {} references undeclared provider {}",
            np.name, np.provider
        ))
    })?;
    let count = np.autoscaler.map_or(np.count, |bounds| bounds.clamp(np.count));
    Ok(NodePool {
        name,
        is_control,
        nodes: Vec::new(),
        kind: NodePoolKind::Dynamic(DynamicNodePool {
            provider: provider.to_provider(),
            region: np.region.clone(),
            zone: np.zone.clone(),
            server_type: np.server_type.clone(),
            image: np.image.clone(),
            storage_disk_size: np.storage_disk_size,
            count,
            autoscaler: np.autoscaler,
            public_key: String::new(),
            private_key: String::new(),
            cidr: String::new(),
        }),
    })
}

fn static_nodepool(np: &StaticNodePoolSpec, is_control: bool) -> NodePool {
    let generated = nodepools::fresh_node_names(&np.name, &HashSet::new(), np.nodes.len());
    let nodes = np
        .nodes
        .iter()
        .zip(generated)
        .map(|(n, name)| nodepools::static_node(name, &n.endpoint, &n.username, is_control))
        .collect();
    let node_keys = np
        .nodes
        .iter()
        .map(|n| (n.endpoint.clone(), n.private_key.clone()))
        .collect();
    NodePool {
        name: np.name.clone(),
        is_control,
        nodes,
        kind: NodePoolKind::Static(StaticNodePool { node_keys }),
    }
}

/// Transfer-forward from the current cluster, reuse what the previous
/// synthesis generated for pools not built yet, then fill in missing keys.
fn transfer_pools(
    desired: &mut ClusterInfo,
    current: Option<&ClusterInfo>,
    previous: Option<&ClusterInfo>,
) -> ManagerResult<()> {
    for pool in &mut desired.node_pools {
        let existing = current.and_then(|c| c.nodepool(&pool.name));
        if let Some(existing) = existing {
            nodepools::transfer_nodepool(pool, existing);
        } else if let Some(earlier) = previous.and_then(|p| p.nodepool(&pool.name)) {
            nodepools::carry_generated(pool, earlier);
        }
        if let NodePoolKind::Static(_) = pool.kind {
            rename_new_static_nodes(pool, existing);
        }
        if let Some(dynamic) = pool.dynamic_mut()
            && !dynamic.has_keypair()
        {
            let pair = generate_ssh_keypair()?;
            dynamic.public_key = pair.public_key;
            dynamic.private_key = pair.private_key;
            debug!(nodepool = %pool.name, "generated ssh keypair");
        }
    }
    Ok(())
}

/// Static nodes that did not inherit a name from current state get the
/// lowest `{pool}-NN` names not used by an inherited one.
fn rename_new_static_nodes(pool: &mut NodePool, current: Option<&NodePool>) {
    let inherited = |public: &str| current.is_some_and(|c| c.nodes.iter().any(|n| n.public == public));
    let taken: HashSet<String> = pool
        .nodes
        .iter()
        .filter(|n| inherited(&n.public))
        .map(|n| n.name.clone())
        .collect();
    let fresh_count = pool.nodes.iter().filter(|n| !inherited(&n.public)).count();
    let mut fresh = nodepools::fresh_node_names(&pool.name, &taken, fresh_count).into_iter();
    for node in &mut pool.nodes {
        if !inherited(&node.public)
            && let Some(name) = fresh.next()
        {
            node.name = name;
        }
    }
}

fn lb_cluster(
    parsed: &manifest::Manifest,
    lb: &LbClusterSpec,
    target: &K8sCluster,
    current: Option<&LbCluster>,
    previous: Option<&LbCluster>,
    registry: &mut SuffixRegistry,
) -> ManagerResult<LbCluster> {
    let siblings: Vec<&NodePool> = current
        .into_iter()
        .chain(previous)
        .flat_map(|c| c.cluster_info.node_pools.iter())
        .collect();

    let mut node_pools = Vec::new();
    for template in &lb.pools {
        let np = parsed.dynamic_pool(template).ok_or_else(|| {
            ManagerError::Validation(format!(
                "load balancer {} references undeclared dynamic nodepool {template}",
                lb.name
            ))
        })?;
        let name = registry.reference_name(template, false, siblings.iter().copied());
        node_pools.push(dynamic_nodepool(parsed, np, name, false)?);
    }

    let mut roles = Vec::new();
    for role_name in &lb.roles {
        let role = parsed.role(role_name).ok_or_else(|| {
            ManagerError::Validation(format!(
                "load balancer {} references undeclared role {role_name}",
                lb.name
            ))
        })?;
        // Targets name manifest pools; resolve them to the target cluster's
        // pool references.
        let target_pools = target
            .cluster_info
            .node_pools
            .iter()
            .filter(|pool| role.target_pools.iter().any(|t| t == nodepools::template_name(pool)))
            .map(|pool| pool.name.clone())
            .collect();
        roles.push(Role {
            name: role.name.clone(),
            protocol: role.protocol.clone(),
            port: role.port,
            target_port: role.target_port,
            target_pools,
            role_type: RoleType::from_target_port(role.target_port),
        });
    }

    let provider = parsed.provider(&lb.dns.provider).ok_or_else(|| {
        ManagerError::Validation(format!(
            "load balancer {} references undeclared dns provider {}",
            lb.name, lb.dns.provider
        ))
    })?;
    let current_dns = current.and_then(|c| c.dns.as_ref());
    let hostname = if !lb.dns.hostname.is_empty() {
        lb.dns.hostname.clone()
    } else {
        current_dns
            .or_else(|| previous.and_then(|c| c.dns.as_ref()))
            .map(|d| d.hostname.clone())
            .unwrap_or_else(|| names::create_hash(HASH_LENGTH))
    };
    let dns = Dns {
        dns_zone: lb.dns.dns_zone.clone(),
        hostname,
        provider: provider.to_provider(),
        endpoint: current_dns.map(|d| d.endpoint.clone()).unwrap_or_default(),
    };

    let mut cluster_info = ClusterInfo {
        name: lb.name.to_lowercase(),
        hash: current
            .or(previous)
            .map_or_else(|| names::create_hash(HASH_LENGTH), |c| c.cluster_info.hash.clone()),
        node_pools,
    };
    transfer_pools(
        &mut cluster_info,
        current.map(|c| &c.cluster_info),
        previous.map(|c| &c.cluster_info),
    )?;

    Ok(LbCluster {
        cluster_info,
        roles,
        dns: Some(dns),
        target_k8s: target.name().to_string(),
    })
}
