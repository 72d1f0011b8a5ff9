//! End-to-end reconciliation tests.
//!
//! Drives the manager through its watchers the way the daemon does, with
//! a simulated builder that claims tasks, "provisions" the requested
//! snapshot and reports back.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_core::{K8sCluster, LoadBalancers, Node, NodePool, NodePoolKind, NodeType};
use fleetgrid_manager::nodepools::fresh_node_names;
use fleetgrid_manager::{Code, Manager, ManagerConfig, ManagerError, ManagerMetrics, NextTask};
use fleetgrid_state::*;

const SINGLE_CONTROL: &str = r#"
name: single
providers:
  - name: hetzner-1
    kind: hetzner
    credentials:
      token: secret
nodePools:
  dynamic:
    - name: control
      provider: hetzner-1
      region: nbg1
      zone: nbg1-dc3
      count: 3
      serverType: cpx11
      image: ubuntu-22.04
kubernetes:
  clusters:
    - name: dev
      version: v1.29.0
      network: 192.168.2.0/24
      pools:
        control: [control]
        compute: []
"#;

const WITH_API_LB: &str = r#"
name: balanced
providers:
  - name: hetzner-1
    kind: hetzner
    credentials:
      token: secret
nodePools:
  dynamic:
    - name: control
      provider: hetzner-1
      region: nbg1
      zone: nbg1-dc3
      count: 1
      serverType: cpx11
      image: ubuntu-22.04
    - name: lb
      provider: hetzner-1
      region: nbg1
      zone: nbg1-dc3
      count: 1
      serverType: cpx11
      image: ubuntu-22.04
kubernetes:
  clusters:
    - name: dev
      version: v1.29.0
      network: 192.168.2.0/24
      pools:
        control: [control]
        compute: []
loadBalancers:
  roles:
    - name: api
      protocol: tcp
      port: 6443
      targetPort: 6443
      targetPools: [control]
  clusters:
    - name: api-lb
      roles: [api]
      dns:
        dnsZone: example.com
        provider: hetzner-1
      targetedK8s: dev
      pools: [lb]
"#;

const AUTOSCALED: &str = r#"
name: scaled
providers:
  - name: hetzner-1
    kind: hetzner
    credentials:
      token: secret
nodePools:
  dynamic:
    - name: control
      provider: hetzner-1
      region: nbg1
      zone: nbg1-dc3
      count: 1
      serverType: cpx11
      image: ubuntu-22.04
    - name: compute
      provider: hetzner-1
      region: nbg1
      zone: nbg1-dc3
      count: 2
      serverType: cpx21
      image: ubuntu-22.04
      autoscaler:
        min: 1
        max: 5
kubernetes:
  clusters:
    - name: dev
      version: v1.29.0
      network: 192.168.2.0/24
      pools:
        control: [control]
        compute: [compute]
    - name: prod
      version: v1.29.0
      network: 192.168.3.0/24
      pools:
        control: [control]
        compute: [compute]
"#;

fn manager() -> Manager {
    let store = StateStore::open_in_memory().unwrap();
    let mut config = ManagerConfig::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    Manager::new(store, config, Arc::new(ManagerMetrics::new()))
}

fn done() -> Workflow {
    Workflow {
        status: WorkflowStatus::Done,
        ..Default::default()
    }
}

fn kinds(events: &[TaskEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.event).collect()
}

// ── Simulated builder ──────────────────────────────────────────

fn fill(pool: &mut NodePool) {
    let Some(count) = pool.dynamic().map(|d| d.count as usize) else {
        return;
    };
    if pool.nodes.len() >= count {
        return;
    }
    let taken: HashSet<String> = pool.nodes.iter().map(|n| n.name.clone()).collect();
    let node_type = if pool.is_control { NodeType::Master } else { NodeType::Worker };
    for name in fresh_node_names(&pool.name, &taken, count - pool.nodes.len()) {
        let index = pool.nodes.len() + 1;
        pool.nodes.push(Node {
            name,
            private: format!("192.168.2.{index}"),
            public: format!("203.0.113.{index}"),
            node_type,
            username: "root".to_string(),
        });
    }
}

fn provision(
    mut k8s: K8sCluster,
    mut lbs: LoadBalancers,
    replace: Option<&ApiEndpointReplace>,
) -> ClusterSnapshot {
    k8s.cluster_info.node_pools.iter_mut().for_each(fill);
    for lb in &mut lbs.clusters {
        lb.cluster_info.node_pools.iter_mut().for_each(fill);
    }

    let leaving = replace.map(|r| r.nodepool.as_str());
    if let Some(pool) = leaving.and_then(|name| k8s.cluster_info.nodepool_mut(name)) {
        for node in &mut pool.nodes {
            if node.node_type == NodeType::ApiEndpoint {
                node.node_type = NodeType::Master;
            }
        }
    }
    let has_endpoint = k8s.cluster_info.node_pools.iter().any(NodePool::has_api_endpoint);
    if !has_endpoint
        && let Some(pool) = k8s
            .cluster_info
            .node_pools
            .iter_mut()
            .find(|p| p.is_control && Some(p.name.as_str()) != leaving && !p.nodes.is_empty())
    {
        pool.nodes[0].node_type = NodeType::ApiEndpoint;
    }

    ClusterSnapshot {
        k8s: Some(k8s),
        load_balancers: lbs,
    }
}

fn remove_nodes(mut current: ClusterSnapshot, delete: &DeleteState) -> ClusterSnapshot {
    if let Some(k8s) = current.k8s.as_mut() {
        for pool in &mut k8s.cluster_info.node_pools {
            let Some(victims) = delete.nodepools.get(&pool.name) else {
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
                NodePoolKind::Dynamic(d) => d.count = pool.nodes.len() as u32,
                NodePoolKind::Static(s) => s.node_keys.retain(|endpoint, _| !gone.contains(endpoint)),
            }
        }
        k8s.cluster_info.node_pools.retain(|pool| !pool.nodes.is_empty());
    }
    current.load_balancers = delete.load_balancers.clone();
    current
}

/// Carry out a claimed task and report it done.
async fn complete(manager: &Manager, task: NextTask) {
    let built = match &task.event.task {
        Task::Create(create) => Some(provision(create.k8s.clone(), create.load_balancers.clone(), None)),
        Task::Update(update) => Some(provision(
            update.k8s.clone(),
            update.load_balancers.clone(),
            update.api_endpoint_replace.as_ref(),
        )),
        Task::Delete(delete) if delete.k8s.is_some() => None,
        Task::Delete(delete) => Some(remove_nodes(task.current.clone(), delete)),
    };

    let mut version = task.version;
    if let Some(current) = built {
        version = manager
            .update_current_state(&task.config, &task.cluster, version, current)
            .await
            .unwrap();
    }
    manager
        .task_update(&task.config, &task.cluster, &task.event.id, version, done())
        .await
        .unwrap();
}

/// Run watcher passes and the builder until nothing is pending or scheduled.
async fn converge(manager: &Manager) {
    for _ in 0..50 {
        manager.done_pass().unwrap();
        manager.pending_pass().unwrap();
        manager.scheduled_pass().unwrap();
        while let Ok(task) = manager.next_task().await {
            complete(manager, task).await;
        }
        manager.scheduled_pass().unwrap();

        let busy = manager
            .list_configs(&[ManifestState::Pending, ManifestState::Scheduled])
            .unwrap();
        if busy.is_empty() && manager.done_pass().unwrap() == 0 {
            return;
        }
    }
    panic!("configs did not converge");
}

/// Upsert an edit and run the passes up to (not including) the builder.
async fn reschedule(manager: &Manager, name: &str, raw: &str) -> Config {
    manager
        .upsert_manifest(name, raw, K8sContext::default())
        .await
        .unwrap();
    manager.done_pass().unwrap();
    manager.pending_pass().unwrap();
    let config = manager.get_config(name).unwrap();
    assert_eq!(config.manifest.state, ManifestState::Scheduled);
    config
}

// ── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn first_upsert_is_synthesized_and_scheduled() {
    let manager = manager();
    let (name, version) = manager
        .upsert_manifest("single", SINGLE_CONTROL, K8sContext::default())
        .await
        .unwrap();
    assert_eq!(version, 0);
    let config = manager.get_config(&name).unwrap();
    assert_eq!(config.manifest.state, ManifestState::Pending);

    manager.pending_pass().unwrap();
    let config = manager.get_config(&name).unwrap();
    assert_eq!(config.manifest.state, ManifestState::Scheduled);
    let k8s = config.clusters["dev"].desired.k8s.as_ref().unwrap();
    assert_eq!(k8s.cluster_info.node_pools.len(), 1);
    let pool = k8s.cluster_info.node_pools[0].dynamic().unwrap();
    assert_eq!(pool.count, 3);
    assert!(pool.public_key.starts_with("ssh-ed25519 "));
    assert!(!pool.private_key.is_empty());
}

#[tokio::test]
async fn full_build_settles_done() {
    let manager = manager();
    manager
        .upsert_manifest("single", SINGLE_CONTROL, K8sContext::default())
        .await
        .unwrap();
    converge(&manager).await;

    let config = manager.get_config("single").unwrap();
    assert_eq!(config.manifest.state, ManifestState::Done);
    assert_eq!(config.manifest.last_applied_checksum, config.manifest.checksum);
    let current = config.clusters["dev"].current.k8s.as_ref().unwrap();
    assert_eq!(current.cluster_info.node_pools[0].nodes.len(), 3);
    assert!(current.api_endpoint_nodepool().is_some());
}

#[tokio::test]
async fn growing_a_pool_is_one_update() {
    let manager = manager();
    manager
        .upsert_manifest("single", SINGLE_CONTROL, K8sContext::default())
        .await
        .unwrap();
    converge(&manager).await;

    let config = reschedule(&manager, "single", &SINGLE_CONTROL.replace("count: 3", "count: 5")).await;
    let events = &config.clusters["dev"].events.task_events;
    assert_eq!(kinds(events), vec![EventKind::Update]);

    converge(&manager).await;
    let config = manager.get_config("single").unwrap();
    let current = config.clusters["dev"].current.k8s.as_ref().unwrap();
    assert_eq!(current.cluster_info.node_pools[0].nodes.len(), 5);
}

#[tokio::test]
async fn shrinking_a_pool_is_one_delete() {
    let manager = manager();
    manager
        .upsert_manifest("single", SINGLE_CONTROL, K8sContext::default())
        .await
        .unwrap();
    converge(&manager).await;
    let before = manager.get_config("single").unwrap();
    let endpoint = before.clusters["dev"]
        .current
        .k8s
        .as_ref()
        .and_then(K8sCluster::api_endpoint_nodepool)
        .and_then(NodePool::api_endpoint_node)
        .unwrap()
        .name
        .clone();

    let config = reschedule(&manager, "single", &SINGLE_CONTROL.replace("count: 3", "count: 1")).await;
    let events = &config.clusters["dev"].events.task_events;
    assert_eq!(kinds(events), vec![EventKind::Delete]);
    let Task::Delete(delete) = &events[0].task else {
        panic!("expected delete task");
    };
    let victims: Vec<&String> = delete.nodepools.values().flatten().collect();
    assert_eq!(victims.len(), 2);
    assert!(!victims.contains(&&endpoint));

    converge(&manager).await;
    let config = manager.get_config("single").unwrap();
    let pool = &config.clusters["dev"].current.k8s.as_ref().unwrap().cluster_info.node_pools[0];
    assert_eq!(pool.nodes.len(), 1);
    assert_eq!(pool.nodes[0].name, endpoint);
}

#[tokio::test]
async fn replacing_the_api_endpoint_pool_attaches_substitute_first() {
    let manager = manager();
    manager
        .upsert_manifest("balanced", WITH_API_LB, K8sContext::default())
        .await
        .unwrap();
    converge(&manager).await;
    let built = manager.get_config("balanced").unwrap();
    let old_pool = built.clusters["dev"]
        .current
        .k8s
        .as_ref()
        .and_then(K8sCluster::api_endpoint_nodepool)
        .unwrap()
        .name
        .clone();

    let edited = WITH_API_LB
        .replace("    - name: control\n", "    - name: control2\n")
        .replace("control: [control]", "control: [control2]")
        .replace("targetPools: [control]", "targetPools: [control2]");
    let config = reschedule(&manager, "balanced", &edited).await;
    let events = &config.clusters["dev"].events.task_events;
    assert!(events.len() >= 3);
    assert_eq!(
        kinds(&events[..3]),
        vec![EventKind::Update, EventKind::Update, EventKind::Delete]
    );

    let Task::Update(first) = &events[0].task else {
        panic!("expected update task");
    };
    assert!(first.api_endpoint_replace.is_none());
    let targets = &first.load_balancers.clusters[0].roles[0].target_pools;
    assert!(targets.contains(&old_pool));
    assert!(targets.iter().any(|t| t.starts_with("control2-")));

    let Task::Update(second) = &events[1].task else {
        panic!("expected update task");
    };
    assert_eq!(
        second.api_endpoint_replace.as_ref().map(|r| r.nodepool.as_str()),
        Some(old_pool.as_str())
    );

    let Task::Delete(delete) = &events[2].task else {
        panic!("expected delete task");
    };
    assert!(delete.nodepools.contains_key(&old_pool));

    converge(&manager).await;
    let config = manager.get_config("balanced").unwrap();
    let current = config.clusters["dev"].current.k8s.as_ref().unwrap();
    let endpoint_pool = current.api_endpoint_nodepool().unwrap();
    assert!(endpoint_pool.name.starts_with("control2-"));
    assert!(current.cluster_info.nodepool(&old_pool).is_none());
}

#[tokio::test]
async fn marked_config_is_torn_down_and_removed() {
    let manager = manager();
    manager
        .upsert_manifest("single", SINGLE_CONTROL, K8sContext::default())
        .await
        .unwrap();
    converge(&manager).await;

    manager.mark_for_deletion("single").await.unwrap();
    manager.done_pass().unwrap();
    manager.pending_pass().unwrap();
    let config = manager.get_config("single").unwrap();
    let dev = &config.clusters["dev"];
    assert!(dev.desired.is_empty());
    assert_eq!(kinds(&dev.events.task_events), vec![EventKind::Delete]);

    converge(&manager).await;
    let err = manager.get_config("single").unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(manager.metrics().snapshot().configs_deleted, 1);
}

#[tokio::test]
async fn concurrent_nodepool_updates_on_one_version() {
    let manager = manager();
    manager
        .upsert_manifest("scaled", AUTOSCALED, K8sContext::default())
        .await
        .unwrap();
    manager.pending_pass().unwrap();
    manager.scheduled_pass().unwrap();

    // Build dev; leave prod's create in flight so the config stays scheduled.
    let mut claimed = Vec::new();
    while let Ok(task) = manager.next_task().await {
        claimed.push(task);
    }
    assert_eq!(claimed.len(), 2);
    let prod = claimed.pop().unwrap();
    let dev = claimed.pop().unwrap();
    assert_eq!(dev.cluster, "dev");
    assert_eq!(prod.cluster, "prod");
    // Claiming prod bumped the version dev was claimed at.
    let mut dev = dev;
    dev.version = manager.get_config("scaled").unwrap().version;
    complete(&manager, dev).await;
    manager.scheduled_pass().unwrap();

    let config = manager.get_config("scaled").unwrap();
    assert_eq!(config.manifest.state, ManifestState::Scheduled);
    let compute = config.clusters["dev"]
        .current
        .k8s
        .as_ref()
        .unwrap()
        .cluster_info
        .node_pools
        .iter()
        .find(|p| p.name.starts_with("compute-"))
        .unwrap()
        .clone();
    let resize = |count: u32| {
        let mut pool = compute.clone();
        if let Some(d) = pool.dynamic_mut() {
            d.count = count;
        }
        pool
    };

    let version = config.version;
    let (a, b) = tokio::join!(
        manager.update_nodepool("scaled", "dev", version, resize(3)),
        manager.update_nodepool("scaled", "dev", version, resize(4)),
    );
    let results = [a, b];
    let wins: Vec<u64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(wins, vec![version + 1]);
    let loser: &ManagerError = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(loser.is_dirty_write());
    assert_eq!(loser.code(), Code::Aborted);

    let config = manager.get_config("scaled").unwrap();
    assert_eq!(config.version, version + 1);
    assert!(config.clusters["dev"].events.autoscaled);
    assert_eq!(
        kinds(&config.clusters["dev"].events.task_events),
        vec![EventKind::Update]
    );

    // Let prod finish; the autoscaled count survives settling.
    let mut prod = prod;
    prod.version = config.version;
    complete(&manager, prod).await;
    converge(&manager).await;
    let config = manager.get_config("scaled").unwrap();
    assert_eq!(config.manifest.state, ManifestState::Done);
    let compute = config.clusters["dev"]
        .current
        .k8s
        .as_ref()
        .unwrap()
        .cluster_info
        .node_pools
        .iter()
        .find(|p| p.name.starts_with("compute-"))
        .unwrap()
        .clone();
    assert_eq!(compute.nodes.len(), 3);
}

#[tokio::test]
async fn failed_task_surfaces_in_error_state() {
    let manager = manager();
    manager
        .upsert_manifest("single", SINGLE_CONTROL, K8sContext::default())
        .await
        .unwrap();
    manager.pending_pass().unwrap();
    manager.scheduled_pass().unwrap();
    let task = manager.next_task().await.unwrap();
    manager
        .task_update(
            "single",
            "dev",
            &task.event.id,
            task.version,
            Workflow {
                status: WorkflowStatus::Error,
                stage: "terraformer".to_string(),
                description: "quota exceeded".to_string(),
                timestamp: 0,
            },
        )
        .await
        .unwrap();
    manager.scheduled_pass().unwrap();

    let config = manager.get_config("single").unwrap();
    assert_eq!(config.manifest.state, ManifestState::Error);
    let workflow = &config.clusters["dev"].workflow;
    assert_eq!(workflow.status, WorkflowStatus::Error);
    assert_eq!(workflow.stage, "terraformer");
    assert!(workflow.timestamp > 0);
    assert_eq!(manager.metrics().snapshot().tasks_failed, 1);
}
