//! Infrastructure snapshot types.
//!
//! These describe a Kubernetes cluster, its nodepools and the load balancers
//! attached to it. The manager stores one `current` and one `desired`
//! snapshot per cluster and hands snapshots to builder workers inside task
//! events. Everything here is plain data: serializable, cloneable and
//! compared by value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Port the Kubernetes API server listens on. A load balancer role that
/// forwards to this port is an API-server role.
pub const API_SERVER_PORT: u16 = 6443;

// ── Providers ─────────────────────────────────────────────────────

/// Cloud or DNS provider backing a nodepool or a DNS record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Hetzner,
    Gcp,
    Aws,
    Azure,
    Oci,
    GenesisCloud,
    Cloudflare,
    HetznerDns,
}

impl ProviderKind {
    /// Whether DNS records can be managed through this provider.
    pub fn supports_dns(self) -> bool {
        !matches!(self, ProviderKind::GenesisCloud)
    }

    /// Whether machines can be provisioned through this provider.
    pub fn supports_nodes(self) -> bool {
        !matches!(self, ProviderKind::Cloudflare | ProviderKind::HetznerDns)
    }
}

/// A provider as declared in the manifest. Credentials are opaque to the
/// manager and passed through to the builders untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub spec_name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

// ── Nodes ─────────────────────────────────────────────────────────

/// Role of a node inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Worker,
    Master,
    /// Control-plane node currently exposed as the Kubernetes API endpoint.
    ApiEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Private (VPN) address.
    #[serde(default)]
    pub private: String,
    /// Public address; the identity of a static node.
    #[serde(default)]
    pub public: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub username: String,
}

// ── Nodepools ─────────────────────────────────────────────────────

/// Autoscaling bounds for a dynamic nodepool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    pub min: u32,
    pub max: u32,
}

impl AutoscalerConfig {
    /// Clamp a node count into `[min, max]`.
    pub fn clamp(&self, count: u32) -> u32 {
        count.max(self.min).min(self.max)
    }

    pub fn contains(&self, count: u32) -> bool {
        (self.min..=self.max).contains(&count)
    }
}

/// Cloud-provisioned nodepool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicNodePool {
    pub provider: Provider,
    pub region: String,
    pub zone: String,
    pub server_type: String,
    pub image: String,
    #[serde(default)]
    pub storage_disk_size: u32,
    pub count: u32,
    #[serde(default)]
    pub autoscaler: Option<AutoscalerConfig>,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub cidr: String,
}

impl DynamicNodePool {
    pub fn has_keypair(&self) -> bool {
        !self.public_key.is_empty() && !self.private_key.is_empty()
    }
}

/// Pre-existing machines reachable over SSH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticNodePool {
    /// Public endpoint → private SSH key.
    #[serde(default)]
    pub node_keys: BTreeMap<String, String>,
}

/// The two nodepool flavours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodePoolKind {
    Dynamic(DynamicNodePool),
    Static(StaticNodePool),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub is_control: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    pub kind: NodePoolKind,
}

impl NodePool {
    /// Declared size: `count` for dynamic pools, number of endpoints for
    /// static pools.
    pub fn size(&self) -> usize {
        match &self.kind {
            NodePoolKind::Dynamic(dynamic) => dynamic.count as usize,
            NodePoolKind::Static(stat) => stat.node_keys.len(),
        }
    }

    pub fn dynamic(&self) -> Option<&DynamicNodePool> {
        match &self.kind {
            NodePoolKind::Dynamic(dynamic) => Some(dynamic),
            NodePoolKind::Static(_) => None,
        }
    }

    pub fn dynamic_mut(&mut self) -> Option<&mut DynamicNodePool> {
        match &mut self.kind {
            NodePoolKind::Dynamic(dynamic) => Some(dynamic),
            NodePoolKind::Static(_) => None,
        }
    }

    pub fn is_autoscaled(&self) -> bool {
        self.dynamic().is_some_and(|d| d.autoscaler.is_some())
    }

    pub fn api_endpoint_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.node_type == NodeType::ApiEndpoint)
    }

    pub fn has_api_endpoint(&self) -> bool {
        self.api_endpoint_node().is_some()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

// ── Clusters ──────────────────────────────────────────────────────

/// Identity and nodepools shared by K8s and LB clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub hash: String,
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

impl ClusterInfo {
    /// Unique cluster identifier, `{name}-{hash}`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.hash)
    }

    pub fn nodepool(&self, name: &str) -> Option<&NodePool> {
        self.node_pools.iter().find(|np| np.name == name)
    }

    pub fn nodepool_mut(&mut self, name: &str) -> Option<&mut NodePool> {
        self.node_pools.iter_mut().find(|np| np.name == name)
    }

    pub fn control_nodepools(&self) -> impl Iterator<Item = &NodePool> {
        self.node_pools.iter().filter(|np| np.is_control)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sCluster {
    pub cluster_info: ClusterInfo,
    /// Private network CIDR of the cluster.
    pub network: String,
    /// Kubernetes version, e.g. `v1.29.0`.
    pub kubernetes: String,
    #[serde(default)]
    pub kubeconfig: String,
}

impl K8sCluster {
    pub fn name(&self) -> &str {
        &self.cluster_info.name
    }

    /// The nodepool holding the node currently exposed as API endpoint.
    pub fn api_endpoint_nodepool(&self) -> Option<&NodePool> {
        self.cluster_info
            .node_pools
            .iter()
            .find(|np| np.has_api_endpoint())
    }
}

// ── Load balancers ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleType {
    ApiServer,
    Ingress,
}

impl RoleType {
    pub fn from_target_port(target_port: u16) -> Self {
        if target_port == API_SERVER_PORT {
            RoleType::ApiServer
        } else {
            RoleType::Ingress
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    pub target_port: u16,
    /// Names of the K8s nodepools traffic is forwarded to.
    pub target_pools: Vec<String>,
    pub role_type: RoleType,
}

impl Role {
    pub fn is_api_server(&self) -> bool {
        self.role_type == RoleType::ApiServer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    pub dns_zone: String,
    pub hostname: String,
    pub provider: Provider,
    /// Resolved endpoint, filled in by the builders.
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbCluster {
    pub cluster_info: ClusterInfo,
    pub roles: Vec<Role>,
    pub dns: Option<Dns>,
    /// Name of the K8s cluster this load balancer serves.
    pub target_k8s: String,
}

impl LbCluster {
    pub fn has_api_server_role(&self) -> bool {
        self.roles.iter().any(Role::is_api_server)
    }
}

/// All load balancers attached to one K8s cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancers {
    #[serde(default)]
    pub clusters: Vec<LbCluster>,
}

impl LoadBalancers {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn has_api_server_role(&self) -> bool {
        self.clusters.iter().any(LbCluster::has_api_server_role)
    }

    pub fn cluster(&self, name: &str) -> Option<&LbCluster> {
        self.clusters.iter().find(|lb| lb.cluster_info.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic_pool(name: &str, count: u32) -> NodePool {
        NodePool {
            name: name.to_string(),
            is_control: true,
            nodes: Vec::new(),
            kind: NodePoolKind::Dynamic(DynamicNodePool {
                provider: Provider {
                    spec_name: "hetzner-1".to_string(),
                    kind: ProviderKind::Hetzner,
                    credentials: BTreeMap::new(),
                },
                region: "nbg1".to_string(),
                zone: "nbg1-dc3".to_string(),
                server_type: "cpx11".to_string(),
                image: "ubuntu-22.04".to_string(),
                storage_disk_size: 50,
                count,
                autoscaler: None,
                public_key: String::new(),
                private_key: String::new(),
                cidr: String::new(),
            }),
        }
    }

    #[test]
    fn role_type_follows_target_port() {
        assert_eq!(RoleType::from_target_port(6443), RoleType::ApiServer);
        assert_eq!(RoleType::from_target_port(443), RoleType::Ingress);
    }

    #[test]
    fn nodepool_size_by_kind() {
        let dynamic = dynamic_pool("control", 3);
        assert_eq!(dynamic.size(), 3);

        let mut node_keys = BTreeMap::new();
        node_keys.insert("10.0.0.1".to_string(), "key".to_string());
        node_keys.insert("10.0.0.2".to_string(), "key".to_string());
        let stat = NodePool {
            name: "onprem".to_string(),
            is_control: false,
            nodes: Vec::new(),
            kind: NodePoolKind::Static(StaticNodePool { node_keys }),
        };
        assert_eq!(stat.size(), 2);
        assert!(stat.dynamic().is_none());
        assert!(!stat.is_autoscaled());
    }

    #[test]
    fn autoscaler_clamp() {
        let cfg = AutoscalerConfig { min: 2, max: 5 };
        assert_eq!(cfg.clamp(0), 2);
        assert_eq!(cfg.clamp(4), 4);
        assert_eq!(cfg.clamp(9), 5);
        assert!(cfg.contains(5));
        assert!(!cfg.contains(6));
    }

    #[test]
    fn nodepool_kind_serializes_tagged() {
        let np = dynamic_pool("control", 1);
        let json = serde_json::to_value(&np).unwrap();
        assert_eq!(json["kind"]["type"], "dynamic");
        let back: NodePool = serde_json::from_value(json).unwrap();
        assert_eq!(back, np);
    }

    #[test]
    fn api_endpoint_lookup() {
        let mut np = dynamic_pool("control", 2);
        np.nodes.push(Node {
            name: "control-01".to_string(),
            private: "192.168.2.1".to_string(),
            public: "1.1.1.1".to_string(),
            node_type: NodeType::ApiEndpoint,
            username: "root".to_string(),
        });
        let cluster = K8sCluster {
            cluster_info: ClusterInfo {
                name: "dev".to_string(),
                hash: "abcdefg".to_string(),
                node_pools: vec![np],
            },
            network: "192.168.2.0/24".to_string(),
            kubernetes: "v1.29.0".to_string(),
            kubeconfig: String::new(),
        };
        assert_eq!(cluster.cluster_info.id(), "dev-abcdefg");
        assert_eq!(
            cluster.api_endpoint_nodepool().map(|np| np.name.as_str()),
            Some("control")
        );
    }
}
