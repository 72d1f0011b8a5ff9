//! User manifest schema and structural validation.
//!
//! The manifest declares providers, nodepools, Kubernetes clusters and load
//! balancers in YAML. Upstream collaborators validate syntax and resolve
//! credentials before submitting; [`Manifest::parse`] re-checks the
//! structure (declared references, uniqueness, value ranges) but never
//! contacts a provider.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::infra::{AutoscalerConfig, Provider, ProviderKind};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Parse(String),
    #[error("invalid manifest: {0}")]
    Validation(String),
}

fn invalid(msg: impl Into<String>) -> ManifestError {
    ManifestError::Validation(msg.into())
}

/// SHA-256 hex digest of the raw manifest text.
pub fn checksum(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    #[serde(default)]
    pub node_pools: NodePoolsSpec,
    #[serde(default)]
    pub kubernetes: KubernetesSpec,
    #[serde(default)]
    pub load_balancers: LoadBalancersSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

impl ProviderSpec {
    pub fn to_provider(&self) -> Provider {
        Provider {
            spec_name: self.name.clone(),
            kind: self.kind,
            credentials: self.credentials.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePoolsSpec {
    #[serde(default)]
    pub dynamic: Vec<DynamicNodePoolSpec>,
    #[serde(default, rename = "static")]
    pub static_pools: Vec<StaticNodePoolSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicNodePoolSpec {
    pub name: String,
    pub provider: String,
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub count: u32,
    pub server_type: String,
    pub image: String,
    #[serde(default)]
    pub storage_disk_size: u32,
    #[serde(default)]
    pub autoscaler: Option<AutoscalerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticNodePoolSpec {
    pub name: String,
    pub nodes: Vec<StaticNodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticNodeSpec {
    pub endpoint: String,
    #[serde(default = "default_username")]
    pub username: String,
    pub private_key: String,
}

fn default_username() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesSpec {
    #[serde(default)]
    pub clusters: Vec<K8sClusterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sClusterSpec {
    pub name: String,
    pub version: String,
    pub network: String,
    pub pools: PoolsSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolsSpec {
    #[serde(default)]
    pub control: Vec<String>,
    #[serde(default)]
    pub compute: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancersSpec {
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    #[serde(default)]
    pub clusters: Vec<LbClusterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    pub target_port: u16,
    #[serde(default)]
    pub target_pools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LbClusterSpec {
    pub name: String,
    pub roles: Vec<String>,
    pub dns: DnsSpec,
    pub targeted_k8s: String,
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSpec {
    pub dns_zone: String,
    pub provider: String,
    #[serde(default)]
    pub hostname: String,
}

impl Manifest {
    /// Parse YAML and validate the result.
    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_yaml::from_str(raw).map_err(|e| ManifestError::Parse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn dynamic_pool(&self, name: &str) -> Option<&DynamicNodePoolSpec> {
        self.node_pools.dynamic.iter().find(|np| np.name == name)
    }

    pub fn static_pool(&self, name: &str) -> Option<&StaticNodePoolSpec> {
        self.node_pools.static_pools.iter().find(|np| np.name == name)
    }

    pub fn role(&self, name: &str) -> Option<&RoleSpec> {
        self.load_balancers.roles.iter().find(|r| r.name == name)
    }

    fn is_nodepool_declared(&self, name: &str) -> bool {
        self.dynamic_pool(name).is_some() || self.static_pool(name).is_some()
    }

    /// Structural validation of every cross reference in the manifest.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(invalid("manifest name must not be empty"));
        }

        unique("provider", self.providers.iter().map(|p| p.name.as_str()))?;
        unique(
            "nodepool",
            self.node_pools
                .dynamic
                .iter()
                .map(|np| np.name.as_str())
                .chain(self.node_pools.static_pools.iter().map(|np| np.name.as_str())),
        )?;
        unique(
            "kubernetes cluster",
            self.kubernetes.clusters.iter().map(|c| c.name.as_str()),
        )?;
        unique(
            "load balancer role",
            self.load_balancers.roles.iter().map(|r| r.name.as_str()),
        )?;
        unique(
            "load balancer cluster",
            self.load_balancers.clusters.iter().map(|c| c.name.as_str()),
        )?;

        self.validate_nodepools()?;
        self.validate_kubernetes()?;
        self.validate_load_balancers()?;
        Ok(())
    }

    fn validate_nodepools(&self) -> Result<(), ManifestError> {
        for np in &self.node_pools.dynamic {
            let provider = self.provider(&np.provider).ok_or_else(|| {
                invalid(format!(
                    "nodepool {} references undeclared provider {}",
                    np.name, np.provider
                ))
            })?;
            if !provider.kind.supports_nodes() {
                return Err(invalid(format!(
                    "provider {} used by nodepool {} cannot provision nodes",
                    provider.name, np.name
                )));
            }
            if let Some(autoscaler) = &np.autoscaler
                && autoscaler.min > autoscaler.max
            {
                return Err(invalid(format!(
                    "nodepool {}: autoscaler min {} exceeds max {}",
                    np.name, autoscaler.min, autoscaler.max
                )));
            }
        }

        for np in &self.node_pools.static_pools {
            if np.nodes.is_empty() {
                return Err(invalid(format!("static nodepool {} has no nodes", np.name)));
            }
            unique(
                &format!("endpoint in static nodepool {}", np.name),
                np.nodes.iter().map(|n| n.endpoint.as_str()),
            )?;
        }
        Ok(())
    }

    fn validate_kubernetes(&self) -> Result<(), ManifestError> {
        let mut static_refs: HashMap<&str, &str> = HashMap::new();

        for cluster in &self.kubernetes.clusters {
            if cluster.pools.control.is_empty() {
                return Err(invalid(format!(
                    "cluster {} needs at least one control nodepool",
                    cluster.name
                )));
            }
            semver::Version::parse(cluster.version.trim_start_matches('v')).map_err(|e| {
                invalid(format!(
                    "cluster {}: invalid kubernetes version {}: {e}",
                    cluster.name, cluster.version
                ))
            })?;
            validate_cidr(&cluster.network).map_err(|reason| {
                invalid(format!(
                    "cluster {}: invalid network {}: {reason}",
                    cluster.name, cluster.network
                ))
            })?;

            for (role, pools) in [("control", &cluster.pools.control), ("compute", &cluster.pools.compute)] {
                unique(
                    &format!("{role} nodepool of cluster {}", cluster.name),
                    pools.iter().map(String::as_str),
                )?;
                for pool in pools {
                    if !self.is_nodepool_declared(pool) {
                        return Err(invalid(format!(
                            "cluster {} references undeclared nodepool {pool}",
                            cluster.name
                        )));
                    }
                    if self.static_pool(pool).is_some()
                        && let Some(owner) = static_refs.insert(pool, &cluster.name)
                    {
                        return Err(invalid(format!(
                            "static nodepool {pool} is referenced more than once (cluster {owner} and {})",
                            cluster.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_load_balancers(&self) -> Result<(), ManifestError> {
        for role in &self.load_balancers.roles {
            for pool in &role.target_pools {
                if !self.is_nodepool_declared(pool) {
                    return Err(invalid(format!(
                        "role {} targets undeclared nodepool {pool}",
                        role.name
                    )));
                }
            }
        }

        for lb in &self.load_balancers.clusters {
            if !self.kubernetes.clusters.iter().any(|c| c.name == lb.targeted_k8s) {
                return Err(invalid(format!(
                    "load balancer {} targets undeclared kubernetes cluster {}",
                    lb.name, lb.targeted_k8s
                )));
            }
            for role in &lb.roles {
                if self.role(role).is_none() {
                    return Err(invalid(format!(
                        "load balancer {} references undeclared role {role}",
                        lb.name
                    )));
                }
            }
            if lb.pools.is_empty() {
                return Err(invalid(format!("load balancer {} has no nodepools", lb.name)));
            }
            unique(
                &format!("nodepool of load balancer {}", lb.name),
                lb.pools.iter().map(String::as_str),
            )?;
            for pool in &lb.pools {
                if self.dynamic_pool(pool).is_none() {
                    return Err(invalid(format!(
                        "load balancer {} references undeclared dynamic nodepool {pool}",
                        lb.name
                    )));
                }
            }

            let provider = self.provider(&lb.dns.provider).ok_or_else(|| {
                invalid(format!(
                    "load balancer {} references undeclared dns provider {}",
                    lb.name, lb.dns.provider
                ))
            })?;
            if !provider.kind.supports_dns() {
                return Err(invalid(format!(
                    "provider {} used by load balancer {} does not support DNS",
                    provider.name, lb.name
                )));
            }
        }
        Ok(())
    }
}

fn unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(invalid(format!("{what} name must not be empty")));
        }
        if !seen.insert(name) {
            return Err(invalid(format!("duplicate {what} {name}")));
        }
    }
    Ok(())
}

fn validate_cidr(cidr: &str) -> Result<(), String> {
    let (addr, prefix) = cidr.split_once('/').ok_or("missing prefix length")?;
    addr.parse::<Ipv4Addr>().map_err(|e| e.to_string())?;
    let prefix: u8 = prefix.parse().map_err(|_| "prefix is not a number".to_string())?;
    if prefix > 32 {
        return Err(format!("prefix /{prefix} out of range"));
    }
    Ok(())
}
