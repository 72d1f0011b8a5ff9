//! Nodepool reference naming and transfer-forward.
//!
//! A dynamic nodepool declared once in the manifest may be referenced by
//! several clusters. Each reference becomes its own pool named
//! `{template}-{suffix}`. A reference keeps the suffix its counterpart in
//! current state already carries, or failing that the one the previous
//! desired state gave it, so repeated synthesis yields the same names; new
//! references draw a suffix not used by any other reference to the same
//! template.

use std::collections::{HashMap, HashSet};

use fleet_core::names::{self, HASH_LENGTH};
use fleet_core::{Node, NodePool, NodePoolKind, NodeType};

/// Suffixes already claimed per template name.
#[derive(Debug, Default)]
pub struct SuffixRegistry {
    used: HashMap<String, HashSet<String>>,
}

impl SuffixRegistry {
    /// Seed the registry with every suffix present in current or previously
    /// desired state so new references never collide with an existing pool.
    pub fn seeded<'a>(current: impl IntoIterator<Item = &'a NodePool>) -> Self {
        let mut registry = Self::default();
        for pool in current {
            if let Some((template, suffix)) = dynamic_parts(pool) {
                registry.claim(template, suffix);
            }
        }
        registry
    }

    fn claim(&mut self, template: &str, suffix: &str) {
        self.used
            .entry(template.to_string())
            .or_default()
            .insert(suffix.to_string());
    }

    /// Name for a reference to dynamic template `template` with the given
    /// role. `siblings` are the known pools of the owning cluster, current
    /// ones first.
    pub fn reference_name<'a>(
        &mut self,
        template: &str,
        is_control: bool,
        siblings: impl IntoIterator<Item = &'a NodePool>,
    ) -> String {
        let existing = siblings.into_iter().find_map(|pool| match dynamic_parts(pool) {
            Some((t, suffix)) if t == template && pool.is_control == is_control => Some(suffix),
            _ => None,
        });
        if let Some(suffix) = existing {
            self.claim(template, suffix);
            return names::with_suffix(template, suffix);
        }

        let taken = self.used.entry(template.to_string()).or_default();
        let suffix = loop {
            let candidate = names::create_hash(HASH_LENGTH);
            if taken.insert(candidate.clone()) {
                break candidate;
            }
        };
        names::with_suffix(template, &suffix)
    }
}

/// `(template, suffix)` of a dynamic pool carrying a reference suffix.
fn dynamic_parts(pool: &NodePool) -> Option<(&str, &str)> {
    match pool.kind {
        NodePoolKind::Dynamic(_) => names::split_suffix(&pool.name),
        NodePoolKind::Static(_) => None,
    }
}

/// Manifest name a pool was created from.
pub fn template_name(pool: &NodePool) -> &str {
    dynamic_parts(pool).map_or(pool.name.as_str(), |(template, _)| template)
}

/// Carry builder-owned state from the current pool into its desired
/// counterpart of the same name.
pub fn transfer_nodepool(desired: &mut NodePool, current: &NodePool) {
    match (&mut desired.kind, &current.kind) {
        (NodePoolKind::Dynamic(want), NodePoolKind::Dynamic(have)) => {
            if have.has_keypair() {
                want.public_key = have.public_key.clone();
                want.private_key = have.private_key.clone();
            }
            if !have.cidr.is_empty() {
                want.cidr = have.cidr.clone();
            }
            want.count = match (have.autoscaler, want.autoscaler) {
                (Some(_), Some(_)) => have.count,
                (None, Some(bounds)) => bounds.clamp(have.count),
                _ => want.count,
            };
            desired.nodes = current.nodes.clone();
        }
        (NodePoolKind::Static(_), NodePoolKind::Static(_)) => {
            for node in &mut desired.nodes {
                if let Some(existing) = current.nodes.iter().find(|n| n.public == node.public) {
                    node.name = existing.name.clone();
                    node.private = existing.private.clone();
                    node.node_type = existing.node_type;
                }
            }
        }
        // Kind changed under the same name: nothing carries over.
        _ => {}
    }
}

/// Reuse what an earlier synthesis generated for a pool that was never
/// built: its keypair and CIDR.
pub fn carry_generated(desired: &mut NodePool, previous: &NodePool) {
    if let (NodePoolKind::Dynamic(want), NodePoolKind::Dynamic(had)) = (&mut desired.kind, &previous.kind) {
        if had.has_keypair() {
            want.public_key = had.public_key.clone();
            want.private_key = had.private_key.clone();
        }
        if !had.cidr.is_empty() {
            want.cidr = had.cidr.clone();
        }
    }
}

/// `count` fresh node names `{pool}-NN`, lowest unused indices first.
pub fn fresh_node_names(pool: &str, taken: &HashSet<String>, count: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(count);
    let mut index = 1usize;
    while out.len() < count {
        let candidate = format!("{pool}-{index:02}");
        if !taken.contains(&candidate) {
            out.push(candidate);
        }
        index += 1;
    }
    out
}

/// Default node type for members of a pool.
pub fn member_type(is_control: bool) -> NodeType {
    if is_control {
        NodeType::Master
    } else {
        NodeType::Worker
    }
}

/// Build a node for a static endpoint, named later by transfer or by
/// [`fresh_node_names`].
pub fn static_node(name: String, endpoint: &str, username: &str, is_control: bool) -> Node {
    Node {
        name,
        private: String::new(),
        public: endpoint.to_string(),
        node_type: member_type(is_control),
        username: username.to_string(),
    }
}
