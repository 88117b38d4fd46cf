//! Mapping graphs and the chains walked through them.
//!
//! A [`MappingGraph`] files every artifact under the node names it resolves
//! to for one projection. [`ChainForest`] then expands each origin through
//! those mappings until the walk dies out, loops, or reaches another origin.

use crate::artifact::{Artifact, Metadata};
use crate::kind::{ArtifactKind, OriginType};
use crate::merge::merge_mappings;
use ipnet::IpNet;
use log::{debug, trace};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

/// Chains longer than this are bucketed together.
pub const TOO_DEEP: usize = 10;

/// Label of the terminal node appended for names that failed to resolve.
pub const NXDOMAIN_LABEL: &str = "NXDOMAIN";

pub type Mappings = BTreeMap<String, Vec<Artifact>>;

#[derive(Debug, Clone)]
pub struct MappingGraph {
    origin_type: OriginType,
    target: Option<IpNet>,
    origins: Mappings,
    mappings: Mappings,
}

impl MappingGraph {
    /// Targeted artifacts register origins, all artifacts register mappings.
    /// Each mapping list is normalised with [`merge_mappings`] so the targeted
    /// client is preferred when a node is reached from both sides.
    pub fn build(origin_type: OriginType, target: Option<IpNet>, artifacts: &[Artifact]) -> Self {
        let mut origins = Mappings::new();
        let mut mappings = Mappings::new();

        for artifact in artifacts {
            if artifact.is_targeted(target.as_ref()) {
                for name in artifact.origin_names(origin_type) {
                    origins.entry(name).or_default().push(artifact.clone());
                }
            }
            for name in artifact.mapping_names(origin_type) {
                mappings.entry(name).or_default().push(artifact.clone());
            }
        }

        for entries in mappings.values_mut() {
            *entries = merge_mappings(target.as_ref(), entries);
        }

        debug!(
            "graph.event=built origin={} artifacts={} origins={} mappings={}",
            origin_type.as_str(),
            artifacts.len(),
            origins.len(),
            mappings.len()
        );
        Self { origin_type, target, origins, mappings }
    }

    pub fn origins(&self) -> &Mappings {
        &self.origins
    }

    /// What points at `name` in this projection.
    pub fn lookup(&self, name: &str) -> &[Artifact] {
        self.mappings.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn chains(&self) -> ChainForest {
        ChainForest::build(self)
    }

    fn node_details(&self, name: &str) -> (Metadata, bool) {
        let mut metadata = Metadata::new();
        let mut recon = false;
        let filed = self.origins.get(name).into_iter().chain(self.mappings.get(name)).flatten();
        for artifact in filed {
            recon |= artifact.kind().is_recon();
            for (metadata_type, values) in artifact.metadata() {
                metadata.entry(metadata_type).or_default().extend(values);
            }
        }
        (metadata, recon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum NodeLabel {
    Name(String),
    Nxdomain,
}

impl NodeLabel {
    pub fn as_str(&self) -> &str {
        match self {
            NodeLabel::Name(name) => name,
            NodeLabel::Nxdomain => NXDOMAIN_LABEL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainNode {
    pub label: NodeLabel,
    pub is_target: bool,
    /// How many other chains reached this origin. Only origins are ever referenced.
    pub reference_count: usize,
    pub children: Vec<usize>,
    pub metadata: Metadata,
    pub recon: bool,
}

impl ChainNode {
    fn is_terminal(&self) -> bool {
        matches!(self.label, NodeLabel::Nxdomain)
    }
}

/// Arena of chain nodes. Origins may be shared between chains, so nodes are
/// addressed by index rather than owned by their parents.
#[derive(Debug, Clone)]
pub struct ChainForest {
    origin_type: OriginType,
    nodes: Vec<ChainNode>,
    origins: BTreeMap<String, usize>,
}

impl ChainForest {
    pub fn build(graph: &MappingGraph) -> Self {
        let mut forest = Self { origin_type: graph.origin_type, nodes: Vec::new(), origins: BTreeMap::new() };

        for name in graph.origins.keys() {
            let index = forest.push(graph, NodeLabel::Name(name.clone()), true);
            forest.origins.insert(name.clone(), index);
        }

        let roots: Vec<(String, usize)> = forest.origins.iter().map(|(name, index)| (name.clone(), *index)).collect();
        for (name, index) in roots {
            let mut visited = HashSet::new();
            forest.expand(graph, index, &name, &mut visited);
        }
        forest
    }

    pub fn node(&self, index: usize) -> &ChainNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn origin(&self, name: &str) -> Option<&ChainNode> {
        self.origins.get(name).map(|index| &self.nodes[*index])
    }

    /// Origins no other chain reached, shallowest first. Within a depth bucket
    /// addresses sort numerically and names lexically.
    pub fn roots(&self) -> Vec<usize> {
        let mut by_depth: Vec<Vec<usize>> = vec![Vec::new(); TOO_DEEP];
        let mut memo = HashMap::new();
        for index in self.origins.values() {
            if self.nodes[*index].reference_count > 0 {
                continue;
            }
            let depth = self.depth(*index, 0, &mut memo).min(TOO_DEEP - 1);
            by_depth[depth].push(*index);
        }

        for bucket in by_depth.iter_mut() {
            match self.origin_type {
                OriginType::Address => bucket.sort_by(|a, b| address_order(self.nodes[*a].label.as_str(), self.nodes[*b].label.as_str())),
                OriginType::Fqdn => bucket.sort_by(|a, b| self.nodes[*a].label.as_str().cmp(self.nodes[*b].label.as_str())),
            }
        }
        by_depth.into_iter().flatten().collect()
    }

    /// Depth of the chain below `index`, capped at [`TOO_DEEP`]. Terminal
    /// nodes do not add a level.
    pub fn chain_depth(&self, index: usize) -> usize {
        self.depth(index, 0, &mut HashMap::new())
    }

    /// Nested, serialisable view of every listed root.
    pub fn render(&self) -> Vec<RenderedChain> {
        self.roots().into_iter().map(|index| self.render_node(index, &HashSet::new())).collect()
    }

    fn push(&mut self, graph: &MappingGraph, label: NodeLabel, is_target: bool) -> usize {
        let (metadata, recon) = match &label {
            NodeLabel::Name(name) => graph.node_details(name),
            NodeLabel::Nxdomain => (Metadata::new(), false),
        };
        self.nodes.push(ChainNode { label, is_target, reference_count: 0, children: Vec::new(), metadata, recon });
        self.nodes.len() - 1
    }

    fn expand(&mut self, graph: &MappingGraph, index: usize, name: &str, visited: &mut HashSet<String>) {
        if !visited.insert(name.to_string()) {
            trace!("graph.event=loop name={}", name);
            return;
        }
        let Some(mapped) = graph.mappings.get(name) else {
            return;
        };

        for artifact in mapped {
            if artifact.kind() == ArtifactKind::Nxdomain {
                let terminal = self.push(graph, NodeLabel::Nxdomain, true);
                self.nodes[index].children.push(terminal);
                continue;
            }
            for (child, is_target) in artifact.children(graph.origin_type, graph.target.as_ref()) {
                let child_index = self.link(graph, child, is_target, visited);
                self.nodes[index].children.push(child_index);
            }
        }
    }

    fn link(&mut self, graph: &MappingGraph, name: String, is_target: bool, visited: &mut HashSet<String>) -> usize {
        if let Some(origin) = self.origins.get(&name).copied() {
            self.nodes[origin].reference_count += 1;
            return origin;
        }
        let index = self.push(graph, NodeLabel::Name(name.clone()), is_target);
        self.expand(graph, index, &name, visited);
        index
    }

    fn depth(&self, index: usize, level: usize, memo: &mut HashMap<(usize, usize), usize>) -> usize {
        if let Some(depth) = memo.get(&(index, level)) {
            return *depth;
        }
        let node = &self.nodes[index];
        let depth = if node.is_terminal() {
            level.saturating_sub(1)
        } else if level < TOO_DEEP && !node.children.is_empty() {
            node.children.iter().map(|child| self.depth(*child, level + 1, memo)).max().unwrap_or(level)
        } else {
            level
        };
        memo.insert((index, level), depth);
        depth
    }

    fn render_node(&self, index: usize, seen: &HashSet<usize>) -> RenderedChain {
        let node = &self.nodes[index];
        let mut rendered = RenderedChain {
            name: node.label.as_str().to_string(),
            is_target: node.is_target,
            recon: node.recon,
            metadata: node.metadata.clone(),
            children: Vec::new(),
        };
        if seen.contains(&index) {
            return rendered;
        }
        let mut seen = seen.clone();
        seen.insert(index);
        let mut children: Vec<RenderedChain> = node.children.iter().map(|child| self.render_node(*child, &seen)).collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        rendered.children = children;
        rendered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedChain {
    pub name: String,
    pub is_target: bool,
    pub recon: bool,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RenderedChain>,
}

fn address_order(a: &str, b: &str) -> Ordering {
    match (address_value(a), address_value(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn address_value(name: &str) -> Option<u128> {
    match name.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(u32::from(v4) as u128),
        IpAddr::V6(v6) => Some(u128::from(v6)),
    }
}
