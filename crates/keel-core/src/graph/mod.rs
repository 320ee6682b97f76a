//! The raw dependency graph: every candidate, nothing selected yet.
//!
//! Nodes are `(Coordinate, Version)` pairs with their descriptor. Edges record
//! a requirement together with *all* versions that satisfy it; picking one is
//! the conflict resolver's job. A node is expanded once per distinct exclusion
//! context it was reached with, so the same node can have several outgoing
//! edge sets. Cycles are allowed.

mod builder;

use keel_schema::{Coordinate, DependencyRequirement, ExclusionSet, ModuleDescriptor, Version};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::RequirementChain;

pub use builder::build_graph;

/// Index of a node in a [`RawGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

/// Index of an interned exclusion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(usize);

/// Index of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);

/// One `(Coordinate, Version)` with its descriptor.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Module.
    pub coordinate: Coordinate,
    /// Version.
    pub version: Version,
    /// Fetched descriptor.
    pub descriptor: Arc<ModuleDescriptor>,
    /// Repository that served the descriptor.
    pub repository: Option<String>,
}

/// Who declared a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeSource {
    /// The resolution roots.
    Root,
    /// A node's descriptor, expanded under `context`.
    Node {
        /// Declaring node.
        node: NodeId,
        /// Context the node was expanded with.
        context: ContextId,
    },
}

/// Why a requirement has no candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    /// The module exists but no version satisfies the constraint.
    NoMatchingVersion {
        /// Every published version.
        available: Vec<Version>,
    },
    /// No repository knows the module.
    ModuleNotFound,
}

/// What a requirement resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget {
    /// Satisfying versions, ascending and non-empty.
    Resolved {
        /// Candidate versions.
        candidates: Vec<Version>,
    },
    /// No candidates; fatal only if the edge ends up live.
    Unresolved(Unresolved),
}

/// A requirement edge.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    /// Declaring side.
    pub source: EdgeSource,
    /// The requirement as it applies (transitive force already handled).
    pub requirement: DependencyRequirement,
    /// Context the target is expanded with.
    pub child_context: ContextId,
    /// Candidates.
    pub target: EdgeTarget,
}

impl GraphEdge {
    /// The coordinate this edge requires.
    pub fn coordinate(&self) -> &Coordinate {
        &self.requirement.coordinate
    }

    /// The version this edge would pick on its own.
    pub fn preferred(&self) -> Option<&Version> {
        match &self.target {
            EdgeTarget::Resolved { candidates } => candidates.last(),
            EdgeTarget::Unresolved(_) => None,
        }
    }
}

/// Output of [`build_graph`].
#[derive(Debug, Default)]
pub struct RawGraph {
    nodes: Vec<GraphNode>,
    node_index: HashMap<(Coordinate, Version), NodeId>,
    edges: Vec<GraphEdge>,
    contexts: Vec<ExclusionSet>,
    context_index: HashMap<ExclusionSet, ContextId>,
    roots: Vec<EdgeId>,
    outgoing: HashMap<(NodeId, ContextId), Vec<EdgeId>>,
    forces: BTreeMap<Coordinate, Version>,
    pins: BTreeMap<Coordinate, Version>,
    missing: BTreeSet<(Coordinate, Version)>,
    first_edge_into: HashMap<Coordinate, EdgeId>,
}

impl RawGraph {
    /// All nodes.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// A node by id.
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    /// The node for `coordinate` at `version`, if it was built.
    pub fn find(&self, coordinate: &Coordinate, version: &Version) -> Option<NodeId> {
        self.node_index
            .get(&(coordinate.clone(), version.clone()))
            .copied()
    }

    /// All edges.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &GraphEdge)> {
        self.edges.iter().enumerate().map(|(i, e)| (EdgeId(i), e))
    }

    /// An edge by id.
    pub fn edge(&self, id: EdgeId) -> &GraphEdge {
        &self.edges[id.0]
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// An exclusion context by id.
    pub fn context(&self, id: ContextId) -> &ExclusionSet {
        &self.contexts[id.0]
    }

    /// Root edges, in declaration order.
    pub fn roots(&self) -> &[EdgeId] {
        &self.roots
    }

    /// Edges declared by `node` when expanded under `context`.
    pub fn outgoing(&self, node: NodeId, context: ContextId) -> &[EdgeId] {
        self.outgoing
            .get(&(node, context))
            .map_or(&[], Vec::as_slice)
    }

    /// Forced versions (policy and root `force` flags).
    pub fn forces(&self) -> &BTreeMap<Coordinate, Version> {
        &self.forces
    }

    /// Strict pins.
    pub fn pins(&self) -> &BTreeMap<Coordinate, Version> {
        &self.pins
    }

    /// Whether the descriptor of `coordinate:version` does not exist.
    pub fn is_missing(&self, coordinate: &Coordinate, version: &Version) -> bool {
        self.missing
            .contains(&(coordinate.clone(), version.clone()))
    }

    /// The requirement chain that first reached `coordinate` during
    /// expansion. Discovery order, so only for diagnostics.
    pub fn discovery_chain(&self, coordinate: &Coordinate) -> RequirementChain {
        let mut steps = Vec::new();
        let mut next = self.first_edge_into.get(coordinate).copied();
        while let Some(id) = next {
            let edge = self.edge(id);
            steps.push(edge.requirement.clone());
            next = match edge.source {
                EdgeSource::Root => None,
                EdgeSource::Node { node, .. } => {
                    self.first_edge_into.get(&self.node(node).coordinate).copied()
                }
            };
        }
        steps.reverse();
        RequirementChain(steps)
    }

    fn intern(&mut self, context: ExclusionSet) -> ContextId {
        if let Some(id) = self.context_index.get(&context) {
            return *id;
        }
        let id = ContextId(self.contexts.len());
        self.contexts.push(context.clone());
        self.context_index.insert(context, id);
        id
    }

    fn push_edge(&mut self, edge: GraphEdge) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.first_edge_into
            .entry(edge.coordinate().clone())
            .or_insert(id);
        if let EdgeSource::Node { node, context } = edge.source {
            self.outgoing.entry((node, context)).or_default().push(id);
        } else {
            self.roots.push(id);
        }
        self.edges.push(edge);
        id
    }

    fn push_node(
        &mut self,
        descriptor: Arc<ModuleDescriptor>,
        repository: Option<String>,
    ) -> NodeId {
        let coordinate = descriptor.coordinate.clone();
        let version = descriptor.version.clone();
        let id = NodeId(self.nodes.len());
        self.nodes.push(GraphNode {
            coordinate: coordinate.clone(),
            version: version.clone(),
            descriptor,
            repository,
        });
        self.node_index.insert((coordinate, version), id);
        id
    }

    fn mark_expanded(&mut self, node: NodeId, context: ContextId) -> bool {
        if self.outgoing.contains_key(&(node, context)) {
            return false;
        }
        self.outgoing.insert((node, context), Vec::new());
        true
    }
}
