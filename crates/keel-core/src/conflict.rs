//! Conflict resolution: exactly one version per coordinate.
//!
//! Selection is a bounded fixed point. Starting from a pick over every edge in
//! the graph, the resolver walks the graph from the roots using the current
//! selection, keeps only the edges it can reach (the *live* edges), and picks
//! again. Requirements declared by evicted versions or pruned by exclusions
//! drop out, which can lower other selections. Policy checks run once, against
//! the converged live set.

use keel_schema::{Coordinate, Version, VersionConstraint};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, trace};

use crate::error::{Origin, RequirementChain, ResolveError};
use crate::graph::{ContextId, EdgeId, EdgeSource, EdgeTarget, NodeId, RawGraph, Unresolved};
use crate::policy::{ConflictStrategy, PolicyConfig};

type Selection = BTreeMap<Coordinate, Version>;

/// Why a version was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionReason {
    /// A root-level force.
    Forced,
    /// A strict pin in the policy.
    Pinned,
    /// The highest version any live requirement asked for.
    Highest,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Forced => "forced",
            Self::Pinned => "pinned",
            Self::Highest => "highest",
        })
    }
}

/// The winner for one coordinate.
#[derive(Debug, Clone)]
pub struct SelectedVersion {
    /// Selected version.
    pub version: Version,
    /// Its graph node.
    pub node: NodeId,
    /// Why it won.
    pub reason: SelectionReason,
    /// Live edges requiring the coordinate.
    pub requested_by: Vec<EdgeId>,
    /// Artifact classifiers asked for by live edges (`None` is the default
    /// artifact).
    pub classifiers: BTreeSet<Option<String>>,
}

/// Converged output of [`select_versions`].
#[derive(Debug, Clone)]
pub struct ResolvedSelection {
    selected: BTreeMap<Coordinate, SelectedVersion>,
    live: Vec<EdgeId>,
    parent: HashMap<(NodeId, ContextId), EdgeId>,
    iterations: usize,
}

impl ResolvedSelection {
    /// Selections by coordinate.
    pub fn selected(&self) -> &BTreeMap<Coordinate, SelectedVersion> {
        &self.selected
    }

    /// The selection for `coordinate`.
    pub fn get(&self, coordinate: &Coordinate) -> Option<&SelectedVersion> {
        self.selected.get(coordinate)
    }

    /// Live edges in traversal order.
    pub fn live_edges(&self) -> &[EdgeId] {
        &self.live
    }

    /// Passes needed to converge.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Requirement chain from a root through `edge`.
    pub fn chain(&self, graph: &RawGraph, edge: EdgeId) -> RequirementChain {
        chain_of(graph, &self.parent, edge)
    }
}

/// Select one version per live coordinate.
///
/// # Errors
///
/// [`ResolveError::DidNotConverge`] if selection keeps changing, otherwise
/// the first policy violation found in the converged live set: unsatisfiable
/// or missing requirements, strict conflicts, and version conflicts under
/// [`ConflictStrategy::Fail`].
pub fn select_versions(
    graph: &RawGraph,
    policy: &PolicyConfig,
) -> Result<ResolvedSelection, ResolveError> {
    let initial = pick(graph, graph.edges().map(|(id, _)| id));
    let mut current = initial.clone();
    let cap = graph.nodes().len() + 2;

    for iteration in 1..=cap {
        let traversal = traverse(graph, &current, &initial);
        let next = pick(graph, traversal.live.iter().copied());
        if next == current {
            debug!(
                "Selection converged after {iteration} pass(es): {} module(s)",
                next.len()
            );
            return finish(graph, policy, &next, traversal, iteration);
        }
        trace!("Pass {iteration}: selection changed");
        current = next;
    }
    Err(ResolveError::DidNotConverge { iterations: cap })
}

/// Force, else the highest of each edge's preferred candidate and the pin.
fn pick(graph: &RawGraph, edges: impl Iterator<Item = EdgeId>) -> Selection {
    let mut contributions: BTreeMap<Coordinate, Option<Version>> = BTreeMap::new();
    for id in edges {
        let edge = graph.edge(id);
        let best = contributions.entry(edge.coordinate().clone()).or_default();
        if let Some(preferred) = edge.preferred() {
            if best.as_ref().is_none_or(|b| preferred > b) {
                *best = Some(preferred.clone());
            }
        }
    }

    contributions
        .into_iter()
        .filter_map(|(coordinate, best)| {
            if let Some(forced) = graph.forces().get(&coordinate) {
                return Some((coordinate, forced.clone()));
            }
            let winner = match (best, graph.pins().get(&coordinate)) {
                (Some(b), Some(pin)) => Some(b.max(pin.clone())),
                (Some(b), None) => Some(b),
                (None, pin) => pin.cloned(),
            };
            winner.map(|v| (coordinate, v))
        })
        .collect()
}

struct Traversal {
    live: Vec<EdgeId>,
    parent: HashMap<(NodeId, ContextId), EdgeId>,
}

/// Breadth-first walk from the roots over `selection`, falling back to
/// `initial` for coordinates that just became reachable.
fn traverse(graph: &RawGraph, selection: &Selection, initial: &Selection) -> Traversal {
    let mut live = Vec::new();
    let mut parent = HashMap::new();
    let mut visited: HashSet<(NodeId, ContextId)> = HashSet::new();
    let mut queue: VecDeque<EdgeId> = graph.roots().iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        live.push(id);
        let edge = graph.edge(id);
        let coordinate = edge.coordinate();
        let Some(version) = selection.get(coordinate).or_else(|| initial.get(coordinate)) else {
            continue;
        };
        let Some(node) = graph.find(coordinate, version) else {
            continue;
        };
        let state = (node, edge.child_context);
        if visited.insert(state) {
            parent.insert(state, id);
            queue.extend(graph.outgoing(node, edge.child_context));
        }
    }
    Traversal { live, parent }
}

fn chain_of(
    graph: &RawGraph,
    parent: &HashMap<(NodeId, ContextId), EdgeId>,
    edge: EdgeId,
) -> RequirementChain {
    let mut steps = Vec::new();
    let mut next = Some(edge);
    while let Some(id) = next {
        let edge = graph.edge(id);
        steps.push(edge.requirement.clone());
        next = match edge.source {
            EdgeSource::Root => None,
            EdgeSource::Node { node, context } => parent.get(&(node, context)).copied(),
        };
    }
    steps.reverse();
    RequirementChain(steps)
}

fn finish(
    graph: &RawGraph,
    policy: &PolicyConfig,
    selection: &Selection,
    traversal: Traversal,
    iterations: usize,
) -> Result<ResolvedSelection, ResolveError> {
    let chain = |edge: EdgeId| chain_of(graph, &traversal.parent, edge);
    let origin = |edge: EdgeId| Origin::Requirement(chain(edge));

    let mut by_coordinate: BTreeMap<&Coordinate, Vec<EdgeId>> = BTreeMap::new();
    for &id in &traversal.live {
        by_coordinate
            .entry(graph.edge(id).coordinate())
            .or_default()
            .push(id);
    }

    // Live requirements nothing satisfies. A force overrides the edge's own
    // candidates.
    for (coordinate, edges) in &by_coordinate {
        if graph.forces().contains_key(*coordinate) {
            continue;
        }
        for &id in edges {
            let edge = graph.edge(id);
            match &edge.target {
                EdgeTarget::Resolved { .. } => {}
                EdgeTarget::Unresolved(Unresolved::ModuleNotFound) => {
                    return Err(ResolveError::NotFound {
                        coordinate: (*coordinate).clone(),
                        version: edge.requirement.constraint.exact().cloned(),
                        chain: chain(id),
                    });
                }
                EdgeTarget::Unresolved(Unresolved::NoMatchingVersion { available }) => {
                    return Err(ResolveError::Unresolvable {
                        coordinate: (*coordinate).clone(),
                        constraint: edge.requirement.constraint.clone(),
                        available: available.clone(),
                        chain: chain(id),
                    });
                }
            }
        }
    }

    // Selected versions without a descriptor.
    for (coordinate, edges) in &by_coordinate {
        let Some(version) = selection.get(*coordinate) else {
            continue;
        };
        if graph.is_missing(coordinate, version) || graph.find(coordinate, version).is_none() {
            return Err(ResolveError::NotFound {
                coordinate: (*coordinate).clone(),
                version: Some(version.clone()),
                chain: edges.first().map(|&id| chain(id)).unwrap_or_default(),
            });
        }
    }

    // Forces against strict requirements and pins.
    if !policy.force_overrides_strict {
        for (coordinate, edges) in &by_coordinate {
            let Some(forced) = graph.forces().get(*coordinate) else {
                continue;
            };
            check_strict(graph, coordinate, forced, &Origin::PolicyForce, edges, &origin)?;
        }
    }

    if policy.strategy == ConflictStrategy::Fail {
        for (coordinate, edges) in &by_coordinate {
            if graph.forces().contains_key(*coordinate) {
                continue;
            }
            let mut ordinary = edges.iter().filter_map(|&id| {
                let edge = graph.edge(id);
                if edge.requirement.strict {
                    None
                } else {
                    edge.preferred().map(|v| (id, v))
                }
            });
            let Some((first_id, first)) = ordinary.next() else {
                continue;
            };
            if let Some((second_id, second)) = ordinary.find(|(_, v)| *v != first) {
                return Err(ResolveError::VersionConflict {
                    coordinate: (*coordinate).clone(),
                    first: first.clone(),
                    first_origin: origin(first_id),
                    second: second.clone(),
                    second_origin: origin(second_id),
                });
            }
        }
    }

    // Strict requirements and pins must accept the winner.
    for (coordinate, edges) in &by_coordinate {
        if graph.forces().contains_key(*coordinate) {
            continue;
        }
        let Some(winner) = selection.get(*coordinate) else {
            continue;
        };
        let selected_by = edges
            .iter()
            .find(|&&id| graph.edge(id).preferred() == Some(winner))
            .map_or(Origin::PolicyPin, |&id| origin(id));
        check_strict(graph, coordinate, winner, &selected_by, edges, &origin)?;
    }

    let mut selected = BTreeMap::new();
    for (coordinate, edges) in by_coordinate {
        let Some(version) = selection.get(coordinate) else {
            continue;
        };
        let Some(node) = graph.find(coordinate, version) else {
            continue;
        };
        let reason = if graph.forces().contains_key(coordinate) {
            SelectionReason::Forced
        } else if graph.pins().get(coordinate) == Some(version) {
            SelectionReason::Pinned
        } else {
            SelectionReason::Highest
        };
        let classifiers = edges
            .iter()
            .map(|&id| graph.edge(id).requirement.classifier.clone())
            .collect();
        selected.insert(
            coordinate.clone(),
            SelectedVersion {
                version: version.clone(),
                node,
                reason,
                requested_by: edges,
                classifiers,
            },
        );
    }

    Ok(ResolvedSelection {
        selected,
        live: traversal.live,
        parent: traversal.parent,
        iterations,
    })
}

fn check_strict(
    graph: &RawGraph,
    coordinate: &Coordinate,
    selected: &Version,
    selected_by: &Origin,
    edges: &[EdgeId],
    origin: &impl Fn(EdgeId) -> Origin,
) -> Result<(), ResolveError> {
    let conflict = |constraint: VersionConstraint, strict_origin: Origin| {
        ResolveError::StrictConflict {
            coordinate: coordinate.clone(),
            selected: selected.clone(),
            selected_by: selected_by.clone(),
            constraint,
            strict_origin,
        }
    };

    for &id in edges {
        let requirement = &graph.edge(id).requirement;
        if requirement.strict && !requirement.constraint.matches(selected) {
            return Err(conflict(requirement.constraint.clone(), origin(id)));
        }
    }
    match graph.pins().get(coordinate) {
        Some(pin) if pin != selected => Err(conflict(
            VersionConstraint::Exact(pin.clone()),
            Origin::PolicyPin,
        )),
        _ => Ok(()),
    }
}
