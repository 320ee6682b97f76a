//! The finished resolution handed to consumers.
//!
//! A [`ResolutionResult`] maps each coordinate to exactly one version and its
//! verified local artifacts. The dependency relation between components may
//! contain cycles; [`ResolutionResult::build_layers`] is there for consumers
//! that need an order and can handle [`CycleError`].

use keel_schema::{Coordinate, DependencyRequirement, Digest, Version};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use thiserror::Error;

use crate::conflict::{ResolvedSelection, SelectionReason};
use crate::graph::{EdgeSource, RawGraph};

/// A verified file in the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArtifact {
    /// Classifier, `None` for the default artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    /// File extension.
    pub extension: String,
    /// Verified digest.
    pub digest: Digest,
    /// Location in the cache.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// One requirement that pulled a component in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestedBy {
    /// Declaring module, `None` for a root requirement.
    pub from: Option<(Coordinate, Version)>,
    /// The requirement as declared.
    pub requirement: DependencyRequirement,
}

impl RequestedBy {
    /// `root` or `group:name:version`.
    pub fn source_label(&self) -> String {
        match &self.from {
            Some((coordinate, version)) => format!("{coordinate}:{version}"),
            None => "root".to_string(),
        }
    }
}

/// The selected version of one coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedComponent {
    /// Module.
    pub coordinate: Coordinate,
    /// The one selected version.
    pub version: Version,
    /// Repository that served the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Why this version was selected.
    pub reason: SelectionReason,
    /// Verified artifacts.
    pub artifacts: Vec<ResolvedArtifact>,
    /// Components this one depends on in the result.
    pub dependencies: BTreeSet<Coordinate>,
    /// Live requirements on this coordinate.
    pub requested_by: Vec<RequestedBy>,
}

/// Dependency cycle found while ordering a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Dependency cycle among: {}", .members.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
pub struct CycleError {
    /// Components that could not be ordered.
    pub members: Vec<Coordinate>,
}

/// Immutable output of a successful resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionResult {
    #[serde(serialize_with = "components_as_list")]
    components: BTreeMap<Coordinate, ResolvedComponent>,
    roots: Vec<Coordinate>,
}

fn components_as_list<S: Serializer>(
    components: &BTreeMap<Coordinate, ResolvedComponent>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(components.values())
}

impl ResolutionResult {
    /// Assemble the result from a converged selection and the artifacts
    /// fetched for it.
    pub(crate) fn assemble(
        graph: &RawGraph,
        selection: &ResolvedSelection,
        mut artifacts: HashMap<Coordinate, Vec<ResolvedArtifact>>,
    ) -> Self {
        let mut components: BTreeMap<Coordinate, ResolvedComponent> = selection
            .selected()
            .iter()
            .map(|(coordinate, selected)| {
                let node = graph.node(selected.node);
                let mut requested_by: Vec<RequestedBy> = Vec::new();
                for &id in &selected.requested_by {
                    let edge = graph.edge(id);
                    let from = match edge.source {
                        EdgeSource::Root => None,
                        EdgeSource::Node { node, .. } => {
                            let source = graph.node(node);
                            Some((source.coordinate.clone(), source.version.clone()))
                        }
                    };
                    let entry = RequestedBy {
                        from,
                        requirement: edge.requirement.clone(),
                    };
                    // The same declaration is live once per exclusion context.
                    if !requested_by.contains(&entry) {
                        requested_by.push(entry);
                    }
                }
                let component = ResolvedComponent {
                    coordinate: coordinate.clone(),
                    version: selected.version.clone(),
                    repository: node.repository.clone(),
                    reason: selected.reason,
                    artifacts: artifacts.remove(coordinate).unwrap_or_default(),
                    dependencies: BTreeSet::new(),
                    requested_by,
                };
                (coordinate.clone(), component)
            })
            .collect();

        for &id in selection.live_edges() {
            let edge = graph.edge(id);
            let EdgeSource::Node { node, .. } = edge.source else {
                continue;
            };
            let child = edge.coordinate();
            if !components.contains_key(child) {
                continue;
            }
            let parent = &graph.node(node).coordinate;
            if let Some(component) = components.get_mut(parent) {
                component.dependencies.insert(child.clone());
            }
        }

        let mut roots: Vec<Coordinate> = Vec::new();
        for &id in graph.roots() {
            let coordinate = graph.edge(id).coordinate();
            if components.contains_key(coordinate) && !roots.contains(coordinate) {
                roots.push(coordinate.clone());
            }
        }

        Self { components, roots }
    }

    /// The component for `coordinate`.
    pub fn get(&self, coordinate: &Coordinate) -> Option<&ResolvedComponent> {
        self.components.get(coordinate)
    }

    /// Selected version of `coordinate`.
    pub fn version(&self, coordinate: &Coordinate) -> Option<&Version> {
        self.get(coordinate).map(|c| &c.version)
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Components in coordinate order.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedComponent> {
        self.components.values()
    }

    /// Coordinates requested directly by the roots, in declaration order.
    pub fn roots(&self) -> &[Coordinate] {
        &self.roots
    }

    /// Every artifact path in the result.
    pub fn artifact_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.iter()
            .flat_map(|c| c.artifacts.iter().map(|a| &a.path))
    }

    /// `coordinate` and everything it transitively depends on.
    pub fn reachable_from(&self, coordinate: &Coordinate) -> BTreeSet<Coordinate> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        if self.components.contains_key(coordinate) {
            queue.push_back(coordinate.clone());
        }
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(component) = self.components.get(&next) {
                queue.extend(component.dependencies.iter().cloned());
            }
        }
        seen
    }

    /// Components grouped so that each layer depends only on earlier layers.
    ///
    /// Uses Kahn's algorithm. Each layer is sorted for deterministic output.
    ///
    /// # Errors
    ///
    /// [`CycleError`] naming the components that sit on or behind a cycle.
    pub fn build_layers(&self) -> Result<Vec<Vec<Coordinate>>, CycleError> {
        let mut dependents: HashMap<&Coordinate, Vec<&Coordinate>> = HashMap::new();
        let mut in_degree: HashMap<&Coordinate, usize> = HashMap::new();

        for (coordinate, component) in &self.components {
            in_degree.entry(coordinate).or_default();
            for dependency in &component.dependencies {
                if dependency == coordinate {
                    continue;
                }
                dependents.entry(dependency).or_default().push(coordinate);
                *in_degree.entry(coordinate).or_default() += 1;
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<&Coordinate> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(c, _)| *c)
            .collect();

        while !current.is_empty() {
            current.sort();
            let mut next = Vec::new();
            for coordinate in &current {
                for dependent in dependents.get(coordinate).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            layers.push(current.into_iter().cloned().collect::<Vec<_>>());
            current = next;
        }

        let sorted: usize = layers.iter().map(Vec::len).sum();
        if sorted < self.components.len() {
            let members = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(c, _)| c.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return Err(CycleError { members });
        }
        Ok(layers)
    }

    /// Dependencies before dependents.
    ///
    /// # Errors
    ///
    /// [`CycleError`] if the result is cyclic.
    pub fn topological_order(&self) -> Result<Vec<Coordinate>, CycleError> {
        Ok(self.build_layers()?.into_iter().flatten().collect())
    }
}

impl<'a> IntoIterator for &'a ResolutionResult {
    type Item = &'a ResolvedComponent;
    type IntoIter = std::collections::btree_map::Values<'a, Coordinate, ResolvedComponent>;

    fn into_iter(self) -> Self::IntoIter {
        self.components.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinate(name: &str) -> Coordinate {
        Coordinate::new("g", name).unwrap()
    }

    fn result(edges: &[(&str, &[&str])]) -> ResolutionResult {
        let components = edges
            .iter()
            .map(|(name, deps)| {
                let c = coordinate(name);
                let component = ResolvedComponent {
                    coordinate: c.clone(),
                    version: "1.0".parse().unwrap(),
                    repository: None,
                    reason: SelectionReason::Highest,
                    artifacts: Vec::new(),
                    dependencies: deps.iter().map(|d| coordinate(d)).collect(),
                    requested_by: Vec::new(),
                };
                (c, component)
            })
            .collect();
        ResolutionResult {
            components,
            roots: vec![coordinate(edges[0].0)],
        }
    }

    #[test]
    fn layers_put_dependencies_first() {
        let r = result(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"]), ("d", &[])]);
        let layers = r.build_layers().unwrap();
        assert_eq!(
            layers,
            vec![
                vec![coordinate("d")],
                vec![coordinate("b"), coordinate("c")],
                vec![coordinate("a")],
            ]
        );
        assert_eq!(r.topological_order().unwrap().last(), Some(&coordinate("a")));
    }

    #[test]
    fn cycles_are_reported_not_ordered() {
        let r = result(&[("a", &["b"]), ("b", &["c"]), ("c", &["b"]), ("d", &[])]);
        let err = r.build_layers().unwrap_err();
        assert_eq!(err.members, vec![coordinate("a"), coordinate("b"), coordinate("c")]);
        assert!(err.to_string().contains("g:b"));
    }

    #[test]
    fn reachability_follows_cycles() {
        let r = result(&[("a", &["b"]), ("b", &["a", "c"]), ("c", &[]), ("d", &[])]);
        let reachable = r.reachable_from(&coordinate("a"));
        assert_eq!(
            reachable.into_iter().collect::<Vec<_>>(),
            vec![coordinate("a"), coordinate("b"), coordinate("c")]
        );
        assert!(r.reachable_from(&coordinate("zz")).is_empty());
    }

    #[test]
    fn serializes_components_as_a_list() {
        let r = result(&[("a", &["b"]), ("b", &[])]);
        let json = serde_json::to_value(&r).unwrap();
        let components = json["components"].as_array().unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0]["version"], "1.0");
        assert_eq!(components[0]["reason"], "highest");
    }
}
