//! Breadth-first expansion of root requirements into a [`RawGraph`].

use keel_schema::{Coordinate, DependencyRequirement, Version};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ContextId, EdgeSource, EdgeTarget, GraphEdge, NodeId, RawGraph, Unresolved};
use crate::error::{RequirementChain, ResolveError};
use crate::metadata::{MetadataError, MetadataResolver};
use crate::policy::{PolicyConfig, TransitiveForce};
use crate::reporter::Reporter;

/// Expand `roots` into the full candidate graph.
///
/// Every version that could be selected for a coordinate (each edge's
/// preferred candidate, a forced version, a strict pin) is expanded under
/// every exclusion context that coordinate was reached with.
///
/// # Errors
///
/// Fails fast on transport, integrity and store errors, on two different
/// forces for one coordinate, on a forced dynamic constraint nothing
/// satisfies, and on cancellation. Missing modules and unsatisfiable
/// constraints are recorded on their edges instead.
pub async fn build_graph(
    roots: &[DependencyRequirement],
    policy: &PolicyConfig,
    metadata: &mut MetadataResolver,
    reporter: &dyn Reporter,
    cancel: &CancellationToken,
) -> Result<RawGraph, ResolveError> {
    let mut builder = Builder {
        metadata,
        policy,
        reporter,
        cancel,
        graph: RawGraph::default(),
        needed: BTreeMap::new(),
        reached: BTreeMap::new(),
        scheduled: HashSet::new(),
        queue: VecDeque::new(),
    };

    builder.collect_forces(roots).await?;
    builder.graph.pins = policy.strict_pins.clone();

    for requirement in roots {
        let context = policy.exclusions.union(&requirement.exclusions);
        let context = builder.graph.intern(context);
        builder
            .add_edge(EdgeSource::Root, requirement.clone(), context)
            .await?;
    }

    while let Some((coordinate, version, context)) = builder.queue.pop_front() {
        builder.expand(coordinate, version, context).await?;
    }

    let graph = builder.graph;
    debug!(
        "Graph built: {} node(s), {} edge(s), {} context(s)",
        graph.nodes.len(),
        graph.edges.len(),
        graph.contexts.len()
    );
    Ok(graph)
}

struct Builder<'a> {
    metadata: &'a mut MetadataResolver,
    policy: &'a PolicyConfig,
    reporter: &'a dyn Reporter,
    cancel: &'a CancellationToken,
    graph: RawGraph,
    needed: BTreeMap<Coordinate, BTreeSet<Version>>,
    reached: BTreeMap<Coordinate, BTreeSet<ContextId>>,
    scheduled: HashSet<(Coordinate, Version, ContextId)>,
    queue: VecDeque<(Coordinate, Version, ContextId)>,
}

impl Builder<'_> {
    fn check_cancelled(&self) -> Result<(), ResolveError> {
        if self.cancel.is_cancelled() {
            Err(ResolveError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn collect_forces(&mut self, roots: &[DependencyRequirement]) -> Result<(), ResolveError> {
        let mut forces = self.policy.forced.clone();
        for requirement in roots.iter().filter(|r| r.force) {
            let chain = RequirementChain::default().with(requirement.clone());
            let version = if let Some(exact) = requirement.constraint.exact() {
                exact.clone()
            } else {
                let available = self
                    .metadata
                    .resolve_versions(&requirement.coordinate)
                    .await
                    .map_err(|e| ResolveError::from_metadata(e, &chain))?;
                let matching = requirement.constraint.filter(&available);
                match matching.last() {
                    Some(v) => v.clone(),
                    None => {
                        return Err(ResolveError::Unresolvable {
                            coordinate: requirement.coordinate.clone(),
                            constraint: requirement.constraint.clone(),
                            available: available.to_vec(),
                            chain,
                        });
                    }
                }
            };

            match forces.get(&requirement.coordinate) {
                Some(existing) if *existing != version => {
                    return Err(ResolveError::ForceConflict {
                        coordinate: requirement.coordinate.clone(),
                        first: existing.clone(),
                        second: version,
                    });
                }
                _ => {
                    debug!("Forcing {} to {version}", requirement.coordinate);
                    forces.insert(requirement.coordinate.clone(), version);
                }
            }
        }
        self.graph.forces = forces;
        Ok(())
    }

    fn chain_to(&self, source: EdgeSource) -> RequirementChain {
        match source {
            EdgeSource::Root => RequirementChain::default(),
            EdgeSource::Node { node, .. } => self
                .graph
                .discovery_chain(&self.graph.node(node).coordinate),
        }
    }

    async fn add_edge(
        &mut self,
        source: EdgeSource,
        requirement: DependencyRequirement,
        child_context: ContextId,
    ) -> Result<(), ResolveError> {
        self.check_cancelled()?;
        let chain = self.chain_to(source).with(requirement.clone());
        let target = self.resolve_target(&requirement, &chain).await?;
        trace!("Edge {chain} -> {target:?}");

        let coordinate = requirement.coordinate.clone();
        let edge = GraphEdge {
            source,
            requirement,
            child_context,
            target,
        };
        let preferred = edge.preferred().cloned();
        self.graph.push_edge(edge);

        if let Some(version) = preferred {
            self.need(&coordinate, version);
        }
        self.reach(&coordinate, child_context);
        Ok(())
    }

    async fn resolve_target(
        &mut self,
        requirement: &DependencyRequirement,
        chain: &RequirementChain,
    ) -> Result<EdgeTarget, ResolveError> {
        let coordinate = &requirement.coordinate;
        self.reporter.resolving(coordinate);

        if let Some(version) = requirement.constraint.exact() {
            if !self.graph.is_missing(coordinate, version) {
                match self.metadata.resolve_descriptor(coordinate, version).await {
                    Ok(_) => {
                        return Ok(EdgeTarget::Resolved {
                            candidates: vec![version.clone()],
                        });
                    }
                    Err(MetadataError::NotFound { .. }) => {}
                    Err(e) => return Err(ResolveError::from_metadata(e, chain)),
                }
            }

            // Tell a missing module from a missing version.
            return match self.metadata.resolve_versions(coordinate).await {
                Ok(available) if available.contains(version) => {
                    self.graph
                        .missing
                        .insert((coordinate.clone(), version.clone()));
                    Ok(EdgeTarget::Resolved {
                        candidates: vec![version.clone()],
                    })
                }
                Ok(available) => Ok(EdgeTarget::Unresolved(Unresolved::NoMatchingVersion {
                    available: available.to_vec(),
                })),
                Err(MetadataError::NotFound { .. }) => {
                    Ok(EdgeTarget::Unresolved(Unresolved::ModuleNotFound))
                }
                Err(e) => Err(ResolveError::from_metadata(e, chain)),
            };
        }

        match self.metadata.resolve_versions(coordinate).await {
            Ok(available) => {
                let candidates = requirement.constraint.filter(&available);
                if candidates.is_empty() {
                    Ok(EdgeTarget::Unresolved(Unresolved::NoMatchingVersion {
                        available: available.to_vec(),
                    }))
                } else {
                    Ok(EdgeTarget::Resolved { candidates })
                }
            }
            Err(MetadataError::NotFound { .. }) => {
                Ok(EdgeTarget::Unresolved(Unresolved::ModuleNotFound))
            }
            Err(e) => Err(ResolveError::from_metadata(e, chain)),
        }
    }

    fn schedule(&mut self, coordinate: &Coordinate, version: &Version, context: ContextId) {
        let key = (coordinate.clone(), version.clone(), context);
        if self.scheduled.insert(key.clone()) {
            self.queue.push_back(key);
        }
    }

    /// `version` of `coordinate` may be selected.
    fn need(&mut self, coordinate: &Coordinate, version: Version) {
        let versions = self.needed.entry(coordinate.clone()).or_default();
        if !versions.insert(version.clone()) {
            return;
        }
        let contexts: Vec<ContextId> = self
            .reached
            .get(coordinate)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        for context in contexts {
            self.schedule(coordinate, &version, context);
        }
    }

    /// `coordinate` is required under `context`.
    fn reach(&mut self, coordinate: &Coordinate, context: ContextId) {
        if !self.reached.contains_key(coordinate) {
            let overrides: Vec<Version> = [
                self.graph.forces.get(coordinate),
                self.graph.pins.get(coordinate),
            ]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
            let versions = self.needed.entry(coordinate.clone()).or_default();
            versions.extend(overrides);
        }

        if !self
            .reached
            .entry(coordinate.clone())
            .or_default()
            .insert(context)
        {
            return;
        }
        let versions: Vec<Version> = self
            .needed
            .get(coordinate)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();
        for version in versions {
            self.schedule(coordinate, &version, context);
        }
    }

    async fn node_for(
        &mut self,
        coordinate: &Coordinate,
        version: &Version,
    ) -> Result<Option<NodeId>, ResolveError> {
        if let Some(node) = self.graph.find(coordinate, version) {
            return Ok(Some(node));
        }
        if self.graph.is_missing(coordinate, version) {
            return Ok(None);
        }

        match self.metadata.resolve_descriptor(coordinate, version).await {
            Ok(descriptor) => {
                let repository = self
                    .metadata
                    .owner(coordinate)
                    .map(|r| r.name().to_string());
                Ok(Some(self.graph.push_node(descriptor, repository)))
            }
            Err(MetadataError::NotFound { .. }) => {
                debug!("No descriptor for {coordinate}:{version}");
                self.graph
                    .missing
                    .insert((coordinate.clone(), version.clone()));
                Ok(None)
            }
            Err(e) => Err(ResolveError::from_metadata(
                e,
                &self.graph.discovery_chain(coordinate),
            )),
        }
    }

    async fn expand(
        &mut self,
        coordinate: Coordinate,
        version: Version,
        context: ContextId,
    ) -> Result<(), ResolveError> {
        self.check_cancelled()?;
        let Some(node) = self.node_for(&coordinate, &version).await? else {
            return Ok(());
        };
        if !self.graph.mark_expanded(node, context) {
            return Ok(());
        }

        let descriptor = self.graph.node(node).descriptor.clone();
        let exclusions = self.graph.context(context).clone();
        trace!(
            "Expanding {coordinate}:{version} under {exclusions} ({} requirement(s))",
            descriptor.dependencies.len()
        );

        for dependency in &descriptor.dependencies {
            if exclusions.excludes(&dependency.coordinate) {
                trace!(
                    "{} excluded below {coordinate}:{version}",
                    dependency.coordinate
                );
                continue;
            }

            let mut requirement = dependency.clone();
            if requirement.force {
                requirement.force = false;
                match self.policy.transitive_force {
                    TransitiveForce::Ignore => {
                        let msg = format!(
                            "Ignoring force on {} declared by {coordinate}:{version}",
                            requirement.coordinate
                        );
                        warn!("{msg}");
                        self.reporter.warning(&msg);
                    }
                    TransitiveForce::AsStrict => requirement.strict = true,
                }
            }

            let child_context = if requirement.exclusions.is_empty() {
                context
            } else {
                let merged = exclusions.union(&requirement.exclusions);
                self.graph.intern(merged)
            };
            self.add_edge(EdgeSource::Node { node, context }, requirement, child_context)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;
    use crate::testing::{Fixture, req};
    use keel_schema::Exclusion;

    async fn build(fx: &Fixture, roots: &[DependencyRequirement], policy: &PolicyConfig) -> Result<RawGraph, ResolveError> {
        let mut metadata = fx.metadata(policy);
        build_graph(roots, policy, &mut metadata, &NullReporter, &CancellationToken::new()).await
    }

    fn candidates(graph: &RawGraph, coordinate: &str) -> Vec<Vec<String>> {
        let coordinate: Coordinate = coordinate.parse().unwrap();
        graph
            .edges()
            .filter(|(_, e)| *e.coordinate() == coordinate)
            .map(|(_, e)| match &e.target {
                EdgeTarget::Resolved { candidates } => {
                    candidates.iter().map(ToString::to_string).collect()
                }
                EdgeTarget::Unresolved(_) => Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn edges_record_every_candidate() {
        let fx = Fixture::new();
        for v in ["1.0", "1.5", "2.0"] {
            fx.publish("g:a", v, &[]);
        }
        let policy = fx.policy();
        let graph = build(&fx, &[req("g:a:>=1.5")], &policy).await.unwrap();

        assert_eq!(candidates(&graph, "g:a"), vec![vec!["1.5", "2.0"]]);
        // Only the preferred candidate is expanded.
        assert_eq!(graph.nodes().len(), 1);
        assert_eq!(graph.nodes()[0].version.as_str(), "2.0");
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &["g:b:1.0"]);
        fx.publish("g:b", "1.0", &["g:a:1.0"]);
        let policy = fx.policy();

        let graph = build(&fx, &[req("g:a:1.0")], &policy).await.unwrap();
        assert_eq!(graph.nodes().len(), 2);
        assert_eq!(graph.edge_count(), 3);
    }

    #[tokio::test]
    async fn exclusions_prune_only_their_subtree() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &["g:x:1.0"]);
        fx.publish("g:b", "1.0", &["g:x:1.0"]);
        fx.publish("g:x", "1.0", &[]);
        let policy = fx.policy();

        let excluded = req("g:a:1.0").excluding(Exclusion::parse("g:x").unwrap());
        let graph = build(&fx, &[excluded, req("g:b:1.0")], &policy)
            .await
            .unwrap();

        let a = graph.find(&"g:a".parse().unwrap(), &"1.0".parse().unwrap()).unwrap();
        let b = graph.find(&"g:b".parse().unwrap(), &"1.0".parse().unwrap()).unwrap();
        let a_edges: usize = graph
            .edges()
            .filter(|(_, e)| matches!(e.source, EdgeSource::Node { node, .. } if node == a))
            .count();
        let b_edges: usize = graph
            .edges()
            .filter(|(_, e)| matches!(e.source, EdgeSource::Node { node, .. } if node == b))
            .count();
        assert_eq!(a_edges, 0);
        assert_eq!(b_edges, 1);
    }

    #[tokio::test]
    async fn global_exclusions_do_not_filter_roots() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &["g:x:1.0"]);
        fx.publish("g:x", "1.0", &[]);
        let policy = fx.policy().exclude(Exclusion::parse("g:x").unwrap());

        let graph = build(&fx, &[req("g:a:1.0"), req("g:x:1.0")], &policy)
            .await
            .unwrap();
        // The root edge to x survives, a's edge to x does not.
        assert_eq!(candidates(&graph, "g:x").len(), 1);
        assert_eq!(graph.nodes().len(), 2);
    }

    #[tokio::test]
    async fn unsatisfiable_requirements_are_recorded_not_fatal() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &["g:b:[5.0,)", "g:missing:1.0"]);
        fx.publish("g:b", "1.0", &[]);
        let policy = fx.policy();

        let graph = build(&fx, &[req("g:a:1.0")], &policy).await.unwrap();
        let targets: Vec<&EdgeTarget> = graph.edges().map(|(_, e)| &e.target).collect();
        assert!(targets.contains(&&EdgeTarget::Unresolved(Unresolved::NoMatchingVersion {
            available: vec!["1.0".parse().unwrap()],
        })));
        assert!(targets.contains(&&EdgeTarget::Unresolved(Unresolved::ModuleNotFound)));
    }

    #[tokio::test]
    async fn forced_and_pinned_versions_are_expanded() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &[]);
        fx.publish("g:a", "2.0", &[]);
        fx.publish("g:b", "1.0", &[]);
        fx.publish("g:b", "3.0", &[]);
        let policy = fx
            .policy()
            .force("g:a".parse().unwrap(), "1.0".parse().unwrap())
            .pin("g:b".parse().unwrap(), "1.0".parse().unwrap());

        let graph = build(&fx, &[req("g:a:+"), req("g:b:+")], &policy)
            .await
            .unwrap();
        let mut built: Vec<String> = graph
            .nodes()
            .iter()
            .map(|n| format!("{}:{}", n.coordinate, n.version))
            .collect();
        built.sort();
        assert_eq!(built, vec!["g:a:1.0", "g:a:2.0", "g:b:1.0", "g:b:3.0"]);
    }

    #[tokio::test]
    async fn conflicting_forces_fail() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &[]);
        fx.publish("g:a", "2.0", &[]);
        let policy = fx
            .policy()
            .force("g:a".parse().unwrap(), "1.0".parse().unwrap());

        let err = build(&fx, &[req("g:a:2.0").forced()], &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ForceConflict { .. }), "{err}");
    }

    #[tokio::test]
    async fn transitive_force_policy() {
        let fx = Fixture::new();
        fx.publish_with("g:a", "1.0", vec![req("g:b:1.0").forced()]);
        fx.publish("g:b", "1.0", &[]);

        let policy = fx.policy();
        let graph = build(&fx, &[req("g:a:1.0")], &policy).await.unwrap();
        assert!(graph.forces().is_empty());
        let edge = graph.edges().find(|(_, e)| e.coordinate().name() == "b").unwrap().1;
        assert!(!edge.requirement.strict && !edge.requirement.force);

        let mut policy = fx.policy();
        policy.transitive_force = TransitiveForce::AsStrict;
        let graph = build(&fx, &[req("g:a:1.0")], &policy).await.unwrap();
        let edge = graph.edges().find(|(_, e)| e.coordinate().name() == "b").unwrap().1;
        assert!(edge.requirement.strict);
    }

    #[tokio::test]
    async fn cancelled_build_stops() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &[]);
        let policy = fx.policy();
        let mut metadata = fx.metadata(&policy);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = build_graph(&[req("g:a:1.0")], &policy, &mut metadata, &NullReporter, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
    }
}
