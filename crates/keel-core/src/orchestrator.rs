//! Resolution orchestrator: drives one invocation from root requirements to a
//! [`ResolutionResult`].
//!
//! ```text
//! Collecting -> Resolving -> Fetching -> Complete
//!      \             \            \
//!       `-------------`------------`--> Failed
//! ```
//!
//! An [`Invocation`] is consumed by [`Invocation::run`], so a finished (or
//! failed) invocation cannot be resumed. Observers follow the state through
//! [`Invocation::subscribe`].

use keel_schema::{ArtifactRef, Coordinate, DependencyRequirement, Version};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{ArtifactCache, CacheError, CacheKey, CachedArtifact, FetchRequest};
use crate::conflict::{ResolvedSelection, select_versions};
use crate::error::{RequirementChain, ResolveError};
use crate::graph::{RawGraph, build_graph};
use crate::metadata::{MetadataResolver, MetadataStore};
use crate::policy::PolicyConfig;
use crate::reporter::{NullReporter, Reporter};
use crate::repository::Repository;
use crate::result::{ResolutionResult, ResolvedArtifact};
use crate::transport::TransportError;

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Validating and normalizing root requirements.
    Collecting,
    /// Building the graph and selecting versions.
    Resolving,
    /// Downloading and verifying artifacts.
    Fetching,
    /// Finished with a result.
    Complete,
    /// Finished with an error.
    Failed,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Collecting => "collecting",
            Self::Resolving => "resolving",
            Self::Fetching => "fetching",
            Self::Complete => "complete",
            Self::Failed => "failed",
        })
    }
}

/// Shared collaborators for resolutions: metadata store, artifact cache and
/// progress reporter. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn MetadataStore>,
    cache: Arc<ArtifactCache>,
    reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("cache", &self.cache.root())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// An engine over `store` and `cache` that reports nothing.
    pub fn new(store: Arc<dyn MetadataStore>, cache: ArtifactCache) -> Self {
        Self {
            store,
            cache: Arc::new(cache),
            reporter: Arc::new(NullReporter),
        }
    }

    /// Report progress to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The artifact cache.
    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Prepare an invocation without running it.
    pub fn invocation(&self, roots: &[DependencyRequirement], policy: &PolicyConfig) -> Invocation {
        let (state, _) = watch::channel(InvocationState::Collecting);
        Invocation {
            engine: self.clone(),
            roots: roots.to_vec(),
            policy: policy.clone(),
            state,
        }
    }

    /// Resolve `roots` under `policy` into verified local artifacts.
    ///
    /// # Errors
    ///
    /// Any [`ResolveError`]. No partial result is returned.
    pub async fn resolve(
        &self,
        roots: &[DependencyRequirement],
        policy: &PolicyConfig,
        cancel: &CancellationToken,
    ) -> Result<ResolutionResult, ResolveError> {
        self.invocation(roots, policy).run(cancel).await
    }
}

/// One resolution run.
#[derive(Debug)]
pub struct Invocation {
    engine: Engine,
    roots: Vec<DependencyRequirement>,
    policy: PolicyConfig,
    state: watch::Sender<InvocationState>,
}

/// An artifact selected for download, with everything needed to report a
/// failure against it.
struct FetchJob {
    coordinate: Coordinate,
    version: Version,
    artifact: ArtifactRef,
    repository: Arc<Repository>,
    chain: RequirementChain,
}

impl Invocation {
    /// Current state.
    pub fn state(&self) -> InvocationState {
        *self.state.borrow()
    }

    /// Follow state transitions, including the final one.
    pub fn subscribe(&self) -> watch::Receiver<InvocationState> {
        self.state.subscribe()
    }

    fn enter(&self, state: InvocationState) {
        debug!("Invocation {} -> {state}", self.state());
        self.state.send_replace(state);
    }

    /// Run to completion.
    ///
    /// # Errors
    ///
    /// The first failure of any phase. Cancellation yields
    /// [`ResolveError::Cancelled`].
    pub async fn run(self, cancel: &CancellationToken) -> Result<ResolutionResult, ResolveError> {
        let started = Instant::now();
        match self.execute(cancel).await {
            Ok(result) => {
                self.enter(InvocationState::Complete);
                self.engine
                    .reporter
                    .summary(result.len(), "resolved", started.elapsed().as_secs_f64());
                Ok(result)
            }
            Err(e) => {
                self.enter(InvocationState::Failed);
                Err(e)
            }
        }
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<ResolutionResult, ResolveError> {
        let reporter = &*self.engine.reporter;

        let roots = self.collect();
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }

        self.enter(InvocationState::Resolving);
        reporter.phase("Resolving");
        let mut metadata =
            MetadataResolver::new(self.engine.store.clone(), &self.policy, cancel.clone());
        let graph = build_graph(&roots, &self.policy, &mut metadata, reporter, cancel).await?;
        let selection = select_versions(&graph, &self.policy)?;
        info!(
            "Selected {} module(s) from {} node(s) in {} pass(es)",
            selection.selected().len(),
            graph.nodes().len(),
            selection.iterations()
        );

        self.enter(InvocationState::Fetching);
        reporter.phase("Fetching");
        let jobs = self.plan(&graph, &selection)?;
        let artifacts = self.fetch_all(jobs, cancel).await?;

        Ok(ResolutionResult::assemble(&graph, &selection, artifacts))
    }

    /// Drop exact duplicate root requirements, keeping declaration order.
    fn collect(&self) -> Vec<DependencyRequirement> {
        let mut roots: Vec<DependencyRequirement> = Vec::with_capacity(self.roots.len());
        for requirement in &self.roots {
            if !roots.contains(requirement) {
                roots.push(requirement.clone());
            }
        }
        debug!("Collected {} root requirement(s)", roots.len());
        roots
    }

    /// The artifacts live edges ask for. A module without a default artifact
    /// contributes only its dependencies; a missing classifier is an error.
    fn plan(&self, graph: &RawGraph, selection: &ResolvedSelection) -> Result<Vec<FetchJob>, ResolveError> {
        let mut jobs = Vec::new();
        for (coordinate, selected) in selection.selected() {
            let node = graph.node(selected.node);
            let chain = selected
                .requested_by
                .first()
                .map(|&id| selection.chain(graph, id))
                .unwrap_or_default();

            for classifier in &selected.classifiers {
                let Some(artifact) = node.descriptor.artifact(classifier.as_deref()) else {
                    if classifier.is_some() {
                        return Err(ResolveError::NotFound {
                            coordinate: coordinate.clone(),
                            version: Some(selected.version.clone()),
                            chain,
                        });
                    }
                    continue;
                };
                let Some(repository) = self.repository_for(node.repository.as_deref()) else {
                    return Err(ResolveError::NotFound {
                        coordinate: coordinate.clone(),
                        version: Some(selected.version.clone()),
                        chain,
                    });
                };
                jobs.push(FetchJob {
                    coordinate: coordinate.clone(),
                    version: selected.version.clone(),
                    artifact: artifact.clone(),
                    repository,
                    chain: chain.clone(),
                });
            }
        }
        Ok(jobs)
    }

    fn repository_for(&self, name: Option<&str>) -> Option<Arc<Repository>> {
        let repositories = &self.policy.repositories;
        name.and_then(|name| repositories.iter().find(|r| r.name() == name))
            .or_else(|| repositories.first())
            .cloned()
    }

    /// Fetch every job under the parallelism limit. The first failure cancels
    /// the rest; all tasks are drained before returning so no lock or
    /// temporary file outlives the call.
    async fn fetch_all(
        &self,
        jobs: Vec<FetchJob>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Coordinate, Vec<ResolvedArtifact>>, ResolveError> {
        let fetch_cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.policy.max_parallel_downloads.max(1)));
        let mut set: JoinSet<(usize, Result<CachedArtifact, CacheError>)> = JoinSet::new();

        for (index, job) in jobs.iter().enumerate() {
            let cache = self.engine.cache.clone();
            let reporter = self.engine.reporter.clone();
            let semaphore = semaphore.clone();
            let cancel = fetch_cancel.clone();
            let offline = self.policy.offline;
            let key = CacheKey::for_artifact(&job.coordinate, &job.version, &job.artifact);
            let url = job
                .repository
                .artifact_url(&job.coordinate, &job.version, &job.artifact);
            let expected = job.artifact.digest.clone();
            let size = job.artifact.size;
            let repository = job.repository.clone();

            set.spawn(async move {
                let result = async {
                    let _permit = tokio::select! {
                        () = cancel.cancelled() => return Err(CacheError::Cancelled),
                        permit = semaphore.acquire_owned() => permit.map_err(|_| CacheError::Cancelled)?,
                    };
                    if offline {
                        return cache
                            .get(&key, &expected)
                            .await?
                            .ok_or(CacheError::Transport(TransportError::NotFound { url }));
                    }
                    let request = FetchRequest {
                        key: &key,
                        expected: &expected,
                        size,
                        repository: &repository,
                        url: &url,
                    };
                    cache.fetch_artifact(request, &*reporter, &cancel).await
                }
                .await;
                (index, result)
            });
        }

        let mut fetched: HashMap<Coordinate, Vec<ResolvedArtifact>> = HashMap::new();
        let mut failure = None;
        while let Some(joined) = set.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => continue,
            };
            let job = &jobs[index];
            match result {
                Ok(cached) => {
                    if cached.from_cache {
                        self.engine.reporter.cached(&job.coordinate, &job.version);
                    } else {
                        self.engine.reporter.done(
                            &job.coordinate,
                            &job.version,
                            "verified",
                            Some(cached.size),
                        );
                    }
                    fetched
                        .entry(job.coordinate.clone())
                        .or_default()
                        .push(ResolvedArtifact {
                            classifier: job.artifact.classifier.clone(),
                            extension: job.artifact.extension.clone(),
                            digest: cached.digest,
                            path: cached.path,
                            size: cached.size,
                        });
                }
                Err(CacheError::Cancelled) if failure.is_some() => {}
                Err(e) => {
                    if failure.is_none() {
                        self.engine
                            .reporter
                            .failed(&job.coordinate, &job.version, &e.to_string());
                        failure = Some(ResolveError::from_cache(
                            e,
                            &job.coordinate,
                            &job.version,
                            &job.chain,
                        ));
                        fetch_cancel.cancel();
                    }
                }
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }
        if cancel.is_cancelled() {
            return Err(ResolveError::Cancelled);
        }
        for artifacts in fetched.values_mut() {
            artifacts.sort_by(|a, b| a.classifier.cmp(&b.classifier));
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, req};
    use std::time::Duration;

    fn engine(fx: &Fixture, dir: &tempfile::TempDir) -> Engine {
        Engine::new(fx.store.clone(), ArtifactCache::new(dir.path()))
    }

    #[tokio::test]
    async fn states_advance_to_complete() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &["g:b:1.0"]);
        fx.publish("g:b", "1.0", &[]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&fx, &dir);

        let invocation = engine.invocation(&[req("g:a:1.0")], &fx.policy());
        let mut states = invocation.subscribe();
        assert_eq!(invocation.state(), InvocationState::Collecting);
        let result = invocation.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(*states.borrow_and_update(), InvocationState::Complete);
        assert_eq!(result.len(), 2);
        let a = result.get(&"g:a".parse().unwrap()).unwrap();
        assert_eq!(a.dependencies.len(), 1);
        assert_eq!(a.artifacts.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&a.artifacts[0].path).unwrap(),
            "g:a:1.0"
        );
    }

    #[tokio::test]
    async fn failure_ends_in_failed_state() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let invocation = engine(&fx, &dir).invocation(&[req("g:missing:1.0")], &fx.policy());
        let states = invocation.subscribe();

        let err = invocation.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }), "{err}");
        assert_eq!(*states.borrow(), InvocationState::Failed);
    }

    #[tokio::test]
    async fn first_download_failure_fails_everything() {
        let fx = Fixture::new();
        for name in ["a", "b", "c", "d"] {
            fx.publish(&format!("g:{name}"), "1.0", &[]);
        }
        let broken = fx.publish("g:e", "1.0", &[]);
        fx.transport.remove(&fx.repo.artifact_url(&broken).unwrap());
        let dir = tempfile::tempdir().unwrap();

        let roots: Vec<_> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|n| req(&format!("g:{n}:1.0")))
            .collect();
        let err = engine(&fx, &dir)
            .resolve(&roots, &fx.policy(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ResolveError::NotFound {
                coordinate, chain, ..
            } => {
                assert_eq!(coordinate.to_string(), "g:e");
                assert_eq!(chain.to_string(), "root > g:e:1.0");
            }
            other => panic!("unexpected {other}"),
        }
        assert!(
            std::fs::read_dir(dir.path().join("locks"))
                .map(|mut d| d.next().is_none())
                .unwrap_or(true)
        );
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let fx = Fixture::new();
        fx.transport.set_chunk_delay(Some(Duration::from_millis(5)));
        let names: Vec<String> = (0..6).map(|i| format!("m{i}")).collect();
        for name in &names {
            fx.publish(&format!("g:{name}"), "1.0", &[]);
        }
        let dir = tempfile::tempdir().unwrap();
        let mut policy = fx.policy();
        policy.max_parallel_downloads = 1;

        let roots: Vec<_> = names.iter().map(|n| req(&format!("g:{n}:1.0"))).collect();
        let result = engine(&fx, &dir)
            .resolve(&roots, &policy, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.len(), 6);
        assert_eq!(result.artifact_paths().count(), 6);
    }

    #[tokio::test]
    async fn offline_serves_cached_artifacts_only() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &[]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&fx, &dir);
        let cancel = CancellationToken::new();

        engine
            .resolve(&[req("g:a:1.0")], &fx.policy(), &cancel)
            .await
            .unwrap();
        fx.transport.reset_counts();

        let mut offline = fx.policy();
        offline.offline = true;
        let result = engine
            .resolve(&[req("g:a:1.0")], &offline, &cancel)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(fx.transport.total_requests(), 0);

        fx.publish("g:b", "1.0", &[]);
        let err = engine
            .resolve(&[req("g:b:1.0")], &offline, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_classifier_is_not_found() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &[]);
        let dir = tempfile::tempdir().unwrap();
        let root = req("g:a:1.0").with_classifier("linux");

        let err = engine(&fx, &dir)
            .resolve(&[root], &fx.policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, ResolveError::NotFound { version: Some(v), .. } if v.as_str() == "1.0"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn pre_cancelled_run_does_nothing() {
        let fx = Fixture::new();
        fx.publish("g:a", "1.0", &[]);
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine(&fx, &dir)
            .resolve(&[req("g:a:1.0")], &fx.policy(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
        assert_eq!(fx.transport.total_requests(), 0);
    }
}
