//! Metadata resolution: version listings and module descriptors.
//!
//! Every fetched document is stored in the [`MetadataStore`] inside an
//! envelope recording which repository served it, when, and the SHA-256 of the
//! body. Release descriptors never expire. Listings and changing-version
//! descriptors are refetched once older than the changing TTL.

pub mod store;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use keel_schema::{Coordinate, Digest, ModuleDescriptor, Version, VersionListing};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::policy::PolicyConfig;
use crate::repository::Repository;
use crate::transport::{RetryPolicy, TransportError, with_retry};

pub use store::{FsMetadataStore, MemoryMetadataStore, MetadataStore, StoreError};

fn at(version: Option<&Version>) -> String {
    version.map(|v| format!(":{v}")).unwrap_or_default()
}

/// Failure resolving metadata.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// No repository knows the module (or version), and nothing is cached.
    #[error("{coordinate}{} not found in any repository", at(.version.as_ref()))]
    NotFound {
        /// Requested module.
        coordinate: Coordinate,
        /// Requested version, for descriptors.
        version: Option<Version>,
    },

    /// Transport failure after the retry budget.
    #[error("Failed to fetch metadata for {coordinate}{}: {source}", at(.version.as_ref()))]
    Transport {
        /// Requested module.
        coordinate: Coordinate,
        /// Requested version, for descriptors.
        version: Option<Version>,
        /// Last transport error.
        #[source]
        source: TransportError,
    },

    /// Cached or remote metadata failed verification or parsing.
    #[error("Metadata integrity failure for {coordinate}{}: {detail}", at(.version.as_ref()))]
    Integrity {
        /// Requested module.
        coordinate: Coordinate,
        /// Requested version, for descriptors.
        version: Option<Version>,
        /// What failed.
        detail: String,
    },

    /// The metadata store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The resolution was cancelled.
    #[error("Metadata request cancelled")]
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    repository: String,
    fetched_at: DateTime<Utc>,
    sha256: String,
    body: String,
}

impl Envelope {
    fn new(repository: &str, body: String) -> Self {
        Self {
            repository: repository.to_string(),
            fetched_at: Utc::now(),
            sha256: Digest::sha256(body.as_bytes()).hex().to_string(),
            body,
        }
    }
}

fn listing_key(coordinate: &Coordinate) -> String {
    format!("versions/{}/{}", coordinate.group(), coordinate.name())
}

fn descriptor_key(coordinate: &Coordinate, version: &Version) -> String {
    format!(
        "descriptors/{}/{}/{}",
        coordinate.group(),
        coordinate.name(),
        version.as_str()
    )
}

/// Per-invocation metadata resolver.
///
/// Memoizes everything it returns, so one run never asks the store or the
/// network for the same document twice. The first repository (in precedence
/// order) that knows a module owns it for the rest of the run.
#[derive(Debug)]
pub struct MetadataResolver {
    store: Arc<dyn MetadataStore>,
    repositories: Vec<Arc<Repository>>,
    changing_ttl: Duration,
    offline: bool,
    refresh: bool,
    retry: RetryPolicy,
    cancel: CancellationToken,
    owners: HashMap<Coordinate, Arc<Repository>>,
    listings: HashMap<Coordinate, Arc<[Version]>>,
    descriptors: HashMap<(Coordinate, Version), Arc<ModuleDescriptor>>,
}

impl MetadataResolver {
    /// A resolver over `store` using the repositories and cache settings of
    /// `policy`.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        policy: &PolicyConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            repositories: policy.repositories.clone(),
            changing_ttl: policy.changing_ttl,
            offline: policy.offline,
            refresh: policy.refresh,
            retry: policy.retry.clone(),
            cancel,
            owners: HashMap::new(),
            listings: HashMap::new(),
            descriptors: HashMap::new(),
        }
    }

    /// The repository that served `coordinate` in this run, if any did.
    pub fn owner(&self, coordinate: &Coordinate) -> Option<&Arc<Repository>> {
        self.owners.get(coordinate)
    }

    /// All published versions of `coordinate`, ascending.
    ///
    /// # Errors
    ///
    /// [`MetadataError::NotFound`] if no repository lists the module,
    /// [`MetadataError::Transport`] / [`MetadataError::Integrity`] /
    /// [`MetadataError::Store`] on the respective failures.
    pub async fn resolve_versions(
        &mut self,
        coordinate: &Coordinate,
    ) -> Result<Arc<[Version]>, MetadataError> {
        if let Some(versions) = self.listings.get(coordinate) {
            return Ok(versions.clone());
        }

        let key = listing_key(coordinate);
        let cached = self.load_cached(&key, coordinate, None).await?;
        let body = match cached {
            Some(envelope) if self.offline || self.is_fresh(envelope.fetched_at) => {
                trace!("Using cached version listing for {coordinate}");
                self.adopt_owner(coordinate, &envelope.repository);
                envelope.body
            }
            _ if self.offline => {
                return Err(MetadataError::NotFound {
                    coordinate: coordinate.clone(),
                    version: None,
                });
            }
            _ => {
                let (repository, bytes) = self
                    .fetch_first(coordinate, None, |repo| repo.versions_url(coordinate))
                    .await?;
                let body = utf8(coordinate, None, bytes)?;
                self.save(&key, repository.name(), &body).await?;
                body
            }
        };

        let listing: VersionListing =
            serde_json::from_str(&body).map_err(|e| MetadataError::Integrity {
                coordinate: coordinate.clone(),
                version: None,
                detail: format!("malformed version listing: {e}"),
            })?;
        let versions: Arc<[Version]> = listing.sorted().into();
        debug!("{coordinate}: {} version(s) available", versions.len());
        self.listings.insert(coordinate.clone(), versions.clone());
        Ok(versions)
    }

    /// The descriptor of `coordinate` at `version`.
    ///
    /// # Errors
    ///
    /// [`MetadataError::NotFound`] if no repository has it and it is not
    /// cached, [`MetadataError::Integrity`] if the cached envelope or the
    /// repository's `.sha256` sidecar does not match, and the transport and
    /// store errors otherwise.
    pub async fn resolve_descriptor(
        &mut self,
        coordinate: &Coordinate,
        version: &Version,
    ) -> Result<Arc<ModuleDescriptor>, MetadataError> {
        let memo_key = (coordinate.clone(), version.clone());
        if let Some(descriptor) = self.descriptors.get(&memo_key) {
            return Ok(descriptor.clone());
        }

        let key = descriptor_key(coordinate, version);
        let cached = self.load_cached(&key, coordinate, Some(version)).await?;
        let usable = cached.as_ref().is_some_and(|envelope| {
            self.offline || !version.is_changing() || self.is_fresh(envelope.fetched_at)
        });
        let body = match cached {
            Some(envelope) if usable => {
                trace!("Using cached descriptor for {coordinate}:{version}");
                self.adopt_owner(coordinate, &envelope.repository);
                envelope.body
            }
            _ if self.offline => {
                return Err(MetadataError::NotFound {
                    coordinate: coordinate.clone(),
                    version: Some(version.clone()),
                });
            }
            _ => {
                let (repository, bytes) = self
                    .fetch_first(coordinate, Some(version), |repo| {
                        repo.descriptor_url(coordinate, version)
                    })
                    .await?;
                self.verify_checksum(&repository, coordinate, version, &bytes)
                    .await?;
                let body = utf8(coordinate, Some(version), bytes)?;
                self.save(&key, repository.name(), &body).await?;
                body
            }
        };

        let integrity = |detail: String| MetadataError::Integrity {
            coordinate: coordinate.clone(),
            version: Some(version.clone()),
            detail,
        };
        let descriptor = ModuleDescriptor::from_json(body.as_bytes())
            .map_err(|e| integrity(format!("malformed descriptor: {e}")))?;
        if descriptor.coordinate != *coordinate || descriptor.version != *version {
            return Err(integrity(format!(
                "descriptor describes {}:{}",
                descriptor.coordinate, descriptor.version
            )));
        }

        let descriptor = Arc::new(descriptor);
        self.descriptors.insert(memo_key, descriptor.clone());
        Ok(descriptor)
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        match (Utc::now() - fetched_at).to_std() {
            Ok(age) => age < self.changing_ttl,
            // Timestamp in the future: clock skew, treat as fresh.
            Err(_) => true,
        }
    }

    fn adopt_owner(&mut self, coordinate: &Coordinate, repository: &str) {
        if self.owners.contains_key(coordinate) {
            return;
        }
        if let Some(repo) = self.repositories.iter().find(|r| r.name() == repository) {
            self.owners.insert(coordinate.clone(), repo.clone());
        }
    }

    async fn load_cached(
        &self,
        key: &str,
        coordinate: &Coordinate,
        version: Option<&Version>,
    ) -> Result<Option<Envelope>, MetadataError> {
        if self.refresh && !self.offline {
            return Ok(None);
        }
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };

        let integrity = |detail: String| MetadataError::Integrity {
            coordinate: coordinate.clone(),
            version: version.cloned(),
            detail,
        };
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| integrity(format!("unreadable cache entry '{key}': {e}")))?;
        let actual = Digest::sha256(envelope.body.as_bytes());
        if actual.hex() != envelope.sha256 {
            return Err(integrity(format!(
                "cache entry '{key}' checksum mismatch: recorded {}, actual {}",
                envelope.sha256,
                actual.hex()
            )));
        }
        Ok(Some(envelope))
    }

    async fn save(&self, key: &str, repository: &str, body: &str) -> Result<(), MetadataError> {
        let envelope = Envelope::new(repository, body.to_string());
        let bytes = serde_json::to_vec(&envelope).map_err(|e| {
            MetadataError::Store(StoreError {
                key: key.to_string(),
                source: std::io::Error::other(e),
            })
        })?;
        self.store.put(key, &bytes).await?;
        Ok(())
    }

    async fn fetch(&self, repository: &Repository, url: &str) -> Result<Bytes, TransportError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = with_retry(&self.retry, &self.cancel, url, || repository.fetch_bytes(url)) => result,
        }
    }

    /// Try repositories in precedence order (or only the owner, once known)
    /// and return the first that has `url_for(repo)`.
    async fn fetch_first(
        &mut self,
        coordinate: &Coordinate,
        version: Option<&Version>,
        url_for: impl Fn(&Repository) -> String,
    ) -> Result<(Arc<Repository>, Bytes), MetadataError> {
        let candidates = match self.owners.get(coordinate) {
            Some(owner) => vec![owner.clone()],
            None => self.repositories.clone(),
        };

        for repository in candidates {
            let url = url_for(&repository);
            match self.fetch(&repository, &url).await {
                Ok(bytes) => {
                    debug!("Fetched {url} from '{}'", repository.name());
                    self.owners
                        .entry(coordinate.clone())
                        .or_insert_with(|| repository.clone());
                    return Ok((repository, bytes));
                }
                Err(e) if e.is_not_found() => {
                    trace!("{url} not in '{}'", repository.name());
                }
                Err(TransportError::Cancelled) => return Err(MetadataError::Cancelled),
                Err(source) => {
                    return Err(MetadataError::Transport {
                        coordinate: coordinate.clone(),
                        version: version.cloned(),
                        source,
                    });
                }
            }
        }

        Err(MetadataError::NotFound {
            coordinate: coordinate.clone(),
            version: version.cloned(),
        })
    }

    async fn verify_checksum(
        &self,
        repository: &Repository,
        coordinate: &Coordinate,
        version: &Version,
        body: &[u8],
    ) -> Result<(), MetadataError> {
        let url = repository.descriptor_checksum_url(coordinate, version);
        let published = match self.fetch(repository, &url).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(TransportError::Cancelled) => return Err(MetadataError::Cancelled),
            Err(source) => {
                return Err(MetadataError::Transport {
                    coordinate: coordinate.clone(),
                    version: Some(version.clone()),
                    source,
                });
            }
        };

        let text = String::from_utf8_lossy(&published);
        let expected = text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let actual = Digest::sha256(body);
        if expected == actual.hex() {
            Ok(())
        } else {
            Err(MetadataError::Integrity {
                coordinate: coordinate.clone(),
                version: Some(version.clone()),
                detail: format!(
                    "descriptor checksum mismatch: published {expected}, actual {}",
                    actual.hex()
                ),
            })
        }
    }
}

fn utf8(
    coordinate: &Coordinate,
    version: Option<&Version>,
    bytes: Bytes,
) -> Result<String, MetadataError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| MetadataError::Integrity {
        coordinate: coordinate.clone(),
        version: version.cloned(),
        detail: "metadata is not UTF-8".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryRepository, MemoryTransport};

    struct Fixture {
        transport: Arc<MemoryTransport>,
        repo: MemoryRepository,
        store: Arc<MemoryMetadataStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = Arc::new(MemoryTransport::new());
            let repo = MemoryRepository::new(transport.clone(), "mem://central");
            Self {
                transport,
                repo,
                store: Arc::new(MemoryMetadataStore::new()),
            }
        }

        fn policy(&self) -> PolicyConfig {
            PolicyConfig::default()
                .with_repository(self.repo.repository("central"))
                .with_retry(RetryPolicy::immediate(3))
        }

        fn resolver(&self, policy: &PolicyConfig) -> MetadataResolver {
            MetadataResolver::new(self.store.clone(), policy, CancellationToken::new())
        }
    }

    fn coord(s: &str) -> Coordinate {
        s.parse().unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[tokio::test]
    async fn lists_versions_ascending_and_memoizes() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "2.0", vec![]).unwrap();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        fx.repo.publish("g:a", "1.5", vec![]).unwrap();

        let mut resolver = fx.resolver(&fx.policy());
        let versions = resolver.resolve_versions(&coord("g:a")).await.unwrap();
        let shown: Vec<&str> = versions.iter().map(Version::as_str).collect();
        assert_eq!(shown, vec!["1.0", "1.5", "2.0"]);

        resolver.resolve_versions(&coord("g:a")).await.unwrap();
        assert_eq!(fx.transport.request_count(&fx.repo.versions_url(&coord("g:a"))), 1);
    }

    #[tokio::test]
    async fn release_descriptor_is_reused_across_runs() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        let policy = fx.policy();

        let first = fx
            .resolver(&policy)
            .resolve_descriptor(&coord("g:a"), &v("1.0"))
            .await
            .unwrap();
        let requests = fx.transport.total_requests();

        let second = fx
            .resolver(&policy)
            .resolve_descriptor(&coord("g:a"), &v("1.0"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(fx.transport.total_requests(), requests);
    }

    #[tokio::test]
    async fn changing_metadata_respects_ttl() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0-SNAPSHOT", vec![]).unwrap();
        let url = fx.repo.descriptor_url(&coord("g:a"), &v("1.0-SNAPSHOT"));

        let stale = fx.policy().with_changing_ttl(Duration::ZERO);
        for _ in 0..2 {
            fx.resolver(&stale)
                .resolve_descriptor(&coord("g:a"), &v("1.0-SNAPSHOT"))
                .await
                .unwrap();
        }
        assert_eq!(fx.transport.request_count(&url), 2);

        let fresh = fx.policy().with_changing_ttl(Duration::from_secs(3600));
        fx.resolver(&fresh)
            .resolve_descriptor(&coord("g:a"), &v("1.0-SNAPSHOT"))
            .await
            .unwrap();
        assert_eq!(fx.transport.request_count(&url), 2);
    }

    #[tokio::test]
    async fn listings_expire_with_ttl() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        let stale = fx.policy().with_changing_ttl(Duration::ZERO);

        fx.resolver(&stale)
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap();
        fx.repo.publish("g:a", "1.1", vec![]).unwrap();
        let versions = fx
            .resolver(&stale)
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn offline_serves_only_the_store() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        let mut offline = fx.policy();
        offline.offline = true;

        let err = fx
            .resolver(&offline)
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
        assert_eq!(fx.transport.total_requests(), 0);

        fx.resolver(&fx.policy())
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap();
        let versions = fx
            .resolver(&offline)
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn refresh_ignores_the_store() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        let mut refresh = fx.policy();
        refresh.refresh = true;

        for _ in 0..2 {
            fx.resolver(&refresh)
                .resolve_descriptor(&coord("g:a"), &v("1.0"))
                .await
                .unwrap();
        }
        let url = fx.repo.descriptor_url(&coord("g:a"), &v("1.0"));
        assert_eq!(fx.transport.request_count(&url), 2);
    }

    #[tokio::test]
    async fn corrupted_cache_entry_is_an_integrity_error() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        fx.resolver(&fx.policy())
            .resolve_descriptor(&coord("g:a"), &v("1.0"))
            .await
            .unwrap();

        let key = descriptor_key(&coord("g:a"), &v("1.0"));
        let raw = fx.store.get(&key).await.unwrap().unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&raw).unwrap();
        envelope.body = envelope.body.replace("1.0", "6.6");
        fx.store
            .put(&key, &serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();

        let err = fx
            .resolver(&fx.policy())
            .resolve_descriptor(&coord("g:a"), &v("1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Integrity { .. }), "{err}");
    }

    #[tokio::test]
    async fn descriptor_checksum_sidecar_is_verified() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        fx.repo
            .publish_descriptor_checksum(&coord("g:a"), &v("1.0"), &"0".repeat(64));

        let err = fx
            .resolver(&fx.policy())
            .resolve_descriptor(&coord("g:a"), &v("1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Integrity { .. }));
    }

    #[tokio::test]
    async fn first_repository_that_knows_a_module_owns_it() {
        let transport = Arc::new(MemoryTransport::new());
        let first = MemoryRepository::new(transport.clone(), "mem://first");
        let second = MemoryRepository::new(transport.clone(), "mem://second");
        first.publish("g:a", "1.0", vec![]).unwrap();
        second.publish("g:a", "2.0", vec![]).unwrap();
        second.publish("g:b", "1.0", vec![]).unwrap();

        let policy = PolicyConfig::default()
            .with_repository(first.repository("first"))
            .with_repository(second.repository("second"))
            .with_retry(RetryPolicy::immediate(1));
        let mut resolver = MetadataResolver::new(
            Arc::new(MemoryMetadataStore::new()),
            &policy,
            CancellationToken::new(),
        );

        let a = resolver.resolve_versions(&coord("g:a")).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(resolver.owner(&coord("g:a")).unwrap().name(), "first");

        resolver.resolve_versions(&coord("g:b")).await.unwrap();
        assert_eq!(resolver.owner(&coord("g:b")).unwrap().name(), "second");

        let err = resolver
            .resolve_descriptor(&coord("g:a"), &v("2.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        let url = fx.repo.versions_url(&coord("g:a"));
        fx.transport.fail_next(
            url.clone(),
            TransportError::Status {
                url: url.clone(),
                status: 502,
            },
        );

        fx.resolver(&fx.policy())
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap();
        assert_eq!(fx.transport.request_count(&url), 2);
    }

    #[tokio::test]
    async fn permanent_failures_surface_as_transport_errors() {
        let fx = Fixture::new();
        fx.repo.publish("g:a", "1.0", vec![]).unwrap();
        let url = fx.repo.versions_url(&coord("g:a"));
        for _ in 0..3 {
            fx.transport.fail_next(
                url.clone(),
                TransportError::Timeout { url: url.clone() },
            );
        }

        let err = fx
            .resolver(&fx.policy())
            .resolve_versions(&coord("g:a"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Transport { .. }));
        assert_eq!(fx.transport.request_count(&url), 3);
    }
}
