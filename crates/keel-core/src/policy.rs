//! Resolution policy: everything a caller can tune about one resolution.

use keel_schema::{Coordinate, Exclusion, ExclusionSet, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::repository::Repository;
use crate::transport::RetryPolicy;

/// How differing ordinary requests for one coordinate are settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The highest requested version wins.
    #[default]
    Highest,
    /// Any disagreement between ordinary requests is an error.
    Fail,
}

/// What a `force` flag means on a requirement found in a descriptor.
///
/// Forces are root-level overrides; a published module cannot force its
/// consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitiveForce {
    /// Drop the flag and log a warning.
    #[default]
    Ignore,
    /// Treat the requirement as strict.
    AsStrict,
}

/// Inputs to a resolution beyond the root requirements.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Conflict strategy for ordinary requirements.
    pub strategy: ConflictStrategy,
    /// Root-level forced versions.
    pub forced: BTreeMap<Coordinate, Version>,
    /// Versions a coordinate must resolve to if it is in the graph at all.
    pub strict_pins: BTreeMap<Coordinate, Version>,
    /// Exclusions applied to every root edge's subtree.
    pub exclusions: ExclusionSet,
    /// Repositories in precedence order.
    pub repositories: Vec<Arc<Repository>>,
    /// How long listings and changing-version metadata stay fresh.
    pub changing_ttl: Duration,
    /// Concurrent artifact downloads.
    pub max_parallel_downloads: usize,
    /// A force wins even against a strict requirement it violates.
    pub force_overrides_strict: bool,
    /// Handling of `force` on transitive requirements.
    pub transitive_force: TransitiveForce,
    /// Serve metadata only from the local store.
    pub offline: bool,
    /// Ignore cached metadata and refetch everything.
    pub refresh: bool,
    /// Retry budget for transient transport failures.
    pub retry: RetryPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            forced: BTreeMap::new(),
            strict_pins: BTreeMap::new(),
            exclusions: ExclusionSet::new(),
            repositories: Vec::new(),
            changing_ttl: Duration::from_secs(24 * 60 * 60),
            max_parallel_downloads: num_cpus::get().max(1),
            force_overrides_strict: true,
            transitive_force: TransitiveForce::default(),
            offline: false,
            refresh: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl PolicyConfig {
    /// Append a repository (lowest precedence so far).
    pub fn with_repository(mut self, repository: Arc<Repository>) -> Self {
        self.repositories.push(repository);
        self
    }

    /// Force `coordinate` to `version`.
    pub fn force(mut self, coordinate: Coordinate, version: Version) -> Self {
        self.forced.insert(coordinate, version);
        self
    }

    /// Pin `coordinate` strictly to `version`.
    pub fn pin(mut self, coordinate: Coordinate, version: Version) -> Self {
        self.strict_pins.insert(coordinate, version);
        self
    }

    /// Add a global exclusion.
    pub fn exclude(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.insert(exclusion);
        self
    }

    /// Set the conflict strategy.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the changing-version TTL.
    pub fn with_changing_ttl(mut self, ttl: Duration) -> Self {
        self.changing_ttl = ttl;
        self
    }
}
