//! Errors surfaced by [`Engine::resolve`](crate::Engine::resolve).

use keel_schema::{Coordinate, DependencyRequirement, Version, VersionConstraint};
use std::fmt;
use thiserror::Error;

use crate::cache::CacheError;
use crate::metadata::MetadataError;
use crate::transport::TransportError;

/// The requirements that led from a root to a coordinate, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementChain(pub Vec<DependencyRequirement>);

impl RequirementChain {
    /// The chain extended by one more requirement.
    pub fn with(&self, requirement: DependencyRequirement) -> Self {
        let mut steps = self.0.clone();
        steps.push(requirement);
        Self(steps)
    }

    /// Number of requirements in the chain.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the chain is empty (the coordinate came from policy alone).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RequirementChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("root")?;
        for step in &self.0 {
            write!(f, " > {}:{}", step.coordinate, step.constraint)?;
        }
        Ok(())
    }
}

/// Where a version request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A requirement in the graph, reached through `chain`.
    Requirement(RequirementChain),
    /// A forced version in the policy (or a root `force` flag).
    PolicyForce,
    /// A strict pin in the policy.
    PolicyPin,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requirement(chain) => write!(f, "{chain}"),
            Self::PolicyForce => f.write_str("policy force"),
            Self::PolicyPin => f.write_str("policy pin"),
        }
    }
}

fn at(version: Option<&Version>) -> String {
    version.map(|v| format!(":{v}")).unwrap_or_default()
}

fn list(versions: &[Version]) -> String {
    if versions.is_empty() {
        return "none".to_string();
    }
    versions
        .iter()
        .map(Version::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A failed resolution. Nothing partial is ever returned alongside it.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// A module or version does not exist in any repository.
    #[error("{coordinate}{} not found (required by {chain})", at(.version.as_ref()))]
    NotFound {
        /// Missing module.
        coordinate: Coordinate,
        /// Missing version, when one was asked for.
        version: Option<Version>,
        /// How the coordinate was reached.
        chain: RequirementChain,
    },

    /// A repository could not be reached after the retry budget.
    #[error("Failed to fetch {coordinate}{} (required by {chain}): {source}", at(.version.as_ref()))]
    Transport {
        /// Module being fetched.
        coordinate: Coordinate,
        /// Version being fetched.
        version: Option<Version>,
        /// How the coordinate was reached.
        chain: RequirementChain,
        /// Last transport error.
        #[source]
        source: TransportError,
    },

    /// Metadata or an artifact failed verification.
    #[error("Integrity check failed for {coordinate}{} (required by {chain}): {detail}", at(.version.as_ref()))]
    Integrity {
        /// Affected module.
        coordinate: Coordinate,
        /// Affected version.
        version: Option<Version>,
        /// How the coordinate was reached.
        chain: RequirementChain,
        /// What failed.
        detail: String,
    },

    /// No published version satisfies a live requirement.
    #[error(
        "No version of {coordinate} matches '{constraint}' (available: {}; required by {chain})",
        list(.available)
    )]
    Unresolvable {
        /// Required module.
        coordinate: Coordinate,
        /// Unsatisfiable constraint.
        constraint: VersionConstraint,
        /// Everything the repositories offer.
        available: Vec<Version>,
        /// How the requirement was reached.
        chain: RequirementChain,
    },

    /// The selected version violates a strict requirement or pin.
    #[error(
        "{coordinate}:{selected} (selected by {selected_by}) violates strict '{constraint}' from {strict_origin}"
    )]
    StrictConflict {
        /// Contested module.
        coordinate: Coordinate,
        /// Version that won.
        selected: Version,
        /// Where the winning request came from.
        selected_by: Origin,
        /// The violated strict constraint.
        constraint: VersionConstraint,
        /// Where the strict constraint came from.
        strict_origin: Origin,
    },

    /// Two different versions were forced for one module.
    #[error("{coordinate} is forced to both {first} and {second}")]
    ForceConflict {
        /// Contested module.
        coordinate: Coordinate,
        /// First forced version.
        first: Version,
        /// Second forced version.
        second: Version,
    },

    /// Ordinary requirements disagree under the `fail` strategy.
    #[error(
        "Version conflict on {coordinate}: {first} (from {first_origin}) vs {second} (from {second_origin})"
    )]
    VersionConflict {
        /// Contested module.
        coordinate: Coordinate,
        /// One requested version.
        first: Version,
        /// Where it was requested.
        first_origin: Origin,
        /// A different requested version.
        second: Version,
        /// Where that was requested.
        second_origin: Origin,
    },

    /// Selection kept changing between iterations.
    #[error("Resolution did not converge after {iterations} iterations")]
    DidNotConverge {
        /// Iterations performed.
        iterations: usize,
    },

    /// The caller cancelled the resolution.
    #[error("Resolution cancelled")]
    Cancelled,

    /// The artifact cache failed (I/O, lock timeout).
    #[error("Cache error{}: {source}", cache_subject(.coordinate.as_ref(), .version.as_ref()))]
    Cache {
        /// Affected module, if known.
        coordinate: Option<Coordinate>,
        /// Affected version, if known.
        version: Option<Version>,
        /// Underlying cache error.
        #[source]
        source: CacheError,
    },
}

fn cache_subject(coordinate: Option<&Coordinate>, version: Option<&Version>) -> String {
    match coordinate {
        Some(c) => format!(" for {c}{}", at(version)),
        None => String::new(),
    }
}

impl ResolveError {
    /// Lift a metadata failure, attaching the chain that reached it.
    pub(crate) fn from_metadata(error: MetadataError, chain: &RequirementChain) -> Self {
        match error {
            MetadataError::NotFound {
                coordinate,
                version,
            } => Self::NotFound {
                coordinate,
                version,
                chain: chain.clone(),
            },
            MetadataError::Transport {
                coordinate,
                version,
                source,
            } => Self::Transport {
                coordinate,
                version,
                chain: chain.clone(),
                source,
            },
            MetadataError::Integrity {
                coordinate,
                version,
                detail,
            } => Self::Integrity {
                coordinate,
                version,
                chain: chain.clone(),
                detail,
            },
            MetadataError::Store(e) => Self::Cache {
                coordinate: None,
                version: None,
                source: CacheError::Io {
                    path: e.key.into(),
                    source: e.source,
                },
            },
            MetadataError::Cancelled => Self::Cancelled,
        }
    }

    /// Lift an artifact cache failure for `coordinate:version`.
    pub(crate) fn from_cache(
        error: CacheError,
        coordinate: &Coordinate,
        version: &Version,
        chain: &RequirementChain,
    ) -> Self {
        match error {
            CacheError::Cancelled => Self::Cancelled,
            CacheError::Transport(TransportError::NotFound { .. }) => Self::NotFound {
                coordinate: coordinate.clone(),
                version: Some(version.clone()),
                chain: chain.clone(),
            },
            CacheError::Transport(source) => Self::Transport {
                coordinate: coordinate.clone(),
                version: Some(version.clone()),
                chain: chain.clone(),
                source,
            },
            integrity @ CacheError::Integrity { .. } => Self::Integrity {
                coordinate: coordinate.clone(),
                version: Some(version.clone()),
                chain: chain.clone(),
                detail: integrity.to_string(),
            },
            source => Self::Cache {
                coordinate: Some(coordinate.clone()),
                version: Some(version.clone()),
                source,
            },
        }
    }
}
