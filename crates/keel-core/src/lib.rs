//! keel engine: resolves root requirements into a version-consistent set of
//! verified, locally cached artifacts.

pub mod cache;
pub mod conflict;
pub mod credentials;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod metadata;
pub mod orchestrator;
pub mod paths;
pub mod policy;
pub mod repository;
pub mod result;
pub mod transport;

pub mod reporter;

#[cfg(test)]
mod testing;

pub use cache::{ArtifactCache, CacheError, CacheKey, CacheOptions, CachedArtifact};
pub use error::{Origin, RequirementChain, ResolveError};
pub use metadata::{FsMetadataStore, MemoryMetadataStore, MetadataResolver, MetadataStore};
pub use orchestrator::{Engine, Invocation, InvocationState};
pub use paths::*;
pub use policy::{ConflictStrategy, PolicyConfig, TransitiveForce};
pub use reporter::{NullReporter, Reporter};
pub use repository::Repository;
pub use result::{ResolutionResult, ResolvedArtifact, ResolvedComponent};

/// User Agent string for repository requests
pub const USER_AGENT: &str = concat!("keel/", env!("CARGO_PKG_VERSION"));
