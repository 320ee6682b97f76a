//! Value types shared by the keel engine and its tooling.
//!
//! Everything here is plain data: coordinates, versions, constraints,
//! requirements, module descriptors and digests, with their textual and JSON
//! wire forms. No I/O.

pub mod constraint;
pub mod coordinate;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod requirement;
pub mod version;

// Re-exports
pub use constraint::{VersionConstraint, VersionRange};
pub use coordinate::Coordinate;
pub use descriptor::{ArtifactRef, ModuleDescriptor, VersionListing};
pub use digest::{Digest, DigestAlgorithm, DigestHasher};
pub use error::ParseError;
pub use requirement::{DependencyRequirement, Exclusion, ExclusionSet};
pub use version::{Version, VersionPart};
