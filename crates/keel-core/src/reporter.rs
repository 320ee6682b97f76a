//! Reporter trait for dependency injection
//!
//! The engine reports progress through this trait so it is not coupled to a
//! terminal or any other front end.

use keel_schema::{Coordinate, Version};

/// Progress sink for a resolution.
pub trait Reporter: Send + Sync {
    /// A new phase started (e.g. "Resolving", "Fetching").
    fn phase(&self, title: &str);

    /// Metadata for `coordinate` is being resolved.
    fn resolving(&self, coordinate: &Coordinate);

    /// Download progress of an artifact.
    fn downloading(&self, coordinate: &Coordinate, version: &Version, current: u64, total: Option<u64>);

    /// An artifact was served from the cache without network access.
    fn cached(&self, coordinate: &Coordinate, version: &Version);

    /// An artifact is in place and verified.
    fn done(&self, coordinate: &Coordinate, version: &Version, detail: &str, size: Option<u64>);

    /// An artifact could not be fetched.
    fn failed(&self, coordinate: &Coordinate, version: &Version, reason: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Display a final summary.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn phase(&self, title: &str) {
        (**self).phase(title);
    }
    fn resolving(&self, coordinate: &Coordinate) {
        (**self).resolving(coordinate);
    }
    fn downloading(&self, coordinate: &Coordinate, version: &Version, current: u64, total: Option<u64>) {
        (**self).downloading(coordinate, version, current, total);
    }
    fn cached(&self, coordinate: &Coordinate, version: &Version) {
        (**self).cached(coordinate, version);
    }
    fn done(&self, coordinate: &Coordinate, version: &Version, detail: &str, size: Option<u64>) {
        (**self).done(coordinate, version, detail, size);
    }
    fn failed(&self, coordinate: &Coordinate, version: &Version, reason: &str) {
        (**self).failed(coordinate, version, reason);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn phase(&self, _: &str) {}
    fn resolving(&self, _: &Coordinate) {}
    fn downloading(&self, _: &Coordinate, _: &Version, _: u64, _: Option<u64>) {}
    fn cached(&self, _: &Coordinate, _: &Version) {}
    fn done(&self, _: &Coordinate, _: &Version, _: &str, _: Option<u64>) {}
    fn failed(&self, _: &Coordinate, _: &Version, _: &str) {}
    fn warning(&self, _: &str) {}
    fn summary(&self, _: usize, _: &str, _: f64) {}
}
