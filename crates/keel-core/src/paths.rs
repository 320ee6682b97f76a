use dirs::home_dir;
use std::path::PathBuf;

/// Returns the keel home directory, or None if the user's home cannot be resolved.
///
/// `KEEL_HOME` overrides the default `~/.keel`.
pub fn try_keel_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("KEEL_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".keel"))
}

/// Returns the keel home directory, falling back to `.keel` in the working
/// directory when no home can be resolved.
pub fn keel_home() -> PathBuf {
    try_keel_home().unwrap_or_else(|| PathBuf::from(".keel"))
}

/// Artifact cache root: ~/.keel/cache
pub fn cache_path() -> PathBuf {
    keel_home().join("cache")
}

/// Metadata store root: ~/.keel/metadata
pub fn metadata_path() -> PathBuf {
    keel_home().join("metadata")
}
