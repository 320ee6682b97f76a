//! Shared resolution context.
//!
//! Groups what every resolving command needs: the parsed manifest, the policy
//! built from it and an engine wired to the on-disk stores.

use anyhow::{Context, Result, bail};
use keel_core::manifest::{LOCK_FILE, Lockfile, Manifest};
use keel_core::transport::{HttpTransport, Transport};
use keel_core::{ArtifactCache, Engine, FsMetadataStore, PolicyConfig, Reporter, ResolutionResult};
use keel_schema::DependencyRequirement;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ResolveArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to run one resolution from a manifest.
pub struct Session {
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
    pub roots: Vec<DependencyRequirement>,
    pub policy: PolicyConfig,
    pub engine: Engine,
    locked: Option<Lockfile>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("manifest_path", &self.manifest_path)
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Load the manifest named by `args` and wire an engine around it.
    pub async fn open(
        args: &ResolveArgs,
        cache_root: &Path,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        let manifest = Manifest::load(&args.manifest).await?;
        let roots = manifest.requirements()?;

        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(CONNECT_TIMEOUT, READ_TIMEOUT)
                .context("Failed to build HTTP client")?,
        );
        let mut policy = manifest.policy(&transport)?;
        policy.offline = args.offline;
        policy.refresh = args.refresh;
        if policy.repositories.is_empty() && !roots.is_empty() {
            bail!(
                "{} declares dependencies but no [[repositories]]",
                args.manifest.display()
            );
        }

        let locked = if args.locked {
            let lockfile = Lockfile::load(&lock_path(&args.manifest)).await?;
            if lockfile.is_empty() {
                bail!("--locked given but {} has no entries", LOCK_FILE);
            }
            for (coordinate, version) in lockfile.pins()? {
                policy.strict_pins.entry(coordinate).or_insert(version);
            }
            Some(lockfile)
        } else {
            None
        };

        let store = Arc::new(FsMetadataStore::new(keel_core::metadata_path()));
        let cache = ArtifactCache::new(cache_root);
        let engine = Engine::new(store, cache).with_reporter(reporter);
        tracing::debug!(
            manifest = %args.manifest.display(),
            cache = %cache_root.display(),
            roots = roots.len(),
            "Session opened"
        );

        Ok(Self {
            manifest_path: args.manifest.clone(),
            manifest,
            roots,
            policy,
            engine,
            locked,
        })
    }

    /// Run the resolution, enforcing the lockfile when `--locked` was given.
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<ResolutionResult> {
        let result = self.engine.resolve(&self.roots, &self.policy, cancel).await?;
        if let Some(lockfile) = &self.locked {
            let drift = lockfile.drift(&result);
            if !drift.is_empty() {
                bail!(
                    "Resolution no longer matches {}:\n  {}",
                    LOCK_FILE,
                    drift.join("\n  ")
                );
            }
        }
        Ok(result)
    }

    /// Where the lockfile for this manifest lives.
    pub fn lock_path(&self) -> PathBuf {
        lock_path(&self.manifest_path)
    }
}

fn lock_path(manifest: &Path) -> PathBuf {
    manifest
        .parent()
        .map_or_else(|| PathBuf::from(LOCK_FILE), |dir| dir.join(LOCK_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfile_sits_next_to_manifest() {
        assert_eq!(
            lock_path(Path::new("proj/keel.toml")),
            PathBuf::from("proj/keel.lock")
        );
        assert_eq!(lock_path(Path::new("keel.toml")), PathBuf::from("keel.lock"));
    }
}
