//! Cache maintenance commands

use anyhow::{Result, bail};
use keel_core::ArtifactCache;
use std::path::Path;
use std::time::Duration;

/// Print the cache directory
pub fn path(cache_root: &Path) {
    println!("{}", cache_root.display());
}

/// Re-hash every cached artifact and report anything that no longer matches
pub async fn verify(cache_root: &Path) -> Result<()> {
    let cache = ArtifactCache::new(cache_root);
    let report = cache.verify_all().await?;

    for path in &report.corrupt {
        println!("corrupt     {}", path.display());
    }
    for path in &report.incomplete {
        println!("incomplete  {}", path.display());
    }
    println!(
        "{} artifacts checked, {} corrupt, {} incomplete",
        report.checked,
        report.corrupt.len(),
        report.incomplete.len()
    );

    if !report.corrupt.is_empty() {
        bail!("Cache contains corrupt artifacts");
    }
    Ok(())
}

/// Remove abandoned downloads and stale locks
pub async fn clean(cache_root: &Path, max_age_hours: u64) -> Result<()> {
    let cache = ArtifactCache::new(cache_root);
    let report = cache
        .clean(Duration::from_secs(max_age_hours.saturating_mul(3600)))
        .await?;
    println!(
        "Removed {} temporary files and {} stale locks",
        report.temp_files, report.locks
    );
    Ok(())
}
