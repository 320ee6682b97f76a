//! Resolve command

use anyhow::{Context, Result};
use keel_core::manifest::Lockfile;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ResolveArgs;
use crate::cmd::context::Session;
use crate::ui::{ConsoleReporter, result_table};

/// Resolve the manifest and print the result
pub async fn resolve(
    args: &ResolveArgs,
    cache_root: &Path,
    quiet: bool,
    write_lock: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let reporter = Arc::new(ConsoleReporter::new(quiet || json));
    let session = Session::open(args, cache_root, reporter).await?;
    let result = session.resolve(cancel).await?;

    if json {
        let out = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        println!("{out}");
    } else if !result.is_empty() {
        println!("{}", result_table(&result));
    }

    if write_lock {
        let path = session.lock_path();
        Lockfile::from_result(&result).save(&path).await?;
        if !quiet && !json {
            eprintln!("Wrote {}", path.display());
        }
    }
    Ok(())
}
