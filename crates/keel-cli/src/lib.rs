//! keel - dependency resolution for module repositories
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Reads a project's `keel.toml`, resolves its dependencies against the
//! configured repositories and leaves verified artifacts in the shared cache.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.keel/
//! ├── metadata/   # Cached version listings and descriptors
//! └── cache/
//!     ├── modules/  # Verified artifacts with .digest records
//!     ├── locks/    # Per-artifact writer locks
//!     └── tmp/      # In-flight downloads
//! ```

pub mod cmd;
pub mod ui;

pub use keel_core::USER_AGENT;
pub use keel_core::paths::*;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(author, version, about = "keel - resolve, fetch and verify module dependencies")]
pub struct Cli {
    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Artifact cache directory (defaults to ~/.keel/cache)
    #[arg(long, global = true, env = "KEEL_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by commands that run a resolution.
#[derive(Debug, Clone, Args)]
pub struct ResolveArgs {
    /// Path to the project manifest
    #[arg(long, short = 'm', default_value = "keel.toml")]
    pub manifest: PathBuf,

    /// Use only cached metadata and artifacts
    #[arg(long, conflicts_with = "refresh")]
    pub offline: bool,

    /// Ignore cached metadata and fetch it again
    #[arg(long)]
    pub refresh: bool,

    /// Pin every module to its keel.lock version and fail if anything drifts
    #[arg(long)]
    pub locked: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve the manifest's dependencies and fetch their artifacts
    Resolve {
        #[command(flatten)]
        args: ResolveArgs,

        /// Write keel.lock next to the manifest
        #[arg(long, conflicts_with = "locked")]
        write_lock: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Explain why a module is in the resolution
    Why {
        /// Module coordinate (group:name)
        coordinate: String,

        #[command(flatten)]
        args: ResolveArgs,
    },
    /// Inspect and maintain the artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheCommands {
    /// Print the cache directory
    Path,
    /// Re-hash every cached artifact against its record
    Verify,
    /// Remove abandoned temporary files and stale locks
    Clean {
        /// Only remove temporary files older than this many hours
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
}

impl Cli {
    /// The cache directory in effect.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(cache_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_resolve_flags() {
        let cli = Cli::parse_from(["keel", "resolve", "--manifest", "x/keel.toml", "--offline", "--json"]);
        match cli.command {
            Commands::Resolve { args, json, write_lock } => {
                assert_eq!(args.manifest, PathBuf::from("x/keel.toml"));
                assert!(args.offline);
                assert!(json);
                assert!(!write_lock);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn locked_and_write_lock_conflict() {
        let parsed = Cli::try_parse_from(["keel", "resolve", "--locked", "--write-lock"]);
        assert!(parsed.is_err());
    }
}
