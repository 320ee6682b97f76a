//! keel - dependency resolution CLI

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use keel_cli::cmd;
use keel_cli::{CacheCommands, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so --json output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let cache_root = cli.cache_root();
    match cli.command {
        Commands::Resolve {
            args,
            write_lock,
            json,
        } => cmd::resolve::resolve(&args, &cache_root, cli.quiet, write_lock, json, &cancel).await,
        Commands::Why { coordinate, args } => {
            cmd::why::why(&coordinate, &args, &cache_root, &cancel).await
        }
        Commands::Cache { command } => match command {
            CacheCommands::Path => {
                cmd::cache::path(&cache_root);
                Ok(())
            }
            CacheCommands::Verify => cmd::cache::verify(&cache_root).await,
            CacheCommands::Clean { max_age_hours } => {
                cmd::cache::clean(&cache_root, max_age_hours).await
            }
        },
        Commands::Completions { shell } => {
            cmd::completions::completions(shell);
            Ok(())
        }
    }
}
