//! `commit` command.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use lakelog_compaction::{CommitterConfig, CompactionJobCommitter, MessageOutcome};
use lakelog_core::EnvSource;

use super::Context;

/// Arguments for `commit`.
#[derive(Debug, Args)]
pub struct CommitArgs {
    /// JSON commit request file.
    #[arg(long)]
    pub request: PathBuf,
}

/// Commits one finished compaction job described by a JSON request file.
///
/// Prints the message outcome (`Ack`, `Retry` or `DeadLetter`).
///
/// # Errors
///
/// Returns an error if the file cannot be read or the outcome is not `Ack`.
pub async fn execute(ctx: &mut Context, args: &CommitArgs) -> Result<()> {
    let body = tokio::fs::read(&args.request)
        .await
        .with_context(|| format!("reading {}", args.request.display()))?;
    let committer = CompactionJobCommitter::new(CommitterConfig::from_source(&EnvSource)?);
    let outcome = committer.handle_commit_message(ctx.cache(), &body).await;
    println!("{outcome:?}");
    if outcome != MessageOutcome::Ack {
        bail!("commit request {} not applied: {outcome:?}", args.request.display());
    }
    Ok(())
}
