//! `serve` command: periodic maintenance until interrupted.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::{error, info};

use super::{Context, maintenance};

/// Arguments for `serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Seconds between maintenance cycles.
    #[arg(long, env = "LAKELOG_WORKER_INTERVAL_SECS", default_value = "60")]
    pub interval_secs: u64,
}

/// Runs snapshot, prune and GC passes every interval until Ctrl-C.
///
/// A failed cycle is logged and the loop continues.
///
/// # Errors
///
/// Returns an error only if the shutdown signal cannot be installed.
pub async fn execute(ctx: &mut Context, args: &ServeArgs) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    info!(interval_secs = args.interval_secs, "starting maintenance loop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("shutdown requested, stopping maintenance loop");
                return Ok(());
            }
            _ = interval.tick() => {
                run_cycle(ctx).await;
            }
        }
    }
}

/// Runs one maintenance cycle, logging rather than returning failures.
pub async fn run_cycle(ctx: &mut Context) {
    ctx.cache().evict_expired();
    info!("starting maintenance cycle");
    if let Err(e) = maintenance::snapshot(ctx).await {
        error!(error = %e, "snapshot pass failed");
    }
    if let Err(e) = maintenance::prune_snapshots(ctx).await {
        error!(error = %e, "prune pass failed");
    }
    if let Err(e) = maintenance::gc(ctx).await {
        error!(error = %e, "gc pass failed");
    }
}
