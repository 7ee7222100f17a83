//! Lakelog worker - maintenance entry point.

#![allow(clippy::print_stdout)]

use anyhow::Result;
use clap::Parser;

use lakelog_worker::commands::{self, Context};
use lakelog_worker::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    lakelog_core::init_logging(cli.log_format);
    lakelog_statestore::metrics::register_metrics();
    lakelog_compaction::metrics::register_metrics();
    lakelog_gc::metrics::register_metrics();

    let mut ctx = Context::open(&cli.data_dir, cli.table_ids()?).await?;

    match cli.command {
        Commands::CreateTable(args) => commands::create_table::execute(&mut ctx, &args).await,
        Commands::Snapshot => commands::maintenance::snapshot(&mut ctx).await.map(drop),
        Commands::PruneSnapshots => commands::maintenance::prune_snapshots(&mut ctx).await.map(drop),
        Commands::Gc => commands::maintenance::gc(&mut ctx).await.map(drop),
        Commands::CreateJobs => {
            for job in commands::maintenance::create_jobs(&mut ctx).await? {
                println!("{}", serde_json::to_string(&job)?);
            }
            Ok(())
        }
        Commands::Commit(args) => commands::commit::execute(&mut ctx, &args).await,
        Commands::Serve(args) => commands::serve::execute(&mut ctx, &args).await,
    }
}
