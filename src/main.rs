//! Candle Manager CLI
//!
//! Commands:
//! - `serve`: run the ingestion service (stream + scheduler + backfill)
//! - `backfill`: gap inspection and one-shot fills
//! - `db`: schema setup, stats, retention cleanup

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use candle_manager::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("candle_manager=info".parse()?))
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            candle_manager::cli::serve::execute(args).await?;
        }
        Commands::Backfill(cmd) => {
            candle_manager::cli::backfill::execute(cmd).await?;
        }
        Commands::Db(cmd) => {
            candle_manager::cli::db::execute(cmd).await?;
        }
    }

    Ok(())
}
