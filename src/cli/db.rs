//! Database CLI commands

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Args, Subcommand};

use crate::config::Settings;
use crate::storage::CandleStore;

#[derive(Subcommand)]
pub enum DbCommands {
    /// Create tables if they do not exist
    Migrate,
    /// Per-series row counts and coverage
    Stats,
    /// Delete finest-timeframe rows older than the retention window
    Cleanup(CleanupArgs),
    /// Show tracked prices
    Prices,
}

#[derive(Args)]
pub struct CleanupArgs {
    /// Override the configured retention window
    #[arg(long)]
    pub days: Option<u32>,
}

pub async fn execute(command: DbCommands) -> Result<()> {
    let settings = Settings::load()?;
    let store = super::connect_store(&settings).await?;

    match command {
        DbCommands::Migrate => {
            // connect_store already ran the schema setup
            println!("schema up to date");
        }
        DbCommands::Stats => {
            let stats = store.stats().await?;
            if stats.is_empty() {
                println!("no candles stored");
            }
            for s in stats {
                let oldest = s.oldest_open_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
                let newest = s.newest_open_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
                println!("{} {}: {} rows, {} .. {}", s.asset, s.timeframe, s.count, oldest, newest);
            }
        }
        DbCommands::Cleanup(args) => {
            let days = args.days.unwrap_or(settings.retention.days);
            let finest = match settings.interval_policy().finest() {
                Ok(tf) => tf,
                Err(e) => bail!("no timeframes configured: {}", e),
            };
            let cutoff = Utc::now() - Duration::days(days as i64);
            let deleted = store.delete_older_than(finest, cutoff).await?;
            println!("deleted {} rows of {} before {}", deleted, finest, cutoff);
        }
        DbCommands::Prices => {
            let prices = store.get_all_prices().await?;
            if prices.is_empty() {
                println!("no prices tracked");
            }
            for p in prices {
                println!("{}: {} ({:+}% / 24h) at {}", p.asset, p.price, p.change_24h, p.updated_at);
            }
        }
    }
    Ok(())
}
