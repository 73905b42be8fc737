//! Command-line interface

pub mod backfill;
pub mod db;
pub mod serve;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::storage::PostgresCandleStore;

/// Candle Manager CLI
#[derive(Parser)]
#[command(name = "candle-manager")]
#[command(about = "OHLCV candle ingestion and backfill service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the full service: live stream, scheduler and backfill
    Serve(serve::ServeArgs),
    /// Gap inspection and one-shot backfill
    #[command(subcommand)]
    Backfill(backfill::BackfillCommands),
    /// Database operations
    #[command(subcommand)]
    Db(db::DbCommands),
}

/// Connect to Postgres and make sure the schema exists.
pub(crate) async fn connect_store(settings: &Settings) -> Result<Arc<PostgresCandleStore>> {
    let store = PostgresCandleStore::from_settings(&settings.database).await?;
    store.ensure_schema().await?;
    Ok(Arc::new(store))
}
