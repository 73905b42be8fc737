//! Backfill CLI commands
//!
//! One-shot variants of what the scheduler runs periodically:
//! - `gaps` - scan and print missing ranges without fetching
//! - `fill` - repair one asset or every configured pair

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use tracing::info;

use crate::backfill::BackfillCoordinator;
use crate::config::Settings;
use crate::gaps::GapDetector;
use crate::provider::BinanceHistoricalProvider;

#[derive(Subcommand)]
pub enum BackfillCommands {
    /// Detect and print gaps without filling them
    Gaps(GapsArgs),
    /// Fill gaps for one asset, or for everything
    Fill(FillArgs),
}

#[derive(Args)]
pub struct GapsArgs {
    /// Asset name (e.g. BTC); all configured assets when omitted
    #[arg(long, short)]
    pub asset: Option<String>,
}

#[derive(Args)]
pub struct FillArgs {
    /// Asset name (e.g. BTC); all configured assets when omitted
    #[arg(long, short)]
    pub asset: Option<String>,
}

pub async fn execute(command: BackfillCommands) -> Result<()> {
    match command {
        BackfillCommands::Gaps(args) => gaps(args).await,
        BackfillCommands::Fill(args) => fill(args).await,
    }
}

async fn gaps(args: GapsArgs) -> Result<()> {
    let settings = Settings::load()?;
    let policy = settings.interval_policy();
    let registry = settings.asset_registry();
    let store = super::connect_store(&settings).await?;
    let detector = GapDetector::new(policy.clone());

    let assets: Vec<_> = match &args.asset {
        Some(name) => match registry.get(name) {
            Some(asset) => vec![asset.clone()],
            None => bail!("unknown asset: {}", name),
        },
        None => registry.assets().to_vec(),
    };

    for asset in &assets {
        for timeframe in policy.timeframes() {
            let gaps = detector.scan(store.as_ref(), &asset.name, timeframe).await?;
            if gaps.is_empty() {
                println!("{} {}: complete", asset.name, timeframe);
                continue;
            }
            for gap in gaps {
                println!(
                    "{} {}: {} .. {} ({} intervals missing)",
                    asset.name, timeframe, gap.start, gap.end, gap.missing_intervals
                );
            }
        }
    }
    Ok(())
}

async fn fill(args: FillArgs) -> Result<()> {
    let settings = Settings::load()?;
    let policy = settings.interval_policy();
    let registry = settings.asset_registry();
    let store = super::connect_store(&settings).await?;
    let provider = Arc::new(BinanceHistoricalProvider::new(&settings.upstream)?);

    let coordinator = Arc::new(BackfillCoordinator::new(
        store,
        provider,
        policy,
        registry.clone(),
        settings.backfill.clone(),
    ));

    match &args.asset {
        Some(name) => {
            let Some(asset) = registry.get(name) else {
                bail!("unknown asset: {}", name);
            };
            let report = coordinator.fill_asset(asset).await?;
            info!(asset = %report.asset, filled = report.candles_filled(), "fill complete");
            for pair in &report.pairs {
                println!(
                    "{} {}: {} gaps, {} candles filled",
                    pair.asset, pair.timeframe, pair.gaps_found, pair.candles_filled
                );
                for error in &pair.errors {
                    println!("  error: {}", error);
                }
            }
        }
        None => {
            let reports = coordinator.fill_all().await;
            for pair in &reports {
                println!(
                    "{} {}: {} gaps, {} candles filled",
                    pair.asset, pair.timeframe, pair.gaps_found, pair.candles_filled
                );
            }
        }
    }
    Ok(())
}
