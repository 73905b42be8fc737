//! Serve command: run the whole ingestion service

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::backfill::BackfillCoordinator;
use crate::config::Settings;
use crate::price::PriceTracker;
use crate::provider::BinanceHistoricalProvider;
use crate::scheduler::JobRunner;
use crate::stream::StreamIngestor;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Disable the live WebSocket stream (backfill and scheduler only)
    #[arg(long)]
    pub no_stream: bool,

    /// Skip the immediate backfill pass on startup
    #[arg(long)]
    pub no_initial_backfill: bool,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let settings = Settings::load()?;
    let policy = settings.interval_policy();
    let registry = settings.asset_registry();

    info!(
        assets = registry.assets().len(),
        timeframes = policy.timeframes().len(),
        "starting candle manager"
    );

    let store = super::connect_store(&settings).await?;
    let provider = Arc::new(BinanceHistoricalProvider::new(&settings.upstream)?);
    let tracker = Arc::new(PriceTracker::new(store.clone(), &policy)?);

    let coordinator = Arc::new(BackfillCoordinator::new(
        store.clone(),
        provider,
        policy.clone(),
        registry.clone(),
        settings.backfill.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let ingestor = if args.no_stream {
        None
    } else {
        let ingestor = Arc::new(StreamIngestor::new(
            store.clone(),
            tracker.clone(),
            registry.clone(),
            &policy,
            settings.upstream.ws_url.clone(),
            settings.stream.clone(),
        )?);
        let handle = ingestor.clone();
        tokio::spawn(async move { handle.run().await });
        Some(ingestor)
    };

    let runner = Arc::new(JobRunner::new(
        coordinator.clone(),
        tracker,
        store,
        registry,
        &policy,
        &settings.scheduler,
        settings.retention.clone(),
    )?);
    let runner_shutdown = shutdown_tx.subscribe();
    let runner_handle = tokio::spawn(runner.run(runner_shutdown));

    if !args.no_initial_backfill {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            info!("running startup backfill pass");
            coordinator.fill_all().await;
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    if let Some(ingestor) = &ingestor {
        ingestor.disconnect();
    }
    let _ = shutdown_tx.send(());
    if let Err(e) = runner_handle.await {
        warn!(error = %e, "job runner did not stop cleanly");
    }

    info!("candle manager stopped");
    Ok(())
}
