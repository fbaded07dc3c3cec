use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use solarcastd::Collaborators;
use solarcastd::Config;
use solarcastd::EventBus;
use solarcastd::ForecastService;
use solarcastd::LogLevel;
use solarcastd::api;
use solarcastd::config::API_KEY_ENV;
use solarcastd::memory::InMemoryAssetStore;
use solarcastd::memory::InMemoryPredictedDatapoints;
use solarcastd::memory::LoggingRulesTrigger;
use solarcastd::store::SystemClock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Solar production forecasts from forecast.solar for every producer solar asset
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "solarcastd.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets())
        .init();

    tracing::info!("solarcastd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let forecast = config
        .forecast
        .with_api_key_fallback(std::env::var(API_KEY_ENV).ok());

    let bus = Arc::new(EventBus::new());
    tracing::info!("Seeding {} assets from config", config.assets.len());
    let assets = Arc::new(InMemoryAssetStore::with_assets(bus.clone(), config.assets));
    let predicted = Arc::new(InMemoryPredictedDatapoints::new());

    let collaborators = Collaborators {
        assets: assets.clone(),
        predicted: predicted.clone(),
        events: assets.clone(),
        rules: Arc::new(LoggingRulesTrigger::new()),
        bus,
        clock: Arc::new(SystemClock),
    };
    let service = ForecastService::from_config(&forecast, collaborators)
        .context("creating forecast.solar client")?
        .map(Arc::new);
    if let Some(service) = &service {
        service
            .start()
            .await
            .context("starting forecast service")?;
    }

    let (api_shutdown_tx, api_task) = match config.api {
        Some(api_config) => {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let state = Arc::new(api::AppState {
                version: env!("CARGO_PKG_VERSION"),
                assets,
                predicted,
                service: service.clone(),
            });
            let task = tokio::spawn(async move {
                api::serve(&api_config.listen, api_config.port, state, rx).await
            });
            (Some(tx), Some(task))
        }
        None => {
            tracing::info!("No [api] section configured, HTTP API disabled");
            (None, None)
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    if let Some(tx) = api_shutdown_tx {
        let _ = tx.send(());
    }
    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP API server failed: {}", e),
            Err(e) => tracing::error!("HTTP API task panicked: {}", e),
        }
    }

    if let Some(service) = service {
        service.shutdown().await;
    }

    tracing::info!("solarcastd stopped");
    Ok(())
}
