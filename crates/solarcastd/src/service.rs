//! Forecast service
//!
//! Keeps one forecasting task per eligible producer solar asset. Reacts to asset
//! persistence changes and live attribute changes by stopping and (re)starting
//! tasks through the `TaskManager`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::asset::Asset;
use crate::asset::AssetType;
use crate::asset::INCLUDE_FORECAST_SOLAR_SERVICE;
use crate::asset::POWER;
use crate::asset::POWER_FORECAST;
use crate::bus::AttributeEvent;
use crate::bus::EventBus;
use crate::bus::PersistenceCause;
use crate::bus::PersistenceEvent;
use crate::config::ForecastConfig;
use crate::forecast::ForecastError;
use crate::forecast::ForecastProvider;
use crate::forecast::ForecastRunner;
use crate::forecast::ForecastSolarClient;
use crate::forecast::SampleWriter;
use crate::store::AssetStore;
use crate::store::AttributeEventSink;
use crate::store::Clock;
use crate::store::PredictedDatapointStore;
use crate::store::RulesTrigger;
use crate::store::StoreResult;
use crate::tasks::FORECAST_PERIOD;
use crate::tasks::TaskManager;

/// Everything the service consumes from the rest of the system
#[derive(Clone)]
pub struct Collaborators {
    pub assets: Arc<dyn AssetStore>,
    pub predicted: Arc<dyn PredictedDatapointStore>,
    pub events: Arc<dyn AttributeEventSink>,
    pub rules: Arc<dyn RulesTrigger>,
    pub bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

/// State shared between the service handle and its event listeners
struct Inner {
    assets: Arc<dyn AssetStore>,
    manager: TaskManager,
    /// Serializes stop/re-read/start sequences across both event streams
    transition: tokio::sync::Mutex<()>,
}

pub struct ForecastService {
    inner: Arc<Inner>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ForecastService {
    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        collaborators: Collaborators,
        period: Duration,
    ) -> Self {
        let writer = SampleWriter::new(
            collaborators.predicted,
            collaborators.events,
            collaborators.rules,
        );
        let runner = ForecastRunner::new(provider, writer, collaborators.clock);

        Self {
            inner: Arc::new(Inner {
                assets: collaborators.assets,
                manager: TaskManager::new(Arc::new(runner), period),
                transition: tokio::sync::Mutex::new(()),
            }),
            bus: collaborators.bus,
            shutdown: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Build the service against forecast.solar.
    ///
    /// Returns `Ok(None)` when no API key is configured; the subsystem then
    /// stays off entirely.
    pub fn from_config(
        config: &ForecastConfig,
        collaborators: Collaborators,
    ) -> Result<Option<Self>, ForecastError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        let Some(api_key) = api_key else {
            info!("No forecast.solar API key configured, forecast service won't start");
            return Ok(None);
        };

        let client = ForecastSolarClient::new(&config.base_url, api_key)?;
        Ok(Some(Self::new(
            Arc::new(client),
            collaborators,
            FORECAST_PERIOD,
        )))
    }

    /// Subscribe to asset changes and start a task for every eligible producer
    /// solar asset. Returns the number of tasks started.
    pub async fn start(&self) -> StoreResult<usize> {
        // Subscribe before loading so no change between the two is missed
        let persistence_rx = self.bus.subscribe_persistence();
        let attribute_rx = self.bus.subscribe_attributes();

        debug!("Loading producer solar assets...");
        let included: Vec<_> = self
            .inner
            .assets
            .find_all(AssetType::ElectricityProducerSolar)
            .await?
            .into_iter()
            .filter(|a| a.gateway_id.is_none())
            .filter(|a| a.include_forecast_solar_service().unwrap_or(false))
            .collect();
        debug!("Found included producer solar asset count = {}", included.len());

        let mut started = 0;
        {
            let _transition = self.inner.transition.lock().await;
            for asset in included {
                if asset.is_forecast_eligible() {
                    self.inner.manager.start(asset);
                    started += 1;
                } else {
                    warn!(
                        "Asset {} doesn't have all needed attributes filled in",
                        asset.id
                    );
                }
            }
        }

        let persistence_task = tokio::spawn(listen_persistence(
            self.inner.clone(),
            persistence_rx,
            self.shutdown.clone(),
        ));
        let attribute_task = tokio::spawn(listen_attributes(
            self.inner.clone(),
            attribute_rx,
            self.shutdown.clone(),
        ));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([persistence_task, attribute_task]);

        info!("Forecast service started with {} active assets", started);
        Ok(started)
    }

    pub async fn handle_persistence_event(&self, event: PersistenceEvent) {
        self.inner.on_persistence_event(event).await
    }

    pub async fn handle_attribute_event(&self, event: AttributeEvent) {
        self.inner.on_attribute_event(event).await
    }

    pub fn is_active(&self, asset_id: &str) -> bool {
        self.inner.manager.is_active(asset_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.inner.manager.active_ids()
    }

    /// Generation of the running task, changes whenever the task is restarted
    pub fn generation(&self, asset_id: &str) -> Option<u64> {
        self.inner.manager.generation(asset_id)
    }

    /// Stop listening for changes and stop every task
    pub async fn shutdown(&self) {
        info!("Forecast service shutting down");
        self.shutdown.cancel();

        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for listener in listeners {
            if let Err(e) = listener.await {
                warn!("Forecast event listener ended abnormally: {}", e);
            }
        }

        let _transition = self.inner.transition.lock().await;
        self.inner.manager.shutdown().await;
    }
}

impl Inner {
    async fn on_persistence_event(&self, event: PersistenceEvent) {
        let asset = event.asset;
        if !asset.is_solar() {
            return;
        }
        if asset.gateway_id.is_some() {
            debug!("Ignoring change of gateway owned asset {}", asset.id);
            return;
        }

        info!(
            "Processing producer solar asset change: {} ({:?})",
            asset.id, event.cause
        );
        let _transition = self.transition.lock().await;
        self.manager.stop(&asset.id);

        if event.cause != PersistenceCause::Delete && asset.is_forecast_eligible() {
            self.manager.start(asset);
        }
    }

    /// Bring the registry back in line with storage after events were lost.
    /// Tasks whose asset is gone or ineligible are stopped; eligible assets
    /// without a task, or whose task runs on outdated inputs, are (re)started.
    async fn reconcile(&self) {
        let _transition = self.transition.lock().await;

        let stored = match self
            .assets
            .find_all(AssetType::ElectricityProducerSolar)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to load producer solar assets to reconcile: {}", e);
                return;
            }
        };
        let eligible: HashMap<String, Asset> = stored
            .into_iter()
            .filter(|a| a.gateway_id.is_none() && a.is_forecast_eligible())
            .map(|a| (a.id.clone(), a))
            .collect();

        for asset_id in self.manager.active_ids() {
            if !eligible.contains_key(&asset_id) {
                info!("Stopping forecast task of asset {} after reconcile", asset_id);
                self.manager.stop(&asset_id);
            }
        }

        for (asset_id, asset) in eligible {
            let current = self.manager.snapshot(&asset_id);
            if !current.is_some_and(|c| same_forecast_inputs(&c, &asset)) {
                info!("Starting forecast task of asset {} after reconcile", asset_id);
                self.manager.start(asset);
            }
        }
    }

    async fn on_attribute_event(&self, event: AttributeEvent) {
        // Only assets that are currently forecasting are of interest
        if !self.manager.is_active(&event.asset_id) {
            return;
        }

        // Written by the forecast itself
        if event.name == POWER || event.name == POWER_FORECAST {
            return;
        }

        let _transition = self.transition.lock().await;
        let active = self.manager.is_active(&event.asset_id);
        if !active {
            return;
        }

        if event.name == INCLUDE_FORECAST_SOLAR_SERVICE {
            let enabled = event.value.as_bool().unwrap_or(false);
            if enabled == active {
                return;
            }
        }

        info!(
            "Processing producer solar asset attribute event: {} {} = {}",
            event.asset_id, event.name, event.value
        );
        self.manager.stop(&event.asset_id);

        // Latest state from storage
        match self.assets.find(&event.asset_id).await {
            Ok(Some(asset)) if asset.is_forecast_eligible() => self.manager.start(asset),
            Ok(Some(_)) => debug!(
                "Asset {} is no longer eligible for forecasting",
                event.asset_id
            ),
            Ok(None) => debug!("Asset {} no longer exists", event.asset_id),
            Err(e) => warn!("Failed to reload asset {}: {}", event.asset_id, e),
        }
    }
}

/// Equal apart from the values the forecast writes itself
fn same_forecast_inputs(a: &Asset, b: &Asset) -> bool {
    let inputs = |asset: &Asset| {
        let mut attributes = asset.attributes.clone();
        attributes.remove(POWER);
        attributes.remove(POWER_FORECAST);
        (asset.name.clone(), asset.gateway_id.clone(), attributes)
    };
    inputs(a) == inputs(b)
}

async fn listen_persistence(
    inner: Arc<Inner>,
    mut rx: broadcast::Receiver<PersistenceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = rx.recv() => received,
        };
        match received {
            Ok(event) => inner.on_persistence_event(event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Persistence listener lagged, skipped {} events", skipped);
                inner.reconcile().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Persistence listener stopped");
}

async fn listen_attributes(
    inner: Arc<Inner>,
    mut rx: broadcast::Receiver<AttributeEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = rx.recv() => received,
        };
        match received {
            Ok(event) => inner.on_attribute_event(event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Attribute listener lagged, skipped {} events", skipped);
                inner.reconcile().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Attribute listener stopped");
}
