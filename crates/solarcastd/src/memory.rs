//! In-memory collaborators
//!
//! Backing stores for the daemon: assets seeded from config and edited over the
//! HTTP API, predicted datapoints kept per asset attribute, and a rules trigger
//! that only logs.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::debug;
use tracing::info;

use crate::asset::Asset;
use crate::asset::AssetType;
use crate::bus::AttributeEvent;
use crate::bus::EventBus;
use crate::bus::PersistenceCause;
use crate::bus::PersistenceEvent;
use crate::store::AssetStore;
use crate::store::AttributeEventSink;
use crate::store::PredictedDatapointStore;
use crate::store::RulesTrigger;
use crate::store::StoreError;
use crate::store::StoreResult;

/// Asset store that announces every change on the event bus.
pub struct InMemoryAssetStore {
    assets: RwLock<BTreeMap<String, Asset>>,
    bus: Arc<EventBus>,
}

impl InMemoryAssetStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_assets(bus, Vec::new())
    }

    /// Create a store pre-populated with `assets`. No events are published
    /// for the initial contents.
    pub fn with_assets(bus: Arc<EventBus>, assets: impl IntoIterator<Item = Asset>) -> Self {
        let assets = assets.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            assets: RwLock::new(assets),
            bus,
        }
    }

    /// Insert or replace an asset and publish the matching persistence event
    pub fn upsert(&self, asset: Asset) -> PersistenceCause {
        let cause = {
            let mut assets = self.assets.write().unwrap_or_else(PoisonError::into_inner);
            match assets.insert(asset.id.clone(), asset.clone()) {
                Some(_) => PersistenceCause::Update,
                None => PersistenceCause::Create,
            }
        };
        debug!("Asset {} persisted ({:?})", asset.id, cause);
        self.bus.publish_persistence(PersistenceEvent { cause, asset });
        cause
    }

    /// Remove an asset and publish a delete event
    pub fn delete(&self, asset_id: &str) -> StoreResult<Asset> {
        let removed = self
            .assets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(asset_id)
            .ok_or_else(|| StoreError::NotFound(asset_id.to_string()))?;
        debug!("Asset {} deleted", asset_id);
        self.bus.publish_persistence(PersistenceEvent {
            cause: PersistenceCause::Delete,
            asset: removed.clone(),
        });
        Ok(removed)
    }

    pub fn get(&self, asset_id: &str) -> Option<Asset> {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(asset_id)
            .cloned()
    }

    /// All assets, ordered by id
    pub fn all(&self) -> Vec<Asset> {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn find_all(&self, asset_type: AssetType) -> StoreResult<Vec<Asset>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|a| a.asset_type == asset_type)
            .collect())
    }

    async fn find(&self, asset_id: &str) -> StoreResult<Option<Asset>> {
        Ok(self.get(asset_id))
    }
}

#[async_trait]
impl AttributeEventSink for InMemoryAssetStore {
    /// Apply the new value to the stored asset, then announce it
    async fn send_attribute_event(&self, event: AttributeEvent) -> StoreResult<()> {
        {
            let mut assets = self.assets.write().unwrap_or_else(PoisonError::into_inner);
            let asset = assets
                .get_mut(&event.asset_id)
                .ok_or_else(|| StoreError::NotFound(event.asset_id.clone()))?;
            asset.set_attribute(&event.name, event.value.clone());
        }
        self.bus.publish_attribute(event);
        Ok(())
    }
}

type SeriesKey = (String, String);

/// Predicted values per (asset, attribute), ordered by timestamp
#[derive(Default)]
pub struct InMemoryPredictedDatapoints {
    series: RwLock<HashMap<SeriesKey, BTreeMap<NaiveDateTime, f64>>>,
}

impl InMemoryPredictedDatapoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicted datapoints for one attribute in chronological order
    pub fn values(&self, asset_id: &str, attribute: &str) -> Vec<(NaiveDateTime, f64)> {
        let key = (asset_id.to_string(), attribute.to_string());
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|s| s.iter().map(|(t, v)| (*t, *v)).collect())
            .unwrap_or_default()
    }

    /// Total number of stored datapoints
    pub fn len(&self) -> usize {
        self.series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PredictedDatapointStore for InMemoryPredictedDatapoints {
    async fn update_value(
        &self,
        asset_id: &str,
        attribute: &str,
        value: f64,
        timestamp: NaiveDateTime,
    ) -> StoreResult<()> {
        self.series
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((asset_id.to_string(), attribute.to_string()))
            .or_default()
            .insert(timestamp, value);
        Ok(())
    }
}

/// Rules trigger without a rule engine behind it
#[derive(Debug, Default)]
pub struct LoggingRulesTrigger {
    fired: AtomicU64,
}

impl LoggingRulesTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications received so far
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RulesTrigger for LoggingRulesTrigger {
    async fn fire_with_predicted_data(&self, asset_id: &str) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        info!("New predicted data available for asset {}", asset_id);
    }
}
