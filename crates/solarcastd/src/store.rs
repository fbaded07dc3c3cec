//! Collaborator interfaces
//!
//! The forecasting core only talks to storage, the live event stream, the rule
//! engine and the clock through these traits. `crate::memory` provides the
//! in-process implementations used by the daemon.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::asset::Asset;
use crate::asset::AssetType;
use crate::bus::AttributeEvent;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Asset not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Query access to persisted assets
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// All assets of the given type
    async fn find_all(&self, asset_type: AssetType) -> StoreResult<Vec<Asset>>;

    /// Latest stored state of a single asset
    async fn find(&self, asset_id: &str) -> StoreResult<Option<Asset>>;
}

/// Time series of predicted attribute values
#[async_trait]
pub trait PredictedDatapointStore: Send + Sync {
    /// Insert or overwrite the predicted value of `attribute` at `timestamp`
    async fn update_value(
        &self,
        asset_id: &str,
        attribute: &str,
        value: f64,
        timestamp: NaiveDateTime,
    ) -> StoreResult<()>;
}

/// Sink for live attribute values
#[async_trait]
pub trait AttributeEventSink: Send + Sync {
    async fn send_attribute_event(&self, event: AttributeEvent) -> StoreResult<()>;
}

/// Rule engine hook
#[async_trait]
pub trait RulesTrigger: Send + Sync {
    /// Tell rule deployments that new predicted data exists for an asset
    async fn fire_with_predicted_data(&self, asset_id: &str);
}

/// Source of the local wall-clock time forecast timestamps are compared against
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Clock pinned to a fixed instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
