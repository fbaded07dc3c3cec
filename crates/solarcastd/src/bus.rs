//! In-process event bus
//!
//! Two typed broadcast channels: persistence changes of assets, and live
//! attribute updates. Every subscriber receives every event; filtering happens
//! on the receiving side.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::asset::Asset;

/// Default channel capacity for each event stream
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Why an asset was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceCause {
    Create,
    Update,
    Delete,
}

/// An asset was created, updated or deleted in the store.
///
/// For deletes `asset` holds the last known state.
#[derive(Debug, Clone)]
pub struct PersistenceEvent {
    pub cause: PersistenceCause,
    pub asset: Asset,
}

/// A single attribute of an asset received a new live value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeEvent {
    pub asset_id: String,
    pub name: String,
    pub value: serde_json::Value,
}

impl AttributeEvent {
    pub fn new(
        asset_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            name: name.into(),
            value: value.into(),
        }
    }
}

pub struct EventBus {
    persistence: broadcast::Sender<PersistenceEvent>,
    attributes: broadcast::Sender<AttributeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (persistence, _) = broadcast::channel(capacity);
        let (attributes, _) = broadcast::channel(capacity);
        Self {
            persistence,
            attributes,
        }
    }

    pub fn subscribe_persistence(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.persistence.subscribe()
    }

    pub fn subscribe_attributes(&self) -> broadcast::Receiver<AttributeEvent> {
        self.attributes.subscribe()
    }

    /// Publish a persistence event, returning the number of receivers reached
    pub fn publish_persistence(&self, event: PersistenceEvent) -> usize {
        trace!(asset_id = %event.asset.id, cause = ?event.cause, "publishing persistence event");
        // No receivers is not an error, nobody is interested yet
        self.persistence.send(event).unwrap_or(0)
    }

    /// Publish an attribute event, returning the number of receivers reached
    pub fn publish_attribute(&self, event: AttributeEvent) -> usize {
        trace!(asset_id = %event.asset_id, attribute = %event.name, "publishing attribute event");
        self.attributes.send(event).unwrap_or(0)
    }

    /// Total number of live subscriptions across both streams
    pub fn subscriber_count(&self) -> usize {
        self.persistence.receiver_count() + self.attributes.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
