use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::ForecastError;
use super::ForecastProvider;
use super::SampleWriter;
use super::WriteSummary;
use crate::asset::Asset;
use crate::store::Clock;

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("Asset {0} doesn't have all needed attributes filled in")]
    IncompleteAssetData(String),

    #[error(transparent)]
    Forecast(#[from] ForecastError),
}

/// The per-tick pipeline: check attributes, fetch, write.
pub struct ForecastRunner {
    provider: Arc<dyn ForecastProvider>,
    writer: SampleWriter,
    clock: Arc<dyn Clock>,
}

impl ForecastRunner {
    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        writer: SampleWriter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            writer,
            clock,
        }
    }

    /// Run one tick for `asset`, returning what was written.
    pub async fn tick(&self, asset: &Asset) -> Result<WriteSummary, TickError> {
        let params = asset
            .forecast_params()
            .ok_or_else(|| TickError::IncompleteAssetData(asset.id.clone()))?;

        let estimate = self.provider.estimate(&params).await?;
        if let Some(rate_limit) = estimate.rate_limit {
            debug!(
                "forecast.solar rate limit: {}/{} remaining",
                rate_limit.remaining, rate_limit.limit
            );
        }

        // Captured once so every sample is compared against the same instant
        let now = self.clock.now();
        let mirror = asset.set_actual_value_with_forecast().unwrap_or(false);

        Ok(self
            .writer
            .apply(&asset.id, &estimate.watts, now, mirror)
            .await)
    }

    /// Run one tick and log the outcome. Failures never escape; the next tick
    /// runs on schedule regardless.
    pub async fn run(&self, asset: &Asset) {
        match self.tick(asset).await {
            Ok(summary) => info!(
                "Forecast updated for asset {}: {} predicted datapoints",
                asset.id, summary.predicted_written
            ),
            Err(TickError::IncompleteAssetData(id)) => {
                warn!("Asset {} doesn't have all needed attributes filled in", id)
            }
            Err(TickError::Forecast(e @ ForecastError::Provider { .. })) => {
                warn!("Forecast request failed for asset {}: {}", asset.id, e)
            }
            Err(TickError::Forecast(ForecastError::Transport(e))) => {
                error!(
                    "Exception when requesting forecast for asset {}: {:?}",
                    asset.id, e
                )
            }
            Err(TickError::Forecast(e @ ForecastError::Parse(_))) => {
                error!("Invalid forecast for asset {}: {}", asset.id, e)
            }
        }
    }
}
