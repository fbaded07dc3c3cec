use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::debug;
use tracing::warn;

use super::ForecastSeries;
use crate::asset::POWER;
use crate::asset::POWER_FORECAST;
use crate::bus::AttributeEvent;
use crate::store::AttributeEventSink;
use crate::store::PredictedDatapointStore;
use crate::store::RulesTrigger;

/// Convert provider watts to the stored kW value. Production is recorded as
/// negative export.
pub fn to_kilowatts(watts: f64) -> f64 {
    -watts / 1000.0
}

/// What a single `apply` wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub predicted_written: usize,
    /// Value of the live `powerForecast` update, if one was sent
    pub forecast_emitted: Option<f64>,
    /// Value of the live `power` update, if one was sent
    pub power_emitted: Option<f64>,
}

/// Writes one forecast series into the predicted datapoint store and the live
/// attribute stream.
pub struct SampleWriter {
    predicted: Arc<dyn PredictedDatapointStore>,
    events: Arc<dyn AttributeEventSink>,
    rules: Arc<dyn RulesTrigger>,
}

impl SampleWriter {
    pub fn new(
        predicted: Arc<dyn PredictedDatapointStore>,
        events: Arc<dyn AttributeEventSink>,
        rules: Arc<dyn RulesTrigger>,
    ) -> Self {
        Self {
            predicted,
            events,
            rules,
        }
    }

    /// Write every sample as predicted `powerForecast` and `power`, and send the
    /// first sample after `now` as the live `powerForecast` (and `power` when
    /// `mirror_to_actual`). Rules are notified once at the end.
    pub async fn apply(
        &self,
        asset_id: &str,
        series: &ForecastSeries,
        now: NaiveDateTime,
        mirror_to_actual: bool,
    ) -> WriteSummary {
        let mut summary = WriteSummary::default();
        let mut forecast_armed = true;
        let mut actual_armed = mirror_to_actual;

        for (timestamp, watts) in series {
            let value = to_kilowatts(*watts);

            for attribute in [POWER_FORECAST, POWER] {
                match self
                    .predicted
                    .update_value(asset_id, attribute, value, *timestamp)
                    .await
                {
                    Ok(()) => summary.predicted_written += 1,
                    Err(e) => warn!(
                        "Failed to store predicted {} for asset {} at {}: {}",
                        attribute, asset_id, timestamp, e
                    ),
                }
            }

            if forecast_armed && *timestamp > now {
                forecast_armed = false;
                self.send_live(asset_id, POWER_FORECAST, value).await;
                summary.forecast_emitted = Some(value);

                if actual_armed {
                    actual_armed = false;
                    self.send_live(asset_id, POWER, value).await;
                    summary.power_emitted = Some(value);
                }
            }
        }

        self.rules.fire_with_predicted_data(asset_id).await;

        debug!(
            "Applied {} forecast samples to asset {}: {:?}",
            series.len(),
            asset_id,
            summary
        );
        summary
    }

    async fn send_live(&self, asset_id: &str, attribute: &str, value: f64) {
        let event = AttributeEvent::new(asset_id, attribute, value);
        if let Err(e) = self.events.send_attribute_event(event).await {
            warn!(
                "Failed to send live {} for asset {}: {}",
                attribute, asset_id, e
            );
        }
    }
}
