//! Asset model for solarcastd
//!
//! Assets are handed out by the asset store as a bag of JSON attributes. `Asset`
//! layers typed accessors over the attributes the solar forecast needs.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// GeoJSON point, `{"type": "Point", "coordinates": [lon, lat]}`
pub const LOCATION: &str = "location";
pub const PANEL_PITCH: &str = "panelPitch";
pub const PANEL_AZIMUTH: &str = "panelAzimuth";
/// Maximum export power in kW
pub const POWER_EXPORT_MAX: &str = "powerExportMax";
pub const INCLUDE_FORECAST_SOLAR_SERVICE: &str = "includeForecastSolarService";
pub const SET_ACTUAL_VALUE_WITH_FORECAST: &str = "setActualValueWithForecast";
/// Live power in kW, negative while producing
pub const POWER: &str = "power";
pub const POWER_FORECAST: &str = "powerForecast";

/// Kind of asset as reported by the asset store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    ElectricityProducerSolar,
    ElectricityConsumer,
    ElectricityBattery,
    #[serde(other)]
    Other,
}

/// An asset and its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub asset_type: AssetType,

    /// Set when the asset is mirrored from a gateway. Such assets are owned by
    /// the gateway and never forecast locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Everything forecast.solar needs to estimate a single panel array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastParams {
    pub latitude: f64,
    pub longitude: f64,
    /// Panel tilt in degrees (0 = horizontal)
    pub pitch: i64,
    /// Panel azimuth in degrees (0 = south)
    pub azimuth: i64,
    /// Installed peak power in kW
    pub kwp: f64,
}

impl Asset {
    pub fn new(id: impl Into<String>, name: impl Into<String>, asset_type: AssetType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            asset_type,
            gateway_id: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Create an empty producer solar asset
    pub fn solar(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, AssetType::ElectricityProducerSolar)
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_location(self, latitude: f64, longitude: f64) -> Self {
        self.with_attribute(
            LOCATION,
            serde_json::json!({ "type": "Point", "coordinates": [longitude, latitude] }),
        )
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Attribute value; an explicit `null` counts as absent.
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    pub fn is_solar(&self) -> bool {
        self.asset_type == AssetType::ElectricityProducerSolar
    }

    pub fn location(&self) -> Option<GeoPoint> {
        let coordinates = self.attribute(LOCATION)?.get("coordinates")?.as_array()?;
        match coordinates.as_slice() {
            [lon, lat, ..] => Some(GeoPoint {
                latitude: lat.as_f64()?,
                longitude: lon.as_f64()?,
            }),
            _ => None,
        }
    }

    pub fn panel_pitch(&self) -> Option<i64> {
        self.attribute(PANEL_PITCH).and_then(|v| v.as_i64())
    }

    pub fn panel_azimuth(&self) -> Option<i64> {
        self.attribute(PANEL_AZIMUTH).and_then(|v| v.as_i64())
    }

    pub fn power_export_max(&self) -> Option<f64> {
        self.attribute(POWER_EXPORT_MAX).and_then(|v| v.as_f64())
    }

    pub fn include_forecast_solar_service(&self) -> Option<bool> {
        self.attribute(INCLUDE_FORECAST_SOLAR_SERVICE)
            .and_then(|v| v.as_bool())
    }

    pub fn set_actual_value_with_forecast(&self) -> Option<bool> {
        self.attribute(SET_ACTUAL_VALUE_WITH_FORECAST)
            .and_then(|v| v.as_bool())
    }

    /// Request parameters, if every required attribute is filled in.
    pub fn forecast_params(&self) -> Option<ForecastParams> {
        let location = self.location()?;
        Some(ForecastParams {
            latitude: location.latitude,
            longitude: location.longitude,
            pitch: self.panel_pitch()?,
            azimuth: self.panel_azimuth()?,
            kwp: self.power_export_max()?,
        })
    }

    /// Whether a forecasting task may run for this asset.
    pub fn is_forecast_eligible(&self) -> bool {
        self.include_forecast_solar_service().unwrap_or(false) && self.forecast_params().is_some()
    }
}
