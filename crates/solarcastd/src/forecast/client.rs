use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::ForecastSeries;
use crate::asset::ForecastParams;

pub const DEFAULT_BASE_URL: &str = "https://api.forecast.solar";

/// forecast.solar timestamps are local ISO 8601 with a space instead of 'T'
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("forecast.solar returned status {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Request to forecast.solar failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Failed to parse forecast.solar response: {0}")]
    Parse(String),
}

/// Rate limit information returned alongside every estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub period: u64,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub remaining: u32,
}

/// One parsed estimate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Estimate {
    /// Instantaneous power in watts per timestamp
    pub watts: ForecastSeries,

    /// Energy per period in Wh, keyed as sent by the provider
    pub watt_hours: BTreeMap<String, f64>,

    /// Energy per day in Wh, keyed by date
    pub watt_hours_day: BTreeMap<String, f64>,

    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
struct EstimateResponse {
    result: EstimateResult,
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstimateResult {
    watts: BTreeMap<String, f64>,
    #[serde(default)]
    watt_hours: BTreeMap<String, f64>,
    #[serde(default)]
    watt_hours_day: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    ratelimit: Option<RateLimit>,
}

/// Parse a forecast.solar estimate body
pub fn parse_estimate(body: &str) -> Result<Estimate, ForecastError> {
    let response: EstimateResponse =
        serde_json::from_str(body).map_err(|e| ForecastError::Parse(e.to_string()))?;

    let watts = response
        .result
        .watts
        .into_iter()
        .map(|(key, value)| {
            NaiveDateTime::parse_from_str(&key, TIMESTAMP_FORMAT)
                .map(|timestamp| (timestamp, value))
                .map_err(|e| ForecastError::Parse(format!("invalid timestamp '{}': {}", key, e)))
        })
        .collect::<Result<ForecastSeries, _>>()?;

    Ok(Estimate {
        watts,
        watt_hours: response.result.watt_hours,
        watt_hours_day: response.result.watt_hours_day,
        rate_limit: response.message.and_then(|m| m.ratelimit),
    })
}

/// Path segment identifying one panel array, `lat/lon/pitch/azimuth/kwp`
pub fn estimate_path(params: &ForecastParams) -> String {
    format!(
        "{:.6}/{:.6}/{}/{}/{:.6}",
        params.latitude, params.longitude, params.pitch, params.azimuth, params.kwp
    )
}

/// Trait for forecast providers
///
/// This trait allows for mocking the provider for testing purposes
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    /// Fetch the current estimate for one panel array
    async fn estimate(&self, params: &ForecastParams) -> Result<Estimate, ForecastError>;
}

/// forecast.solar client using reqwest
pub struct ForecastSolarClient {
    http: Client,
    /// `<base_url>/<api_key>/estimate`
    endpoint: String,
}

impl ForecastSolarClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ForecastError> {
        let http = Client::builder()
            .user_agent(concat!("solarcastd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ForecastError::Transport)?;

        Ok(Self {
            http,
            endpoint: format!("{}/{}/estimate", base_url.trim_end_matches('/'), api_key),
        })
    }

    pub fn estimate_url(&self, params: &ForecastParams) -> String {
        format!("{}/{}", self.endpoint, estimate_path(params))
    }
}

#[async_trait]
impl ForecastProvider for ForecastSolarClient {
    async fn estimate(&self, params: &ForecastParams) -> Result<Estimate, ForecastError> {
        // The endpoint embeds the API key, only log the array path
        debug!("Requesting estimate for {}", estimate_path(params));

        let response = self
            .http
            .get(self.estimate_url(params))
            .send()
            .await
            .map_err(ForecastError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ForecastError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(ForecastError::Transport)?;
        parse_estimate(&body)
    }
}

/// Mock forecast provider for testing
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockForecastProvider {
    /// Estimate to return; `None` answers with a 503
    pub estimate: Option<Estimate>,
    /// Never answer, like a request the provider leaves hanging
    pub hang: bool,
    pub requests: std::sync::Mutex<Vec<ForecastParams>>,
}

#[cfg(test)]
impl MockForecastProvider {
    pub fn new(estimate: Option<Estimate>) -> Self {
        Self {
            estimate,
            hang: false,
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Provider whose requests never complete
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(None)
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Wait until at least `n` requests were made, panicking after two seconds
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while self.calls() < n {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for forecast requests");
    }
}

#[cfg(test)]
#[async_trait]
impl ForecastProvider for MockForecastProvider {
    async fn estimate(&self, params: &ForecastParams) -> Result<Estimate, ForecastError> {
        self.requests.lock().unwrap().push(*params);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.estimate.clone().ok_or(ForecastError::Provider {
            status: 503,
            body: "mock unavailable".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use mockito::Server;
    use serde_json::json;

    use super::*;

    fn params() -> ForecastParams {
        ForecastParams {
            latitude: 52.37,
            longitude: 4.9,
            pitch: 30,
            azimuth: -15,
            kwp: 5.0,
        }
    }

    fn ts(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn estimate_body() -> String {
        json!({
            "result": {
                "watts": {
                    "2024-06-01 12:00:00": 300,
                    "2024-06-01 10:00:00": 100,
                    "2024-06-01 11:00:00": 200.5
                },
                "watt_hours_period": {},
                "wattHours": { "2024-06-01 10:00:00": 50 },
                "wattHoursDay": { "2024-06-01": 650 }
            },
            "message": {
                "code": 0,
                "type": "success",
                "text": "",
                "ratelimit": { "period": 3600, "limit": 12, "remaining": 11 }
            }
        })
        .to_string()
    }

    #[test]
    fn test_estimate_path_format() {
        assert_eq!(
            estimate_path(&params()),
            "52.370000/4.900000/30/-15/5.000000"
        );
    }

    #[test]
    fn test_estimate_url_embeds_key() {
        let client = ForecastSolarClient::new("https://api.forecast.solar/", "secret").unwrap();
        assert_eq!(
            client.estimate_url(&params()),
            "https://api.forecast.solar/secret/estimate/52.370000/4.900000/30/-15/5.000000"
        );
    }

    #[test]
    fn test_parse_estimate_orders_samples() {
        let estimate = parse_estimate(&estimate_body()).unwrap();

        let samples: Vec<_> = estimate.watts.into_iter().collect();
        assert_eq!(samples, vec![(ts(10), 100.0), (ts(11), 200.5), (ts(12), 300.0)]);
        assert_eq!(estimate.watt_hours_day.get("2024-06-01"), Some(&650.0));
        assert_eq!(estimate.watt_hours.len(), 1);
        assert_eq!(
            estimate.rate_limit,
            Some(RateLimit {
                period: 3600,
                limit: 12,
                remaining: 11
            })
        );
    }

    #[test]
    fn test_parse_estimate_rejects_iso_t_timestamps() {
        let body = json!({ "result": { "watts": { "2024-06-01T10:00:00": 100 } } }).to_string();
        let err = parse_estimate(&body).unwrap_err();
        assert!(matches!(err, ForecastError::Parse(_)));
        assert!(err.to_string().contains("2024-06-01T10:00:00"));
    }

    #[test]
    fn test_parse_estimate_requires_watts() {
        let body = json!({ "result": { "wattHours": {} } }).to_string();
        assert!(matches!(parse_estimate(&body), Err(ForecastError::Parse(_))));
        assert!(matches!(parse_estimate("not json"), Err(ForecastError::Parse(_))));
    }

    #[tokio::test]
    async fn test_estimate_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/test-key/estimate/52.370000/4.900000/30/-15/5.000000")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(estimate_body())
            .create_async()
            .await;

        let client = ForecastSolarClient::new(&server.url(), "test-key").unwrap();
        let estimate = client.estimate(&params()).await.unwrap();

        assert_eq!(estimate.watts.len(), 3);
        assert_eq!(estimate.watts.get(&ts(12)), Some(&300.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_estimate_provider_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/test-key/estimate/52.370000/4.900000/30/-15/5.000000")
            .with_status(429)
            .with_body("rate limit exceeded")
            .create_async()
            .await;

        let client = ForecastSolarClient::new(&server.url(), "test-key").unwrap();
        let result = client.estimate(&params()).await;

        match result {
            Err(ForecastError::Provider { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limit exceeded");
            }
            other => panic!("expected provider error, got {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_estimate_malformed_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/test-key/estimate/52.370000/4.900000/30/-15/5.000000")
            .with_status(200)
            .with_body("{\"result\": 42}")
            .create_async()
            .await;

        let client = ForecastSolarClient::new(&server.url(), "test-key").unwrap();
        let result = client.estimate(&params()).await;
        assert!(matches!(result, Err(ForecastError::Parse(_))));
    }

    #[tokio::test]
    async fn test_estimate_transport_error() {
        // Nothing listens on port 1
        let client = ForecastSolarClient::new("http://127.0.0.1:1", "test-key").unwrap();
        let result = client.estimate(&params()).await;
        assert!(matches!(result, Err(ForecastError::Transport(_))));
    }
}
