use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::put;
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::asset::Asset;
use crate::asset::AssetType;
use crate::bus::AttributeEvent;
use crate::bus::PersistenceCause;
use crate::memory::InMemoryAssetStore;
use crate::memory::InMemoryPredictedDatapoints;
use crate::service::ForecastService;
use crate::store::AttributeEventSink;
use crate::store::StoreError;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    forecasting_enabled: bool,
    active_tasks: usize,
}

/// An asset as listed by the API
#[derive(Serialize)]
struct AssetView {
    #[serde(flatten)]
    asset: Asset,
    /// Whether a forecasting task is running for the asset
    forecasting: bool,
}

/// Request body for PUT /v1/assets/:id, the id comes from the path
#[derive(Deserialize)]
struct AssetBody {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    asset_type: AssetType,
    #[serde(default)]
    gateway_id: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct Datapoint {
    timestamp: NaiveDateTime,
    value: f64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Shared application state
pub struct AppState {
    pub version: &'static str,
    pub assets: Arc<InMemoryAssetStore>,
    pub predicted: Arc<InMemoryPredictedDatapoints>,
    /// `None` while forecasting is disabled
    pub service: Option<Arc<ForecastService>>,
}

impl AppState {
    fn is_forecasting(&self, asset_id: &str) -> bool {
        self.service
            .as_ref()
            .is_some_and(|s| s.is_active(asset_id))
    }
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            forecasting_enabled: state.service.is_some(),
            active_tasks: state
                .service
                .as_ref()
                .map_or(0, |s| s.active_ids().len()),
        }),
    )
}

/// Handler for GET /v1/assets
#[tracing::instrument(skip(state))]
async fn list_assets(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let assets: Vec<AssetView> = state
        .assets
        .all()
        .into_iter()
        .map(|asset| AssetView {
            forecasting: state.is_forecasting(&asset.id),
            asset,
        })
        .collect();
    Json(assets)
}

/// Handler for PUT /v1/assets/:id
#[tracing::instrument(skip(state, body))]
async fn put_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AssetBody>,
) -> impl IntoResponse {
    let asset = Asset {
        id,
        name: body.name,
        asset_type: body.asset_type,
        gateway_id: body.gateway_id,
        attributes: body.attributes,
    };

    let status = match state.assets.upsert(asset.clone()) {
        PersistenceCause::Create => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    (status, Json(asset))
}

/// Handler for DELETE /v1/assets/:id
#[tracing::instrument(skip(state))]
async fn delete_asset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, StoreError> {
    state.assets.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for PUT /v1/assets/:id/attributes/:name
#[tracing::instrument(skip(state, value))]
async fn put_attribute(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(value): Json<serde_json::Value>,
) -> Result<StatusCode, StoreError> {
    state
        .assets
        .send_attribute_event(AttributeEvent::new(id, name, value))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for GET /v1/assets/:id/predicted/:attribute
#[tracing::instrument(skip(state))]
async fn get_predicted(
    State(state): State<Arc<AppState>>,
    Path((id, attribute)): Path<(String, String)>,
) -> Result<Json<Vec<Datapoint>>, StoreError> {
    if state.assets.get(&id).is_none() {
        return Err(StoreError::NotFound(id));
    }

    let datapoints = state
        .predicted
        .values(&id, &attribute)
        .into_iter()
        .map(|(timestamp, value)| Datapoint { timestamp, value })
        .collect();
    Ok(Json(datapoints))
}

/// Create the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/assets", get(list_assets))
        .route("/v1/assets/:id", put(put_asset).delete(delete_asset))
        .route("/v1/assets/:id/attributes/:name", put(put_attribute))
        .route("/v1/assets/:id/predicted/:attribute", get(get_predicted))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Runs until `shutdown_rx` fires or its sender is dropped.
pub async fn serve(
    listen: &str,
    port: u16,
    state: Arc<AppState>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> std::io::Result<()> {
    let app = create_router(state);

    let listener = TcpListener::bind((listen, port)).await?;
    tracing::info!("Starting HTTP API server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::NaiveDate;
    use serde_json::Value;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::asset::INCLUDE_FORECAST_SOLAR_SERVICE;
    use crate::asset::PANEL_PITCH;
    use crate::asset::POWER_FORECAST;
    use crate::bus::EventBus;
    use crate::store::PredictedDatapointStore;

    fn state(assets: Vec<Asset>) -> Arc<AppState> {
        state_on_bus(Arc::new(EventBus::new()), assets)
    }

    fn state_on_bus(bus: Arc<EventBus>, assets: Vec<Asset>) -> Arc<AppState> {
        Arc::new(AppState {
            version: "test",
            assets: Arc::new(InMemoryAssetStore::with_assets(bus, assets)),
            predicted: Arc::new(InMemoryPredictedDatapoints::new()),
            service: None,
        })
    }

    async fn send(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_ping() {
        let (status, body) = send(&state(vec![]), "GET", "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_info_without_forecasting() {
        let (status, body) = send(&state(vec![]), "GET", "/v1/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "test");
        assert_eq!(body["forecasting_enabled"], false);
        assert_eq!(body["active_tasks"], 0);
    }

    #[tokio::test]
    async fn test_put_list_and_delete_asset() {
        let state = state(vec![]);
        let asset = json!({
            "name": "Roof",
            "type": "electricity_producer_solar",
            "attributes": { "panelPitch": 30 },
        });

        let uri = "/v1/assets/solar-1";
        let (status, body) = send(&state, "PUT", uri, Some(asset.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "solar-1");

        let (status, _) = send(&state, "PUT", uri, Some(asset)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&state, "GET", "/v1/assets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "solar-1");
        assert_eq!(body[0]["attributes"][PANEL_PITCH], 30);
        assert_eq!(body[0]["forecasting"], false);

        let (status, _) = send(&state, "DELETE", uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&state, "DELETE", uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("solar-1"));
    }

    #[tokio::test]
    async fn test_put_attribute() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_attributes();
        let state = state_on_bus(bus, vec![Asset::solar("solar-1", "Roof")]);

        let uri = format!("/v1/assets/solar-1/attributes/{}", INCLUDE_FORECAST_SOLAR_SERVICE);
        let (status, _) = send(&state, "PUT", &uri, Some(json!(true))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let asset = state.assets.get("solar-1").unwrap();
        assert_eq!(asset.include_forecast_solar_service(), Some(true));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, INCLUDE_FORECAST_SOLAR_SERVICE);

        let uri = "/v1/assets/missing/attributes/panelPitch";
        let (status, _) = send(&state, "PUT", uri, Some(json!(30))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_predicted() {
        let state = state(vec![Asset::solar("solar-1", "Roof")]);
        let at = |hour| {
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap()
        };
        state
            .predicted
            .update_value("solar-1", POWER_FORECAST, -0.2, at(11))
            .await
            .unwrap();
        state
            .predicted
            .update_value("solar-1", POWER_FORECAST, -0.1, at(10))
            .await
            .unwrap();

        let uri = "/v1/assets/solar-1/predicted/powerForecast";
        let (status, body) = send(&state, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"timestamp": "2024-06-01T10:00:00", "value": -0.1},
                {"timestamp": "2024-06-01T11:00:00", "value": -0.2},
            ])
        );

        let uri = "/v1/assets/missing/predicted/powerForecast";
        let (status, _) = send(&state, "GET", uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_asset_created_over_api_starts_forecasting() {
        use crate::asset::PANEL_AZIMUTH;
        use crate::asset::POWER_EXPORT_MAX;
        use crate::forecast::Estimate;
        use crate::forecast::MockForecastProvider;
        use crate::memory::LoggingRulesTrigger;
        use crate::service::Collaborators;
        use crate::store::SystemClock;
        use crate::tasks::FORECAST_PERIOD;

        let bus = Arc::new(EventBus::new());
        let assets = Arc::new(InMemoryAssetStore::new(bus.clone()));
        let predicted = Arc::new(InMemoryPredictedDatapoints::new());
        let service = ForecastService::new(
            Arc::new(MockForecastProvider::new(Some(Estimate::default()))),
            Collaborators {
                assets: assets.clone(),
                predicted: predicted.clone(),
                events: assets.clone(),
                rules: Arc::new(LoggingRulesTrigger::new()),
                bus: bus.clone(),
                clock: Arc::new(SystemClock),
            },
            FORECAST_PERIOD,
        );
        service.start().await.unwrap();
        let state = Arc::new(AppState {
            version: "test",
            assets,
            predicted,
            service: Some(Arc::new(service)),
        });

        let asset = json!({
            "name": "Roof",
            "type": "electricity_producer_solar",
            "attributes": {
                "location": { "type": "Point", "coordinates": [4.9, 52.37] },
                PANEL_PITCH: 30,
                PANEL_AZIMUTH: 0,
                POWER_EXPORT_MAX: 5.0,
                INCLUDE_FORECAST_SOLAR_SERVICE: true,
            },
        });
        let (status, _) = send(&state, "PUT", "/v1/assets/solar-1", Some(asset)).await;
        assert_eq!(status, StatusCode::CREATED);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !state.is_forecasting("solar-1") {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (_, body) = send(&state, "GET", "/v1/assets", None).await;
        assert_eq!(body[0]["forecasting"], true);
        let (_, body) = send(&state, "GET", "/v1/info", None).await;
        assert_eq!(body["forecasting_enabled"], true);
        assert_eq!(body["active_tasks"], 1);

        if let Some(service) = &state.service {
            service.shutdown().await;
        }
    }
}
