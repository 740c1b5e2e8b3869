//! Axum read API over the forecast store.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, FixedOffset, NaiveDate};
use pollen_core::{local_calendar_date, Forecast, PollenSeverityRecord, SiteId, ThunderstormAsthmaRecord};
use pollen_storage::StoreError;
use pollen_sync::{IngestionPipeline, SyncConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pollen-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
pub struct SiteView {
    pub id: SiteId,
    pub name: String,
    pub forecast_for: Option<DateTime<FixedOffset>>,
    pub severities: Vec<PollenSeverityRecord>,
}

/// JSON shape served for a stored forecast, with site names resolved.
#[derive(Debug, Serialize)]
pub struct ForecastView {
    pub date: DateTime<FixedOffset>,
    pub local_date: NaiveDate,
    pub asthma_updated_at: Option<DateTime<FixedOffset>>,
    pub sites: Vec<SiteView>,
    pub thunderstorm_asthma: Vec<ThunderstormAsthmaRecord>,
}

impl ForecastView {
    pub fn new(forecast: Forecast, local_date: NaiveDate, pipeline: &IngestionPipeline) -> Self {
        let sites = forecast
            .site_forecasts
            .into_iter()
            .map(|site| SiteView {
                id: site.site,
                name: pipeline
                    .sites()
                    .get(site.site)
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                forecast_for: site.forecast_for,
                severities: site.severities,
            })
            .collect();
        Self {
            date: forecast.date,
            local_date,
            asthma_updated_at: forecast.asthma_updated_at,
            sites,
            thunderstorm_asthma: forecast.asthma_records,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/forecast/latest", get(latest_handler))
        .route("/forecast/{date}", get(forecast_by_date_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let pipeline = IngestionPipeline::from_config(&config).await?;
    serve(AppState::new(Arc::new(pipeline)), config.port).await
}

/// Ingest if today's forecast is missing, then return it.
async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    if let Err(err) = state.pipeline.run_if_needed().await {
        return server_error(&err);
    }
    forecast_response(&state.pipeline, state.pipeline.today()).await
}

async fn latest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.latest_forecast_date().await {
        Ok(latest) => {
            let day = local_calendar_date(&latest, state.pipeline.zone());
            forecast_response(&state.pipeline, day).await
        }
        Err(StoreError::NotFound) => json_error(StatusCode::NOT_FOUND, "no forecast has been stored yet".into()),
        Err(err) => server_error(&err),
    }
}

async fn forecast_by_date_handler(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Response {
    match NaiveDate::parse_from_str(&date, "%Y-%m-%d") {
        Ok(day) => forecast_response(&state.pipeline, day).await,
        Err(err) => json_error(StatusCode::BAD_REQUEST, format!("invalid date {date:?}: {err}")),
    }
}

async fn forecast_response(pipeline: &IngestionPipeline, day: NaiveDate) -> Response {
    match pipeline.forecast_for(day).await {
        Ok(forecast) => Json(ForecastView::new(forecast, day, pipeline)).into_response(),
        Err(err) => server_error(&err),
    }
}

fn server_error(err: &dyn std::error::Error) -> Response {
    error!(error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use pollen_adapters::{AdapterError, ExtractionError, ForecastSource};
    use pollen_core::{
        AsthmaForecast, PollenType, Severity, Site, SiteForecast, SiteRegistry, DEFAULT_REPORTING_ZONE,
    };
    use pollen_storage::{ForecastStore, RequestPacer};
    use serde_json::Value;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StubSource {
        fail: AtomicBool,
    }

    #[async_trait]
    impl ForecastSource for StubSource {
        async fn fetch_thunderstorm_asthma(&self) -> Result<AsthmaForecast, AdapterError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AdapterError::Extraction {
                    context: "thunderstorm asthma page".into(),
                    source: ExtractionError::MissingTimestamp,
                });
            }
            Ok(AsthmaForecast {
                updated_at: Utc::now().fixed_offset(),
                records: vec![ThunderstormAsthmaRecord {
                    region: "wimmera".into(),
                    severity: Severity::Extreme,
                }],
            })
        }

        async fn fetch_pollen_for_site(&self, site: &Site) -> Result<SiteForecast, AdapterError> {
            Ok(SiteForecast {
                site: site.id,
                forecast_for: None,
                severities: vec![PollenSeverityRecord::new(PollenType::grass(), Severity::High)],
            })
        }
    }

    async fn test_app(source: Arc<StubSource>) -> Router {
        let sites = SiteRegistry::new(vec![Site::new(1, "melbourne"), Site::new(16, "geelong")]).unwrap();
        let store = ForecastStore::open_in_memory(DEFAULT_REPORTING_ZONE, sites.clone())
            .await
            .unwrap();
        let pipeline = IngestionPipeline::new(store, source, sites, RequestPacer::disabled());
        app(AppState::new(Arc::new(pipeline)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn latest_is_not_found_on_empty_store() {
        let app = test_app(Arc::default()).await;
        let (status, body) = get_json(app, "/forecast/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("no forecast"));
    }

    #[tokio::test]
    async fn index_ingests_and_returns_today() {
        let app = test_app(Arc::default()).await;
        let (status, body) = get_json(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sites"][1]["name"], "geelong");
        assert_eq!(body["sites"][1]["severities"][0]["type"], "grass");
        assert_eq!(body["sites"][1]["severities"][0]["severity"], "high");
        assert_eq!(body["thunderstorm_asthma"][0]["region"], "wimmera");

        let (status, latest) = get_json(app, "/forecast/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["local_date"], body["local_date"]);
    }

    #[tokio::test]
    async fn date_route_validates_and_lists_every_site() {
        let app = test_app(Arc::default()).await;
        let (status, _) = get_json(app.clone(), "/forecast/March-1st").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get_json(app, "/forecast/2020-01-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sites"].as_array().unwrap().len(), 2);
        assert!(body["sites"][0]["severities"].as_array().unwrap().is_empty());
        assert!(body["thunderstorm_asthma"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_ingestion_is_a_server_error() {
        let source = Arc::new(StubSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let app = test_app(source).await;
        let (status, body) = get_json(app, "/").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("fetching forecasts failed"));
    }
}
