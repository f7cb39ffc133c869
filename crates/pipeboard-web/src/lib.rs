//! Axum JSON service for the Pipeboard dashboard.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use pipeboard_core::{Deal, PipelineMetrics, StageBoard};
use pipeboard_notion::{DealSource, NotionClient, NotionConfig, NotionError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pipeboard-web";

/// Startup facts surfaced by `/debug`. Holds a token fingerprint, never the
/// token itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub credential_configured: bool,
    pub credential_fingerprint: String,
    pub database_id: String,
}

pub struct AppState {
    source: Arc<dyn DealSource>,
    flight: SingleFlight,
    diagnostics: Diagnostics,
}

impl AppState {
    pub fn new(source: Arc<dyn DealSource>, diagnostics: Diagnostics) -> Self {
        Self {
            source,
            flight: SingleFlight::default(),
            diagnostics,
        }
    }

    pub fn for_config(config: &NotionConfig) -> anyhow::Result<Self> {
        let diagnostics = Diagnostics {
            credential_configured: true,
            credential_fingerprint: config.token_fingerprint(),
            database_id: config.database_id.clone(),
        };
        let client = NotionClient::new(config.clone())?;
        Ok(Self::new(Arc::new(client), diagnostics))
    }
}

type FlightResult = Result<Arc<Vec<Deal>>, Arc<NotionError>>;
type FlightFuture = Shared<BoxFuture<'static, FlightResult>>;

/// Coalesces concurrent refreshes onto one in-flight upstream call; every
/// caller of an active flight receives the same result. The slot clears when
/// the flight lands, so the next request starts a fresh one.
#[derive(Default)]
struct SingleFlight {
    slot: Mutex<Option<FlightFuture>>,
}

impl SingleFlight {
    async fn fetch(&self, source: Arc<dyn DealSource>) -> FlightResult {
        let flight = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let flight = async move {
                        source.fetch_deals().await.map(Arc::new).map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&flight)) {
            *slot = None;
        }
        result
    }
}

async fn fetch_snapshot(state: &AppState) -> FlightResult {
    state.flight.fetch(state.source.clone()).await
}

#[derive(Debug, Deserialize, Default)]
struct DealsQuery {
    stage: Option<String>,
    q: Option<String>,
}

fn filter_deals(deals: &[Deal], query: &DealsQuery) -> Vec<Deal> {
    let stage = query.stage.as_deref().unwrap_or_default();
    let needle = query.q.as_deref().unwrap_or_default().to_lowercase();
    deals
        .iter()
        .filter(|deal| stage.is_empty() || deal.stage.as_str() == stage)
        .filter(|deal| needle.is_empty() || deal.title.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/deals", get(deals_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/board", get(board_handler))
        .route("/api/properties", get(properties_handler))
        .route("/health", get(health_handler))
        .route("/debug", get(debug_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PIPEBOARD_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3001);
    let config = NotionConfig::from_env()?;
    let state = AppState::for_config(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database_id = %config.database_id, "serving dashboard api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn deals_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DealsQuery>,
) -> Response {
    match fetch_snapshot(&state).await {
        Ok(deals) => ok_json(filter_deals(&deals, &query)),
        Err(err) => upstream_error(&err),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match fetch_snapshot(&state).await {
        Ok(deals) => ok_json(PipelineMetrics::compute(&deals, Utc::now())),
        Err(err) => upstream_error(&err),
    }
}

async fn board_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DealsQuery>,
) -> Response {
    match fetch_snapshot(&state).await {
        Ok(deals) => ok_json(StageBoard::group(filter_deals(&deals, &query))),
        Err(err) => upstream_error(&err),
    }
}

async fn properties_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.source.list_properties().await {
        Ok(properties) => ok_json(properties),
        Err(err) => upstream_error(&err),
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn debug_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.diagnostics.clone()).into_response()
}

fn ok_json<T: Serialize>(data: T) -> Response {
    Json(serde_json::json!({ "success": true, "data": data })).into_response()
}

fn upstream_error(err: &NotionError) -> Response {
    warn!(error = %err, "upstream fetch failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}
