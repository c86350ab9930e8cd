//! Axum HTTP surface.
//!
//! Provides:
//!   POST /alchemy/address-activity → provider webhook deliveries
//!   POST /address-activity         → same handler, legacy mount
//!   POST /alert/init               → register a watch, JSON WatchSummary
//!   GET  /health                   → liveness

use crate::error::WatchError;
use crate::pipeline::{AddressActivityUpdate, WatchRequest, WatchService, WebhookIngestor};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared state for the routes.
#[derive(Clone)]
pub struct AppState {
    pub watch: Arc<WatchService>,
    pub ingestor: Arc<WebhookIngestor>,
}

/// Build the Axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/alchemy/address-activity", post(address_activity))
        .route("/address-activity", post(address_activity))
        .route("/alert/init", post(alert_init))
        .route("/health", get(health))
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

impl IntoResponse for WatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            WatchError::InvalidTimeRange(_) | WatchError::MalformedActivity(_) => StatusCode::BAD_REQUEST,
            WatchError::InsufficientHistory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            WatchError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WatchError::UnmatchedWebhook { .. } | WatchError::Store(_) | WatchError::Tvl(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

// --- Handlers ---

async fn address_activity(
    State(state): State<AppState>,
    Json(update): Json<AddressActivityUpdate>,
) -> Result<&'static str, WatchError> {
    state.ingestor.ingest(&update).await?;
    Ok("ok")
}

async fn alert_init(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request = match parse_watch_request(&body) {
        Ok(r) => r,
        Err(message) => {
            warn!(body = %body, errors = %message, "malformed watch request");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    match state.watch.register(request).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Field checks for `/alert/init`; every problem is reported, `; ` joined.
fn parse_watch_request(body: &Value) -> Result<WatchRequest, String> {
    let user_id = body.get("userId").and_then(Value::as_str);
    let contract_address = body.get("contractAddress").and_then(Value::as_str);

    let mut errors = Vec::new();
    if user_id.is_none() {
        errors.push("userId is missing");
    }
    if contract_address.is_none() {
        errors.push("contractAddress is missing");
    }
    let (Some(user_id), Some(contract_address)) = (user_id, contract_address) else {
        return Err(errors.join("; "));
    };

    Ok(WatchRequest {
        user_id: user_id.to_string(),
        contract_address: contract_address.to_lowercase(),
        name: body.get("name").and_then(Value::as_str).map(str::to_string),
        time_range: body.get("timeRange").and_then(Value::as_str).map(str::to_string),
    })
}
