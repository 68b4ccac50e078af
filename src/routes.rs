use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::FeedCache;
use crate::dispatcher::{CycleReport, CycleSummary};
use crate::fetcher::validate_url;
use crate::poller::PollerControl;

pub struct AppState {
    pub cache: FeedCache,
    pub poller: PollerControl,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/refresh", post(refresh))
        .route("/subscriptions", post(subscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Custom error type
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn bad_request(error: impl Into<anyhow::Error>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, format!("Error: {}", self.error)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub summary: Option<CycleSummary>,
    pub last_cycle: Option<CycleReport>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let last_cycle = state.poller.last_report().await;
    Json(HealthResponse {
        status: "ok",
        summary: last_cycle.as_ref().map(CycleReport::summary),
        last_cycle,
    })
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> StatusCode {
    state.poller.trigger();
    StatusCode::ACCEPTED
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub url: String,
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscribeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let url = validate_url(request.url.trim()).map_err(AppError::bad_request)?;

    state.cache.subscribe(url.as_str()).await?;
    info!("Subscribed to {}", url);

    Ok(StatusCode::CREATED)
}
