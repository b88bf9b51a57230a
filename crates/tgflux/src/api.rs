use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tgflux_core::analytics::{
    self, AnalyticsError, AnalyticsStore, ChannelActivity, MessageSearchResult, TopProduct,
};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn AnalyticsStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/reports/top-products", get(top_products))
        .route("/api/channels/{channel_name}/activity", get(channel_activity))
        .route("/api/search/messages", get(search_messages))
        .route("/health", get(health))
        .with_state(state)
}

/// Renders errors as `{"detail": "..."}`.
pub struct ApiError(AnalyticsError);

impl From<AnalyticsError> for ApiError {
    fn from(err: AnalyticsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AnalyticsError::InvalidLimit | AnalyticsError::EmptyQuery => StatusCode::BAD_REQUEST,
            AnalyticsError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            AnalyticsError::Store(err) => {
                tracing::error!("analytics query failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let detail = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct TopProductsParams {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    query: Option<String>,
}

async fn top_products(
    State(state): State<AppState>,
    Query(params): Query<TopProductsParams>,
) -> Result<Json<Vec<TopProduct>>, ApiError> {
    Ok(Json(
        analytics::top_products(state.store.as_ref(), params.limit).await?,
    ))
}

async fn channel_activity(
    State(state): State<AppState>,
    Path(channel_name): Path<String>,
) -> Result<Json<Vec<ChannelActivity>>, ApiError> {
    Ok(Json(
        analytics::channel_activity(state.store.as_ref(), &channel_name).await?,
    ))
}

async fn search_messages(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<MessageSearchResult>>, ApiError> {
    Ok(Json(
        analytics::search_messages(state.store.as_ref(), params.query.as_deref()).await?,
    ))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
