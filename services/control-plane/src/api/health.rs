//! Health endpoints.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn readyz(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .db()
        .ping()
        .await
        .map_err(|e| ApiError::internal("database_unavailable", e.to_string()))?;
    Ok(Json(json!({"status": "ok"})))
}
