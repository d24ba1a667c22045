use axum::{Json, extract::State};
use serde_json::Value;

use super::AppState;

/// GET /status — overall relay health plus per-environment connection
/// state, credentials obscured. `healthy` means every environment is
/// connected; anything less is `degraded`.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(state.relay.status().await)
}
