use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;

use crate::middleware::auth::{Credential, ErrorResponse, SdkKind, classify, error_body};
use crate::relay::{Environment, Relay};
use crate::sdk::eval::Evaluator;

pub mod eval;
pub mod events;
pub mod goals;
pub mod php;
pub mod routes;
pub mod status;
pub mod stream;

// ============================================
// Application State
// ============================================

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub evaluator: Arc<dyn Evaluator>,
    /// Per-environment cache for the goals reverse proxy, keyed by env ID.
    pub goals_cache: Arc<Mutex<HashMap<String, goals::CachedGoals>>>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            relay,
            evaluator,
            goals_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Classify the request for a route group and resolve the owning
/// environment. Unknown server/mobile credentials are 401s; unknown env IDs
/// are 404s.
pub async fn resolve_environment(
    state: &AppState,
    kind: SdkKind,
    headers: &HeaderMap,
    env_id_path: Option<&str>,
) -> Result<(Arc<Environment>, Credential), ApiError> {
    let credential = classify(kind, headers, env_id_path).map_err(|e| {
        error_body(
            e.status_for(kind),
            match kind {
                SdkKind::JsClient => "unknown environment",
                _ => "missing or malformed authorization key",
            },
        )
    })?;

    match state.relay.get_environment(&credential).await {
        Some(environment) => Ok((environment, credential)),
        None => Err(error_body(
            match kind {
                SdkKind::JsClient => StatusCode::NOT_FOUND,
                _ => StatusCode::UNAUTHORIZED,
            },
            match kind {
                SdkKind::JsClient => "unknown environment",
                _ => "invalid authorization key",
            },
        )),
    }
}

/// Outermost middleware: every request increments the request counter.
pub async fn count_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    state.relay.metrics().record_request();
    next.run(request).await
}
