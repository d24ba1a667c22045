// Goals reverse proxy. The JS SDK fetches click/pageview goals from the
// same host it evaluates against, so the relay forwards the request
// upstream and keeps a small per-environment cache validated with the
// upstream's ETag.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::middleware::auth::{SdkKind, error_body};

use super::{ApiError, AppState, resolve_environment};

#[derive(Clone)]
pub struct CachedGoals {
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

/// GET /sdk/goals/{env_id}
pub async fn goals(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;

    let url = format!(
        "{}/sdk/goals/{}",
        state.relay.config().main.base_uri,
        env_id
    );

    let cached = state.goals_cache.lock().await.get(&env_id).cloned();

    let mut request = state.relay.http().get(&url);
    if let Some(CachedGoals {
        etag: Some(etag), ..
    }) = &cached
    {
        request = request.header(header::IF_NONE_MATCH, etag.as_str());
    }

    let response = request.send().await.map_err(|e| {
        error_body(
            StatusCode::BAD_GATEWAY,
            format!("failed to reach upstream: {}", e),
        )
    })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_MODIFIED {
        if let Some(cached) = cached {
            return Ok(json_bytes(cached.body));
        }
        // A 304 without anything cached means our cache was dropped;
        // re-request without the validator next time.
        state.goals_cache.lock().await.remove(&env_id);
        return Err(error_body(StatusCode::BAD_GATEWAY, "upstream cache desync"));
    }
    if !status.is_success() {
        return Err(error_body(
            StatusCode::BAD_GATEWAY,
            format!("upstream returned {}", status),
        ));
    }

    let etag = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .await
        .map_err(|e| {
            error_body(
                StatusCode::BAD_GATEWAY,
                format!("failed to read upstream body: {}", e),
            )
        })?
        .to_vec();

    state
        .goals_cache
        .lock()
        .await
        .insert(env_id, CachedGoals {
            etag,
            body: body.clone(),
        });

    Ok(json_bytes(body))
}

fn json_bytes(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
