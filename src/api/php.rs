// PHP polling endpoints. The PHP SDK cannot hold streaming connections, so
// it GETs raw stored entities and leans on HTTP caching: an `Etag` derived
// from keys+versions (or the single item's version), `304` on a matching
// `If-None-Match`, and `Expires`/`Vary` when the environment has a polling
// TTL configured.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::Value;

use crate::middleware::auth::{SdkKind, error_body};
use crate::relay::{Environment, Readiness};
use crate::store::DataKind;
use crate::utils::dataset_etag;

use super::{ApiError, AppState, resolve_environment};

fn etag_value(tag: &str) -> String {
    format!("\"{}\"", tag)
}

fn if_none_match_hit(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == etag)
}

/// Common response assembly: 304 on ETag hit, otherwise the entity with
/// caching headers.
fn cacheable_json(
    environment: &Environment,
    headers: &HeaderMap,
    etag: String,
    body: Value,
) -> Response {
    let etag = etag_value(&etag);

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response_headers.insert(header::ETAG, value);
    }
    if let Some(ttl) = environment.config().php_ttl() {
        let expires =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let formatted = expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            response_headers.insert(header::EXPIRES, value);
        }
        response_headers.insert(header::VARY, HeaderValue::from_static("Authorization"));
    }

    if if_none_match_hit(headers, &etag) {
        return (StatusCode::NOT_MODIFIED, response_headers).into_response();
    }
    (response_headers, Json(body)).into_response()
}

async fn check_ready(environment: &Environment) -> Result<(), ApiError> {
    match environment.ready_for_evaluation().await {
        Readiness::Ready => Ok(()),
        Readiness::StaleDataOnly => {
            tracing::warn!(
                "[env: {}] serving stored data; SDK client not connected",
                environment.name()
            );
            Ok(())
        }
        Readiness::NotReady => Err(error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "environment not yet initialized",
        )),
    }
}

/// GET /sdk/flags
pub async fn all_flags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::Server, &headers, None).await?;
    check_ready(&environment).await?;

    let flags = environment.store().all(DataKind::Flags).await.map_err(|e| {
        error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("data store error: {}", e),
        )
    })?;

    let etag = dataset_etag(flags.iter().map(|(key, flag)| {
        (
            key.as_str(),
            flag.get("version").and_then(Value::as_u64).unwrap_or(0),
        )
    }));
    let body = Value::Object(flags.into_iter().collect());
    Ok(cacheable_json(&environment, &headers, etag, body))
}

async fn single_item(
    state: &AppState,
    headers: &HeaderMap,
    kind: DataKind,
    key: &str,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(state, SdkKind::Server, headers, None).await?;
    check_ready(&environment).await?;

    let item = environment
        .store()
        .get(kind, key)
        .await
        .map_err(|e| {
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("data store error: {}", e),
            )
        })?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("unknown {} key", kind.name())))?;

    let etag = item
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .to_string();
    Ok(cacheable_json(&environment, headers, etag, item))
}

/// GET /sdk/flags/{key}
pub async fn one_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    single_item(&state, &headers, DataKind::Flags, &key).await
}

/// GET /sdk/segments/{key}
pub async fn one_segment(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    single_item(&state, &headers, DataKind::Segments, &key).await
}
