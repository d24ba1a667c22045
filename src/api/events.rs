// Analytics-event ingestion. Every endpoint answers 202 as soon as the
// payload is parsed and queued; forwarding happens on the flush timer and
// upstream failures are never surfaced back to the SDK.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::Value;

use crate::events::{EVENT_SCHEMA_HEADER, InboxKind};
use crate::middleware::auth::{SdkKind, error_body};
use crate::utils::decode_user_base64;

use super::{ApiError, AppState, resolve_environment};

/// A transparent 1x1 GIF, served by the image-beacon endpoint.
const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

fn schema_version(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(EVENT_SCHEMA_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn parse_batch(body: &[u8]) -> Result<Vec<Value>, ApiError> {
    serde_json::from_slice(body)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "body is not a JSON event array"))
}

async fn accept_bulk(
    state: &AppState,
    kind: SdkKind,
    inbox: InboxKind,
    headers: &HeaderMap,
    env_id: Option<&str>,
    body: &[u8],
) -> Result<StatusCode, ApiError> {
    let (environment, _) = resolve_environment(state, kind, headers, env_id).await?;
    let events = parse_batch(body)?;
    state.relay.metrics().record_events(events.len() as u64);
    environment
        .dispatcher()
        .accept(
            inbox,
            events,
            schema_version(headers),
            environment.store().as_ref(),
        )
        .await;
    Ok(StatusCode::ACCEPTED)
}

async fn accept_diagnostic(
    state: &AppState,
    kind: SdkKind,
    inbox: InboxKind,
    headers: &HeaderMap,
    env_id: Option<&str>,
    body: &[u8],
) -> Result<StatusCode, ApiError> {
    let (environment, _) = resolve_environment(state, kind, headers, env_id).await?;
    let payload: Value = serde_json::from_slice(body)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "body is not valid JSON"))?;
    environment
        .dispatcher()
        .forward_diagnostic(inbox, payload)
        .await;
    Ok(StatusCode::ACCEPTED)
}

/// POST /bulk
pub async fn server_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    accept_bulk(
        &state,
        SdkKind::Server,
        InboxKind::Server,
        &headers,
        None,
        &body,
    )
    .await
}

/// POST /diagnostic
pub async fn server_diagnostic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    accept_diagnostic(
        &state,
        SdkKind::Server,
        InboxKind::Server,
        &headers,
        None,
        &body,
    )
    .await
}

/// POST /mobile, /mobile/events, /mobile/events/bulk
pub async fn mobile_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    accept_bulk(
        &state,
        SdkKind::Mobile,
        InboxKind::Mobile,
        &headers,
        None,
        &body,
    )
    .await
}

/// POST /mobile/events/diagnostic
pub async fn mobile_diagnostic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    accept_diagnostic(
        &state,
        SdkKind::Mobile,
        InboxKind::Mobile,
        &headers,
        None,
        &body,
    )
    .await
}

/// POST /events/bulk/{env_id}
pub async fn js_bulk(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    accept_bulk(
        &state,
        SdkKind::JsClient,
        InboxKind::Browser,
        &headers,
        Some(&env_id),
        &body,
    )
    .await
}

/// POST /events/diagnostic/{env_id}
pub async fn js_diagnostic(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    accept_diagnostic(
        &state,
        SdkKind::JsClient,
        InboxKind::Browser,
        &headers,
        Some(&env_id),
        &body,
    )
    .await
}

#[derive(Debug, Deserialize, Default)]
pub struct ImageQuery {
    /// Base64-encoded JSON event array.
    pub d: Option<String>,
}

/// GET /a/{env_id}.gif?d=<base64 events> — image-beacon ingestion for
/// browsers that cannot use CORS. Always answers with the pixel; event
/// problems are only logged.
pub async fn js_image(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    Query(query): Query<ImageQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let env_id = env_id.strip_suffix(".gif").unwrap_or(&env_id).to_string();
    let (environment, _) =
        resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;

    if let Some(encoded) = query.d.as_deref() {
        match decode_user_base64(encoded)
            .and_then(|bytes| serde_json::from_slice::<Vec<Value>>(&bytes).ok())
        {
            Some(events) => {
                state.relay.metrics().record_events(events.len() as u64);
                environment
                    .dispatcher()
                    .accept(
                        InboxKind::Browser,
                        events,
                        schema_version(&headers),
                        environment.store().as_ref(),
                    )
                    .await;
            }
            None => {
                tracing::debug!("ignoring undecodable image-beacon payload");
            }
        }
    }

    Ok((
        [(header::CONTENT_TYPE, "image/gif")],
        TRANSPARENT_GIF.to_vec(),
    )
        .into_response())
}
