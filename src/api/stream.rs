// SSE endpoints. Server-side SDKs stream the dataset itself (`/all`,
// legacy `/flags`); mobile and JS clients stream pings and re-poll their
// evaluated values when one arrives.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response, sse::Sse},
};
use futures::stream::Stream;

use crate::metrics::Metrics;
use crate::middleware::auth::SdkKind;
use crate::sse::{
    AllChannelRepository, EventStream, FlagsChannelRepository, PingRepository,
};

use super::eval::{EvalQuery, require_report, user_from_path, user_from_report};
use super::{ApiError, AppState, resolve_environment};

/// Wraps the subscription stream to keep the open-streams gauge accurate.
struct CountedStream {
    inner: EventStream,
    metrics: Arc<Metrics>,
}

impl CountedStream {
    fn new(inner: EventStream, metrics: Arc<Metrics>) -> Self {
        metrics.stream_opened();
        Self { inner, metrics }
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.metrics.stream_closed();
    }
}

impl Stream for CountedStream {
    type Item = <EventStream as Stream>::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn sse_response(stream: CountedStream) -> Response {
    (
        [
            ("Cache-Control", "no-cache"),
            // Disable proxy buffering; events must reach the client as
            // they are published.
            ("X-Accel-Buffering", "no"),
        ],
        Sse::new(stream),
    )
        .into_response()
}

/// GET /all — full dataset stream for server-side SDKs.
pub async fn stream_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::Server, &headers, None).await?;
    let repository = AllChannelRepository {
        store: environment.store().clone(),
    };
    let stream = environment.all_publisher.subscribe(&repository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// GET /flags — legacy flags-only stream for older server-side SDKs.
pub async fn stream_flags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::Server, &headers, None).await?;
    let repository = FlagsChannelRepository {
        store: environment.store().clone(),
    };
    let stream = environment.flags_publisher.subscribe(&repository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// GET /mping — ping stream for mobile SDKs.
pub async fn stream_mping(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::Mobile, &headers, None).await?;
    let stream = environment.ping_publisher.subscribe(&PingRepository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// GET /meval/{user} — per-user ping stream for mobile SDKs. The user blob
/// is validated up front so a bad client fails fast instead of holding a
/// silent connection.
pub async fn stream_meval_get(
    State(state): State<AppState>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::Mobile, &headers, None).await?;
    user_from_path(&user)?;
    let stream = environment.ping_publisher.subscribe(&PingRepository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// REPORT /meval
pub async fn stream_meval_report(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_report(&method)?;
    let (environment, _) =
        resolve_environment(&state, SdkKind::Mobile, &headers, None).await?;
    user_from_report(&headers, &body)?;
    let stream = environment.ping_publisher.subscribe(&PingRepository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// GET /ping/{env_id} — ping stream for JS SDKs.
pub async fn stream_ping_js(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;
    let stream = environment.ping_publisher.subscribe(&PingRepository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// GET /eval/{env_id}/{user} — per-user ping stream for JS SDKs; secure
/// mode applies exactly as on the polling evaluation endpoints.
pub async fn stream_eval_js_get(
    State(state): State<AppState>,
    Path((env_id, user)): Path<(String, String)>,
    Query(query): Query<EvalQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (environment, _) =
        resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;
    let user = user_from_path(&user)?;
    super::eval::check_secure_mode(&environment, &user, &query)?;
    let stream = environment.ping_publisher.subscribe(&PingRepository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}

/// REPORT /eval/{env_id}
pub async fn stream_eval_js_report(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    Query(query): Query<EvalQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_report(&method)?;
    let (environment, _) =
        resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;
    let user = user_from_report(&headers, &body)?;
    super::eval::check_secure_mode(&environment, &user, &query)?;
    let stream = environment.ping_publisher.subscribe(&PingRepository).await;
    Ok(sse_response(CountedStream::new(
        stream,
        state.relay.metrics().clone(),
    )))
}
