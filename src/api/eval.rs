// Flag evaluation endpoints: value-only (`eval`) and detailed (`evalx`)
// schemas, each in GET (user base64-encoded in the path) and REPORT (user
// in the body) forms, for server-side, mobile, and JS client-side SDKs.
//
// JS responses only include flags with the client-side bit; secure mode
// additionally requires an HMAC of the user key in `?h=`.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, header},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::middleware::auth::SdkKind;
use crate::relay::{Environment, Readiness};
use crate::sdk::eval::{FeatureFlag, User};
use crate::store::DataKind;
use crate::utils::{decode_user_base64, secure_mode_valid};

use super::{ApiError, AppState, resolve_environment};
use crate::middleware::auth::error_body;

/// Which response schema the route serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalSchema {
    ValueOnly,
    Detailed,
}

#[derive(Debug, Deserialize, Default)]
pub struct EvalQuery {
    #[serde(rename = "withReasons")]
    pub with_reasons: Option<bool>,
    /// Secure-mode hash.
    pub h: Option<String>,
}

/// The REPORT verb is not in axum's method filter set; routes register with
/// `any()` and gate here.
pub fn require_report(method: &Method) -> Result<(), ApiError> {
    if method.as_str() == "REPORT" {
        Ok(())
    } else {
        Err(error_body(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ))
    }
}

pub fn user_from_path(encoded: &str) -> Result<User, ApiError> {
    let bytes = decode_user_base64(encoded)
        .ok_or_else(|| error_body(StatusCode::BAD_REQUEST, "user data is not valid base64"))?;
    parse_user(&bytes)
}

pub fn user_from_report(headers: &HeaderMap, body: &Bytes) -> Result<User, ApiError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Err(error_body(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "REPORT must have a JSON body",
        ));
    }
    parse_user(body)
}

fn parse_user(bytes: &[u8]) -> Result<User, ApiError> {
    let user: User = serde_json::from_slice(bytes)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "user data is not valid JSON"))?;
    if user.key.is_empty() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "user has no key attribute",
        ));
    }
    Ok(user)
}

/// Secure-mode gate for JS-client environments.
pub fn check_secure_mode(
    environment: &Environment,
    user: &User,
    query: &EvalQuery,
) -> Result<(), ApiError> {
    if !environment.config().secure_mode {
        return Ok(());
    }
    let sdk_key = environment.config().sdk_key.as_deref().unwrap_or_default();
    let provided = query.h.as_deref().unwrap_or_default();
    if secure_mode_valid(sdk_key, &user.key, provided) {
        Ok(())
    } else {
        Err(error_body(
            StatusCode::BAD_REQUEST,
            "secure mode hash is missing or does not match",
        ))
    }
}

/// Evaluate every (visible) flag for the user and shape the response.
pub async fn evaluate_for_user(
    state: &AppState,
    environment: &Arc<Environment>,
    user: &User,
    schema: EvalSchema,
    kind: SdkKind,
    with_reasons: bool,
) -> Result<Json<Value>, ApiError> {
    match environment.ready_for_evaluation().await {
        Readiness::Ready => {}
        Readiness::StaleDataOnly => {
            tracing::warn!(
                "[env: {}] serving evaluation from last-known data; SDK client not connected",
                environment.name()
            );
        }
        Readiness::NotReady => {
            return Err(error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "environment not yet initialized",
            ));
        }
    }

    let flags = environment.store().all(DataKind::Flags).await.map_err(|e| {
        error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("data store error: {}", e),
        )
    })?;

    let mut results = Map::new();
    for (key, raw) in flags {
        let Some(flag) = FeatureFlag::from_value(&raw) else {
            tracing::warn!("[env: {}] skipping malformed flag {:?}", environment.name(), key);
            continue;
        };
        if kind == SdkKind::JsClient && !flag.client_side {
            continue;
        }

        let detail = state.evaluator.evaluate(&raw, user);
        let entry = match schema {
            EvalSchema::ValueOnly => detail.value,
            EvalSchema::Detailed => {
                let experiment = detail.in_experiment;
                let mut entry = Map::new();
                entry.insert("value".to_string(), detail.value);
                if let Some(variation) = detail.variation_index {
                    entry.insert("variation".to_string(), json!(variation));
                }
                entry.insert("version".to_string(), json!(flag.version));
                if flag.track_events || experiment {
                    entry.insert("trackEvents".to_string(), json!(true));
                }
                if experiment {
                    entry.insert("trackReason".to_string(), json!(true));
                }
                if let Some(date) = flag.debug_events_until_date {
                    entry.insert("debugEventsUntilDate".to_string(), json!(date));
                }
                if with_reasons || experiment {
                    entry.insert(
                        "reason".to_string(),
                        serde_json::to_value(&detail.reason).unwrap_or(Value::Null),
                    );
                }
                Value::Object(entry)
            }
        };
        results.insert(key, entry);
    }

    Ok(Json(Value::Object(results)))
}

// ============================================
// Server-side and mobile handlers
// ============================================

macro_rules! keyed_eval_handlers {
    ($get:ident, $report:ident, $kind:expr, $schema:expr) => {
        pub async fn $get(
            State(state): State<AppState>,
            Path(user): Path<String>,
            Query(query): Query<EvalQuery>,
            headers: HeaderMap,
        ) -> Result<Json<Value>, ApiError> {
            let (environment, _) = resolve_environment(&state, $kind, &headers, None).await?;
            let user = user_from_path(&user)?;
            evaluate_for_user(
                &state,
                &environment,
                &user,
                $schema,
                $kind,
                query.with_reasons.unwrap_or(false),
            )
            .await
        }

        pub async fn $report(
            State(state): State<AppState>,
            Query(query): Query<EvalQuery>,
            method: Method,
            headers: HeaderMap,
            body: Bytes,
        ) -> Result<Json<Value>, ApiError> {
            require_report(&method)?;
            let (environment, _) = resolve_environment(&state, $kind, &headers, None).await?;
            let user = user_from_report(&headers, &body)?;
            evaluate_for_user(
                &state,
                &environment,
                &user,
                $schema,
                $kind,
                query.with_reasons.unwrap_or(false),
            )
            .await
        }
    };
}

keyed_eval_handlers!(
    eval_server_get,
    eval_server_report,
    SdkKind::Server,
    EvalSchema::ValueOnly
);
keyed_eval_handlers!(
    evalx_server_get,
    evalx_server_report,
    SdkKind::Server,
    EvalSchema::Detailed
);
keyed_eval_handlers!(
    eval_mobile_get,
    eval_mobile_report,
    SdkKind::Mobile,
    EvalSchema::ValueOnly
);
keyed_eval_handlers!(
    evalx_mobile_get,
    evalx_mobile_report,
    SdkKind::Mobile,
    EvalSchema::Detailed
);

// ============================================
// JS client-side handlers
// ============================================

macro_rules! js_eval_handlers {
    ($get:ident, $report:ident, $schema:expr) => {
        pub async fn $get(
            State(state): State<AppState>,
            Path((env_id, user)): Path<(String, String)>,
            Query(query): Query<EvalQuery>,
            headers: HeaderMap,
        ) -> Result<Json<Value>, ApiError> {
            let (environment, _) =
                resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;
            let user = user_from_path(&user)?;
            check_secure_mode(&environment, &user, &query)?;
            evaluate_for_user(
                &state,
                &environment,
                &user,
                $schema,
                SdkKind::JsClient,
                query.with_reasons.unwrap_or(false),
            )
            .await
        }

        pub async fn $report(
            State(state): State<AppState>,
            Path(env_id): Path<String>,
            Query(query): Query<EvalQuery>,
            method: Method,
            headers: HeaderMap,
            body: Bytes,
        ) -> Result<Json<Value>, ApiError> {
            require_report(&method)?;
            let (environment, _) =
                resolve_environment(&state, SdkKind::JsClient, &headers, Some(&env_id)).await?;
            let user = user_from_report(&headers, &body)?;
            check_secure_mode(&environment, &user, &query)?;
            evaluate_for_user(
                &state,
                &environment,
                &user,
                $schema,
                SdkKind::JsClient,
                query.with_reasons.unwrap_or(false),
            )
            .await
        }
    };
}

js_eval_handlers!(eval_js_get, eval_js_report, EvalSchema::ValueOnly);
js_eval_handlers!(evalx_js_get, evalx_js_report, EvalSchema::Detailed);
