use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{any, get, post},
};

use super::{AppState, count_requests, eval, events, goals, php, status, stream};
use crate::middleware::cors::cors_middleware;

/// Relay endpoint surface
///
/// ## Server-side SDKs (Authorization: SDK key)
/// - GET    /sdk/eval/users/{user}   - value-only evaluation
/// - REPORT /sdk/eval/user           - value-only evaluation, user in body
/// - GET    /sdk/evalx/users/{user}  - detailed evaluation
/// - REPORT /sdk/evalx/user          - detailed evaluation, user in body
/// - GET    /sdk/flags               - PHP polling, all flags
/// - GET    /sdk/flags/{key}         - PHP polling, one flag
/// - GET    /sdk/segments/{key}      - PHP polling, one segment
/// - GET    /all                     - SSE, flags+segments
/// - GET    /flags                   - SSE, legacy flags only
/// - POST   /bulk                    - analytics events
/// - POST   /diagnostic              - diagnostic events
///
/// ## Mobile SDKs (Authorization: mobile key)
/// - GET    /msdk/eval/users/{user}, REPORT /msdk/eval/user
/// - GET    /msdk/evalx/users/{user}, REPORT /msdk/evalx/user
/// - GET    /mping                   - SSE ping
/// - GET    /meval/{user}, REPORT /meval - SSE ping per user
/// - POST   /mobile, /mobile/events, /mobile/events/bulk
/// - POST   /mobile/events/diagnostic
///
/// ## JS client-side SDKs (environment ID in path; CORS applies)
/// - GET    /sdk/eval/{env_id}/users/{user}, REPORT /sdk/eval/{env_id}/user
/// - GET    /sdk/evalx/{env_id}/users/{user}, REPORT /sdk/evalx/{env_id}/user
/// - GET    /sdk/goals/{env_id}      - reverse proxy with caching
/// - GET    /ping/{env_id}           - SSE ping
/// - GET    /eval/{env_id}/{user}, REPORT /eval/{env_id} - SSE ping per user
/// - POST   /events/bulk/{env_id}, /events/diagnostic/{env_id}
/// - GET    /a/{env_id}              - image-beacon events ({env_id}.gif)
///
/// ## Operational
/// - GET    /status                  - relay + environment health
pub fn router(state: AppState) -> Router {
    let server_routes = Router::new()
        .route("/sdk/eval/users/{user}", get(eval::eval_server_get))
        .route("/sdk/eval/user", any(eval::eval_server_report))
        .route("/sdk/evalx/users/{user}", get(eval::evalx_server_get))
        .route("/sdk/evalx/user", any(eval::evalx_server_report))
        .route("/sdk/flags", get(php::all_flags))
        .route("/sdk/flags/{key}", get(php::one_flag))
        .route("/sdk/segments/{key}", get(php::one_segment))
        .route("/all", get(stream::stream_all))
        .route("/flags", get(stream::stream_flags))
        .route("/bulk", post(events::server_bulk))
        .route("/diagnostic", post(events::server_diagnostic));

    let mobile_routes = Router::new()
        .route("/msdk/eval/users/{user}", get(eval::eval_mobile_get))
        .route("/msdk/eval/user", any(eval::eval_mobile_report))
        .route("/msdk/evalx/users/{user}", get(eval::evalx_mobile_get))
        .route("/msdk/evalx/user", any(eval::evalx_mobile_report))
        .route("/mping", get(stream::stream_mping))
        .route("/meval/{user}", get(stream::stream_meval_get))
        .route("/meval", any(stream::stream_meval_report))
        .route("/mobile", post(events::mobile_bulk))
        .route("/mobile/events", post(events::mobile_bulk))
        .route("/mobile/events/bulk", post(events::mobile_bulk))
        .route("/mobile/events/diagnostic", post(events::mobile_diagnostic));

    // Everything here is reachable from browsers; the CORS layer answers
    // preflights and stamps per-environment headers on actual responses.
    let client_routes = Router::new()
        .route("/sdk/eval/{env_id}/users/{user}", get(eval::eval_js_get))
        .route("/sdk/eval/{env_id}/user", any(eval::eval_js_report))
        .route("/sdk/evalx/{env_id}/users/{user}", get(eval::evalx_js_get))
        .route("/sdk/evalx/{env_id}/user", any(eval::evalx_js_report))
        .route("/sdk/goals/{env_id}", get(goals::goals))
        .route("/ping/{env_id}", get(stream::stream_ping_js))
        .route("/eval/{env_id}/{user}", get(stream::stream_eval_js_get))
        .route("/eval/{env_id}", any(stream::stream_eval_js_report))
        .route("/events/bulk/{env_id}", post(events::js_bulk))
        .route("/events/diagnostic/{env_id}", post(events::js_diagnostic))
        .route("/a/{env_id}", get(events::js_image))
        .layer(from_fn_with_state(state.clone(), cors_middleware));

    Router::new()
        .route("/status", get(status::status))
        .merge(server_routes)
        .merge(mobile_routes)
        .merge(client_routes)
        .layer(from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EnvConfig};
    use crate::relay::Relay;
    use crate::sdk::FixedDataClientFactory;
    use crate::sdk::eval::FallthroughEvaluator;
    use crate::utils::secure_mode_hash;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use base64::Engine;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const SDK_KEY: &str = "sdk-abcdefgh-ijkl-4mno-pqrs-tuvwxyz01234";
    const MOBILE_KEY: &str = "mob-abcdefgh-ijkl-4mno-pqrs-tuvwxyz01234";
    const ENV_ID: &str = "envid1234567890";

    async fn test_router(secure_mode: bool) -> Router {
        let mut config = Config::default();
        config.environments.insert(
            "production".to_string(),
            EnvConfig {
                sdk_key: Some(SDK_KEY.to_string()),
                mobile_key: Some(MOBILE_KEY.to_string()),
                env_id: Some(ENV_ID.to_string()),
                secure_mode,
                allowed_origin: vec!["https://app.example".to_string()],
                ..Default::default()
            },
        );

        let flags = HashMap::from([
            (
                "f-client".to_string(),
                json!({
                    "key": "f-client", "version": 3, "on": true,
                    "clientSide": true,
                    "variations": [true, false],
                    "offVariation": 1,
                    "fallthrough": {"variation": 0}
                }),
            ),
            (
                "f-server".to_string(),
                json!({
                    "key": "f-server", "version": 5, "on": true,
                    "clientSide": false,
                    "variations": [true, false],
                    "offVariation": 1,
                    "fallthrough": {"variation": 0}
                }),
            ),
        ]);

        let relay = Relay::new(
            config,
            Arc::new(FixedDataClientFactory::new(flags, HashMap::new())),
            reqwest::Client::new(),
        )
        .await
        .unwrap();
        relay.wait_for_all(Duration::from_secs(5)).await.unwrap();
        router(AppState::new(relay, Arc::new(FallthroughEvaluator)))
    }

    fn encoded_user() -> String {
        base64::engine::general_purpose::STANDARD.encode(br#"{"key":"u"}"#)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_reports_healthy_with_obscured_key() {
        let app = test_router(false).await;
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        let entry = &body["environments"]["production"];
        assert_eq!(entry["status"], "connected");
        let obscured = entry["sdkKey"].as_str().unwrap();
        assert!(obscured.starts_with("sdk-") && obscured.ends_with("z01234"));
        assert!(obscured.contains('*'));
    }

    #[tokio::test]
    async fn js_eval_filters_to_client_side_flags() {
        let app = test_router(false).await;
        let uri = format!("/sdk/eval/{}/users/{}", ENV_ID, encoded_user());
        let response = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let results = body.as_object().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results["f-client"], json!(true));
    }

    #[tokio::test]
    async fn server_eval_requires_valid_sdk_key() {
        let app = test_router(false).await;
        let uri = format!("/sdk/eval/users/{}", encoded_user());

        let response = app
            .clone()
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::get(&uri)
                    .header(header::AUTHORIZATION, "sdk-wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get(&uri)
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn secure_mode_gates_js_eval() {
        let app = test_router(true).await;

        let uri = format!("/sdk/eval/{}/users/{}", ENV_ID, encoded_user());
        let response = app
            .clone()
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let good = secure_mode_hash(SDK_KEY, "u");
        let uri = format!(
            "/sdk/eval/{}/users/{}?h={}",
            ENV_ID,
            encoded_user(),
            good
        );
        let response = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn report_evaluation_with_user_in_body() {
        let app = test_router(false).await;
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("REPORT")
                    .uri("/sdk/evalx/user")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"key":"u"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["f-server"]["version"], json!(5));

        // Wrong content type on REPORT: 415.
        let response = app
            .oneshot(
                Request::builder()
                    .method("REPORT")
                    .uri("/sdk/evalx/user")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::from(r#"{"key":"u"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn streaming_endpoints_have_sse_headers() {
        let app = test_router(false).await;
        let response = app
            .oneshot(
                Request::get("/all")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    }

    #[tokio::test]
    async fn event_post_is_accepted() {
        let app = test_router(false).await;
        let response = app
            .oneshot(
                Request::post("/bulk")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("X-LaunchDarkly-Event-Schema", "3")
                    .body(Body::from(r#"[{"kind":"identify","key":"u"}]"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn preflight_answers_with_duplicated_options() {
        let app = test_router(false).await;
        let uri = format!("/sdk/eval/{}/users/{}", ENV_ID, encoded_user());
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri(&uri)
                    .header(header::ORIGIN, "https://app.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-methods")
                .unwrap(),
            "GET,OPTIONS,OPTIONS"
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://app.example"
        );
    }

    #[tokio::test]
    async fn cors_origin_falls_back_to_configured_origin() {
        let app = test_router(false).await;
        let uri = format!("/sdk/eval/{}/users/{}", ENV_ID, encoded_user());
        let response = app
            .oneshot(
                Request::get(&uri)
                    .header(header::ORIGIN, "https://elsewhere.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://app.example"
        );
    }

    #[tokio::test]
    async fn php_polling_etag_round_trip() {
        let app = test_router(false).await;
        let response = app
            .clone()
            .oneshot(
                Request::get("/sdk/flags")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let etag = response
            .headers()
            .get(header::ETAG)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                Request::get("/sdk/flags")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .header(header::IF_NONE_MATCH, &etag)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn php_single_flag_and_unknown_key() {
        let app = test_router(false).await;
        let response = app
            .clone()
            .oneshot(
                Request::get("/sdk/flags/f-server")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ETAG).unwrap(),
            "\"5\""
        );

        let response = app
            .oneshot(
                Request::get("/sdk/flags/nope")
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn image_beacon_returns_gif_and_accepts_events() {
        let app = test_router(false).await;
        let events = base64::engine::general_purpose::STANDARD
            .encode(br#"[{"kind":"identify","key":"u"}]"#);
        let uri = format!("/a/{}.gif?d={}", ENV_ID, events);
        let response = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/gif"
        );
    }

    #[tokio::test]
    async fn unknown_env_id_is_not_found() {
        let app = test_router(false).await;
        let uri = format!("/sdk/eval/{}/users/{}", "deadbeef", encoded_user());
        let response = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mobile_endpoints_use_mobile_key() {
        let app = test_router(false).await;
        let uri = format!("/msdk/eval/users/{}", encoded_user());
        let response = app
            .clone()
            .oneshot(
                Request::get(&uri)
                    .header(header::AUTHORIZATION, MOBILE_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // An SDK key is not a mobile key.
        let response = app
            .oneshot(
                Request::get(&uri)
                    .header(header::AUTHORIZATION, SDK_KEY)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
