// Per-environment CORS for the client-side (JS) endpoints.
//
// The policy is environment-specific (origin whitelist, extra allowed
// headers), so this is a hand-rolled middleware rather than a blanket
// tower-http layer: the environment is looked up from the request's
// `{env_id}` path segment. Preflight OPTIONS requests are answered here
// and never reach the handlers.

use axum::{
    extract::{RawPathParams, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::AppState;
use crate::middleware::auth::Credential;

/// Headers every client-side SDK is allowed to send.
const DEFAULT_ALLOWED_HEADERS: &str = "Cache-Control,Content-Type,Content-Length,Accept-Encoding,X-LaunchDarkly-User-Agent,X-LaunchDarkly-Payload-ID,X-LaunchDarkly-Wrapper,X-LaunchDarkly-Event-Schema";

const MAX_AGE_SECONDS: &str = "300";

/// The CORS decision for one request, computed from the environment's
/// whitelist and the request origin.
pub struct CorsPolicy {
    pub allow_origin: String,
    pub allow_headers: String,
}

pub fn policy_for(
    request_origin: Option<&str>,
    allowed_origins: &[String],
    extra_headers: &[String],
) -> CorsPolicy {
    // Matching origin -> echo it; configured but not matching -> first
    // configured origin; nothing configured -> wildcard.
    let allow_origin = match request_origin {
        Some(origin)
            if allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)) =>
        {
            origin.to_string()
        }
        _ => allowed_origins
            .first()
            .cloned()
            .unwrap_or_else(|| "*".to_string()),
    };

    let allow_headers = if extra_headers.is_empty() {
        DEFAULT_ALLOWED_HEADERS.to_string()
    } else {
        format!("{},{}", DEFAULT_ALLOWED_HEADERS, extra_headers.join(","))
    };

    CorsPolicy {
        allow_origin,
        allow_headers,
    }
}

fn apply(headers: &mut HeaderMap, policy: &CorsPolicy, method: &Method) {
    let set = |headers: &mut HeaderMap, name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };

    set(headers, "access-control-allow-origin", &policy.allow_origin);
    set(headers, "access-control-allow-headers", &policy.allow_headers);
    // The duplicated OPTIONS token is deliberate; some deployed SDK
    // versions expect this exact value.
    set(
        headers,
        "access-control-allow-methods",
        &format!("{},OPTIONS,OPTIONS", method.as_str()),
    );
    set(headers, "access-control-allow-credentials", "false");
    set(headers, "access-control-expose-headers", "Date");
    set(headers, "access-control-max-age", MAX_AGE_SECONDS);
}

/// Middleware for the client-side route groups.
pub async fn cors_middleware(
    State(state): State<AppState>,
    params: RawPathParams,
    request: Request,
    next: Next,
) -> Response {
    let env_id = params
        .iter()
        .find(|(name, _)| *name == "env_id")
        .map(|(_, value)| value.to_string());

    // Unknown environments still get CORS headers (with defaults) so that
    // browsers surface the real 404 instead of a CORS failure.
    let env = match &env_id {
        Some(env_id) => {
            state
                .relay
                .get_environment(&Credential::EnvId(env_id.clone()))
                .await
        }
        None => None,
    };
    let (allowed_origins, extra_headers) = match &env {
        Some(env) => (
            env.config().allowed_origin.clone(),
            env.config().allowed_header.clone(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let policy = policy_for(origin.as_deref(), &allowed_origins, &extra_headers);

    if request.method() == Method::OPTIONS {
        let requested = request
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_METHOD)
            .and_then(|v| v.to_str().ok())
            .and_then(|m| m.parse::<Method>().ok())
            .unwrap_or(Method::GET);
        let mut response = StatusCode::OK.into_response();
        apply(response.headers_mut(), &policy, &requested);
        return response;
    }

    let method = request.method().clone();
    let mut response = next.run(request).await;
    apply(response.headers_mut(), &policy, &method);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_origin_is_echoed() {
        let allowed = vec!["https://a.example".to_string(), "https://b.example".to_string()];
        let policy = policy_for(Some("https://b.example"), &allowed, &[]);
        assert_eq!(policy.allow_origin, "https://b.example");
    }

    #[test]
    fn non_matching_origin_falls_back_to_first_configured() {
        let allowed = vec!["https://a.example".to_string()];
        let policy = policy_for(Some("https://evil.example"), &allowed, &[]);
        assert_eq!(policy.allow_origin, "https://a.example");
    }

    #[test]
    fn no_configuration_means_wildcard() {
        let policy = policy_for(Some("https://any.example"), &[], &[]);
        assert_eq!(policy.allow_origin, "*");
        let policy = policy_for(None, &[], &[]);
        assert_eq!(policy.allow_origin, "*");
    }

    #[test]
    fn extra_headers_are_appended() {
        let policy = policy_for(None, &[], &["X-Custom".to_string(), "X-Other".to_string()]);
        assert!(policy.allow_headers.starts_with(DEFAULT_ALLOWED_HEADERS));
        assert!(policy.allow_headers.ends_with(",X-Custom,X-Other"));
    }

    #[test]
    fn preflight_methods_value_duplicates_options() {
        let mut headers = HeaderMap::new();
        apply(
            &mut headers,
            &policy_for(None, &[], &[]),
            &Method::GET,
        );
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "GET,OPTIONS,OPTIONS"
        );
        assert_eq!(
            headers.get("access-control-allow-credentials").unwrap(),
            "false"
        );
        assert_eq!(headers.get("access-control-expose-headers").unwrap(), "Date");
        assert_eq!(headers.get("access-control-max-age").unwrap(), "300");
    }
}
