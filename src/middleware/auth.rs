use axum::{
    Json,
    http::{HeaderMap, StatusCode, header},
};
use serde::Serialize;

/// The three SDK kinds the relay multiplexes. The kind decides where the
/// credential lives in a request and which endpoints accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkKind {
    Server,
    Mobile,
    JsClient,
}

/// A tagged credential. Server and mobile keys arrive in the Authorization
/// header; the environment ID is public and arrives as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Credential {
    SdkKey(String),
    MobileKey(String),
    EnvId(String),
}

impl Credential {
    pub fn kind(&self) -> SdkKind {
        match self {
            Credential::SdkKey(_) => SdkKind::Server,
            Credential::MobileKey(_) => SdkKind::Mobile,
            Credential::EnvId(_) => SdkKind::JsClient,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Credential::SdkKey(key) | Credential::MobileKey(key) | Credential::EnvId(key) => key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No credential where one was required (absent, empty, or containing
    /// whitespace).
    Missing,
    /// A credential was present but not usable as a header value.
    Malformed,
}

impl AuthError {
    /// Transport rendering: credential problems on server/mobile routes are
    /// 401s; the public env-ID namespace renders as 404 to avoid confirming
    /// which IDs exist.
    pub fn status_for(self, kind: SdkKind) -> StatusCode {
        match kind {
            SdkKind::Server | SdkKind::Mobile => StatusCode::UNAUTHORIZED,
            SdkKind::JsClient => StatusCode::NOT_FOUND,
        }
    }
}

/// Wire shape of every error body the relay produces.
#[derive(Serialize, Clone, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn error_body(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse::new(message)))
}

/// Extract the credential a route group expects. Total over the kind
/// variants: every request classifies to exactly one credential or one
/// error.
pub fn classify(
    kind: SdkKind,
    headers: &HeaderMap,
    env_id_path: Option<&str>,
) -> Result<Credential, AuthError> {
    match kind {
        SdkKind::Server => authorization_key(headers).map(Credential::SdkKey),
        SdkKind::Mobile => authorization_key(headers).map(Credential::MobileKey),
        SdkKind::JsClient => match env_id_path {
            Some(env_id) if !env_id.is_empty() => Ok(Credential::EnvId(env_id.to_string())),
            _ => Err(AuthError::Missing),
        },
    }
}

/// Authorization-header credential with the optional `api_key ` scheme
/// prefix stripped.
fn authorization_key(headers: &HeaderMap) -> Result<String, AuthError> {
    let raw = match headers.get(header::AUTHORIZATION) {
        Some(value) => value.to_str().map_err(|_| AuthError::Malformed)?,
        None => return Err(AuthError::Missing),
    };

    let key = raw.strip_prefix("api_key ").unwrap_or(raw);
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(AuthError::Missing);
    }
    Ok(key.to_string())
}
