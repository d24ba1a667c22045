pub mod auth;
pub mod cors;

pub use auth::{Credential, ErrorResponse, SdkKind, classify};
