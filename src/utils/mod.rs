// Utility functions

use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Obscure a credential for the status resource: keys of more than eight
/// characters keep their first four and last five characters with `*` in
/// between; anything shorter is returned unchanged.
pub fn obscure_key(key: &str) -> String {
    if key.len() > 8 {
        format!(
            "{}{}{}",
            &key[..4],
            "*".repeat(key.len() - 9),
            &key[key.len() - 5..]
        )
    } else {
        key.to_string()
    }
}

/// Secure-mode hash: lowercase hex HMAC-SHA256 of the user key, keyed by
/// the environment's SDK key.
pub fn secure_mode_hash(sdk_key: &str, user_key: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(sdk_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(user_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-shape comparison for the `?h=` parameter.
pub fn secure_mode_valid(sdk_key: &str, user_key: &str, provided: &str) -> bool {
    !provided.is_empty() && secure_mode_hash(sdk_key, user_key) == provided.to_lowercase()
}

/// Short ETag over the (key, version) pairs of a dataset: order-insensitive
/// and cheap to recompute per request.
pub fn dataset_etag<'a>(items: impl Iterator<Item = (&'a str, u64)>) -> String {
    let mut pairs: Vec<String> = items
        .map(|(key, version)| format!("{}:{}", key, version))
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Decode a user blob from a URL path segment. Clients are inconsistent
/// about which base64 alphabet they use, so both are accepted.
pub fn decode_user_base64(encoded: &str) -> Option<Vec<u8>> {
    BASE64
        .decode(encoded)
        .or_else(|_| BASE64_URL.decode(encoded))
        .ok()
}
