//! Secret masking for request parameters

use std::collections::BTreeMap;

/// Replacement for masked values
pub const REDACTED: &str = "*****";

const SECRET_KEY_MARKERS: [&str; 3] = ["secret", "key", "password"];

/// Whether a parameter name looks like it carries a secret
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SECRET_KEY_MARKERS.iter().any(|marker| key.contains(marker))
}

/// Mask the values of secret-looking keys; everything else passes through
pub fn hide_secret_values(parameters: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    parameters
        .iter()
        .map(|(k, v)| {
            let value = if is_secret_key(k) {
                REDACTED.to_string()
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect()
}
