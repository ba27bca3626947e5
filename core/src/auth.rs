use sha2::{Digest, Sha256};

/// Number of hex characters kept when fingerprinting a secret for logs.
const FINGERPRINT_LEN: usize = 12;

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short, stable identifier for a secret. Safe to log and to return to callers.
pub fn fingerprint(secret: &str) -> String {
    let mut digest = hash_token(secret);
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Whether `api_key` follows the upstream's secret-prefix convention.
///
/// An empty prefix disables the check.
pub fn has_expected_prefix(api_key: &str, prefix: &str) -> bool {
    prefix.is_empty() || api_key.starts_with(prefix)
}
