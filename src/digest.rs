//! Content fingerprints used as change detectors
//!
//! A fingerprint is the first 128 bits of a BLAKE3 digest, hex encoded.
//! JSON content is canonicalized first (object keys sorted, insignificant
//! whitespace removed) so that equal documents hash equally regardless of
//! key order. Anything that is not JSON is hashed byte for byte.

/// Number of digest bytes kept in a fingerprint
const FINGERPRINT_BYTES: usize = 16;

/// Compute the fingerprint of a configuration content string.
pub fn fingerprint(content: &str) -> String {
    let canonical = canonicalize(content);
    let hash = blake3::hash(canonical.as_bytes());

    hash.as_bytes()[..FINGERPRINT_BYTES]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// serde_json's default map is ordered, so re-serializing a parsed value
/// yields sorted keys.
fn canonicalize(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(value) => value.to_string(),
        Err(_) => content.to_string(),
    }
}
