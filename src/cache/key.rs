//! Content addressing for cached responses.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Namespace used when the caller supplies nothing usable.
const DEFAULT_NAMESPACE: &str = "default";

/// Normalize a namespace so it is safe inside a file name.
///
/// Lowercases and replaces anything outside `[a-z0-9_]` with `_`.
pub fn normalize_namespace(namespace: &str) -> String {
  let normalized: String = namespace
    .trim()
    .to_lowercase()
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '_' {
        c
      } else {
        '_'
      }
    })
    .collect();

  if normalized.is_empty() {
    DEFAULT_NAMESPACE.to_string()
  } else {
    normalized
  }
}

/// Compute the cache key for a payload: `<namespace>-<sha256 hex>`.
///
/// `serde_json` keeps object keys sorted, so payloads that differ only in
/// key order serialize (and hash) identically.
pub fn content_key(namespace: &str, payload: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(payload.to_string().as_bytes());
  let digest = hex::encode(hasher.finalize());

  format!("{}-{}", normalize_namespace(namespace), digest)
}

/// Prefix shared by every key in `namespace`.
pub fn namespace_prefix(namespace: &str) -> String {
  format!("{}-", normalize_namespace(namespace))
}
