//! Content fingerprints for units of work
//!
//! A task definition is serialized as compact JSON with object keys sorted and
//! hashed with SHA-512. The format must not change, or every existing cache
//! entry stops matching.

use crate::error::StratumResult;
use serde_json::Value;
use sha2::{Digest, Sha512};
use tracing::debug;

/// Hex SHA-512 of the canonical JSON form of `definition`
pub fn fingerprint(definition: &Value) -> StratumResult<String> {
    // serde_json's map keeps keys ordered, so nested objects come out sorted
    let canonical = serde_json::to_string(definition)?;
    debug!("content = {}", canonical);

    let mut hasher = Sha512::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"name": "x", "command": "true", "args": {"b": 1, "a": 2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"args": {"a": 2, "b": 1}, "command": "true", "name": "x"}"#).unwrap();
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn content_changes_fingerprint() {
        let a = fingerprint(&json!({"command": "touch /a"})).unwrap();
        let b = fingerprint(&json!({"command": "touch /b"})).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 128);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn uses_compact_sorted_form() {
        let value = json!({"b": [1, 2], "a": "x"});
        let expected = hex::encode(Sha512::digest(br#"{"a":"x","b":[1,2]}"#));
        assert_eq!(fingerprint(&value).unwrap(), expected);
    }
}
