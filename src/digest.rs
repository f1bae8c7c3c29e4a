/// Digest helpers shared by the hash chain, stage keys and function keys
///
/// Every cache key is a SHA-256 over a canonical JSON rendering. serde_json
/// maps are ordered by key, so the rendering is stable regardless of the order
/// in which callers assembled their arguments.
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Hash a serializable value via its sorted-key JSON form
pub fn digest_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value).map_err(Error::serialization)?;
    let encoded = serde_json::to_string(&canonical).map_err(Error::serialization)?;
    Ok(digest_bytes(encoded.as_bytes()))
}

/// SHA-256 of raw bytes, hex-encoded
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// First `len` hex characters of a digest
pub fn short(digest: &str, len: usize) -> &str {
    &digest[..len.min(digest.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_digest_json_ignores_key_order() {
        let a = json!({"b": 1, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": 1});
        assert_eq!(digest_json(&a).unwrap(), digest_json(&b).unwrap());
    }

    #[test]
    fn test_digest_json_is_order_sensitive_for_lists() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(digest_json(&a).unwrap(), digest_json(&b).unwrap());
    }

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(
            digest_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(short(&digest_bytes(b"hello"), 8), "2cf24dba");
    }
}
