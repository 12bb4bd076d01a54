//! Canonical serialization of the negotiated terms.
//!
//! Both parties sign a hash of the merged terms document ("tsAndCs"), so
//! its serialization must be stable byte-for-byte across implementations:
//! object keys in lexicographic (byte-order) order, no whitespace between
//! tokens, UTF-8, no trailing newline. The terms hash is the SHA-256 of
//! the canonical bytes, and signatures are computed over the
//! lowercase-hex encoding of that hash.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum nesting depth accepted during canonicalization.
pub const MAX_DEPTH: usize = 128;

/// Errors from canonicalization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The value could not be serialized to JSON at all.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The value nests deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: value nested deeper than {MAX_DEPTH} levels")]
    MaxDepthExceeded,
}

/// Serializes a value to its canonical JSON text.
///
/// # Errors
///
/// Returns [`CanonicalError`] on serialization failure or excessive
/// nesting.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out, 0)?;
    Ok(out)
}

/// SHA-256 of the canonical text, lowercase hex.
#[must_use]
pub fn terms_hash(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

fn write_canonical(value: &Value, out: &mut String, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded);
    }
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json's scalar encoder handles string escaping.
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[*key], out, depth + 1)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out, depth + 1)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted_recursively() {
        let v = json!({"z": 1, "a": {"y": true, "b": [3, 2, 1]}});
        let c = to_canonical_json(&v).unwrap();
        assert_eq!(c, r#"{"a":{"b":[3,2,1],"y":true},"z":1}"#);
    }

    #[test]
    fn test_no_insignificant_whitespace_or_newline() {
        let v = json!({"name": "a b", "n": 1});
        let c = to_canonical_json(&v).unwrap();
        assert!(!c.contains('\n'));
        assert!(!c.contains(": "));
        assert!(!c.ends_with('\n'));
    }

    #[test]
    fn test_parse_then_canonicalize_is_stable() {
        let text = r#"{"b":2,"a":[{"k":"v"}],"c":"x"}"#;
        let v: serde_json::Value = serde_json::from_str(text).unwrap();
        let once = to_canonical_json(&v).unwrap();
        let v2: serde_json::Value = serde_json::from_str(&once).unwrap();
        let twice = to_canonical_json(&v2).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_terms_hash_is_lowercase_hex() {
        let h = terms_hash("{}");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Stable vector: SHA-256 of "{}".
        assert_eq!(
            h,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_depth_limit() {
        let mut v = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            v = json!([v]);
        }
        assert!(matches!(
            to_canonical_json(&v),
            Err(CanonicalError::MaxDepthExceeded)
        ));
    }
}
