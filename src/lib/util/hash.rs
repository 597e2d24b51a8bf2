//! Hashing helpers used by the module cache (source-directory keys) and the build artifact
//! (deterministic config hash).

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Renders a digest as lowercase hex, matching `elba`'s own `hexify_hash` convention.
pub fn hexify(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hexify(&hasher.finalize())
}

/// Recursively sorts every object's keys so two structurally-equal JSON values serialize
/// identically regardless of field-insertion order. Arrays keep their original order: member
/// order is meaningful there (module declaration order), but object key order never is.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hashes a canonicalized config value together with the environment name:
/// `sha256(canonical_json + "\n--separator--\n" + env)`.
pub fn config_hash(value: &Value, env: &str) -> String {
    let canonical = canonicalize(value);
    let serialized = serde_json::to_string(&canonical).expect("json values always serialize");
    let mut payload = serialized.into_bytes();
    payload.extend_from_slice(b"\n--separator--\n");
    payload.extend_from_slice(env.as_bytes());
    sha256_hex(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn config_hash_is_deterministic() {
        let v = json!({"name": "sample"});
        let h1 = config_hash(&v, "production");
        let h2 = config_hash(&v, "production");
        let h3 = config_hash(&v, "staging");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn config_hash_ignores_key_order() {
        let a = json!({"name": "sample", "modules": {"zeta": 1, "alpha": 2}});
        let b = json!({"modules": {"alpha": 2, "zeta": 1}, "name": "sample"});
        assert_eq!(config_hash(&a, "production"), config_hash(&b, "production"));
    }
}
