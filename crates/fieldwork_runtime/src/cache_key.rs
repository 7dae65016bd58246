//! Cache keys for producer results.
//!
//! Keys are SHA-256 digests over a canonical encoding: object members are
//! hashed in key order, so two JSON values that compare equal always hash
//! equally. The version is part of both the digest and the key text; bump
//! [`CACHE_KEY_VERSION`] whenever the encoding or the key layout changes.
//!
//! Layout:
//! - `v1:<prefix digest>:context` stores the context tokens of the field.
//! - `v1:<prefix digest>:result:<context digest>` stores value and metadata.

use crate::contexts::ContextKeys;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Current version of the key encoding.
pub const CACHE_KEY_VERSION: u32 = 1;

/// Computes the prefix key from the producer id, its edge cache vectors and
/// the concrete values of its declared cache contexts.
pub fn prefix_key(producer: &str, vectors: &Value, keys: &ContextKeys) -> String {
    let mut state = Sha256::new();
    state.update(format!("fieldwork:{}:", CACHE_KEY_VERSION).as_bytes());
    state.update(b"producer:");
    hash_value(&mut state, &Value::from(producer));
    state.update(b"vectors:");
    hash_value(&mut state, vectors);
    state.update(b"keys:");
    hash_keys(&mut state, keys);

    format!("v{}:{}", CACHE_KEY_VERSION, hex::encode(state.finalize()))
}

/// The key under which the field's context tokens are stored.
pub fn context_key(prefix: &str) -> String {
    format!("{}:context", prefix)
}

/// The key under which the result for the given context values is stored.
pub fn result_key(prefix: &str, keys: &ContextKeys) -> String {
    let mut state = Sha256::new();
    hash_keys(&mut state, keys);
    format!("{}:result:{}", prefix, hex::encode(state.finalize()))
}

fn hash_keys(state: &mut Sha256, keys: &ContextKeys) {
    state.update(b"{");
    for (token, value) in keys {
        hash_value(state, &Value::from(token.as_str()));
        state.update(b":");
        hash_value(state, value);
        state.update(b",");
    }
    state.update(b"}");
}

/// Feeds an order-insensitive encoding of `value` into the hasher.
fn hash_value(state: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut members: Vec<(&String, &Value)> = map.iter().collect();
            members.sort_by(|a, b| a.0.cmp(b.0));
            state.update(b"{");
            for (key, member) in members {
                hash_value(state, &Value::from(key.as_str()));
                state.update(b":");
                hash_value(state, member);
                state.update(b",");
            }
            state.update(b"}");
        }
        Value::Array(items) => {
            state.update(b"[");
            for item in items {
                hash_value(state, item);
                state.update(b",");
            }
            state.update(b"]");
        }
        scalar => state.update(scalar.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(pairs: &[(&str, &str)]) -> ContextKeys {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_prefix_is_deterministic_and_versioned() {
        let a = prefix_key("entity_load", &json!({"type": "node", "id": 1}), &ContextKeys::new());
        let b = prefix_key("entity_load", &json!({"id": 1, "type": "node"}), &ContextKeys::new());

        assert_eq!(a, b);
        assert!(a.starts_with("v1:"));
        assert_eq!(a.len(), "v1:".len() + 64);
    }

    #[test]
    fn test_prefix_varies_by_every_component() {
        let base = prefix_key("p", &json!({"id": 1}), &keys(&[("user.roles", "editor")]));

        assert_ne!(base, prefix_key("q", &json!({"id": 1}), &keys(&[("user.roles", "editor")])));
        assert_ne!(base, prefix_key("p", &json!({"id": 2}), &keys(&[("user.roles", "editor")])));
        assert_ne!(base, prefix_key("p", &json!({"id": 1}), &keys(&[("user.roles", "admin")])));
        assert_ne!(base, prefix_key("p", &json!({"id": "1"}), &keys(&[("user.roles", "editor")])));
    }

    #[test]
    fn test_result_key_layout() {
        let prefix = prefix_key("p", &Value::Null, &ContextKeys::new());
        let empty = result_key(&prefix, &ContextKeys::new());
        let varied = result_key(&prefix, &keys(&[("timezone", "UTC")]));

        assert!(empty.starts_with(&format!("{}:result:", prefix)));
        assert_ne!(empty, varied);
        assert_eq!(context_key(&prefix), format!("{}:context", prefix));
    }

    #[test]
    fn test_context_values_of_different_types_do_not_collide() {
        let prefix = prefix_key("p", &Value::Null, &ContextKeys::new());
        let key = |value: Value| {
            let keys: ContextKeys = [("user.roles".to_string(), value)].into_iter().collect();
            (prefix_key("p", &Value::Null, &keys), result_key(&prefix, &keys))
        };

        assert_ne!(key(Value::Null), key(json!("null")));
        assert_ne!(key(json!(1)), key(json!("1")));
        assert_ne!(key(json!(true)), key(json!("true")));
        assert_ne!(key(json!(["a"])), key(json!("[\"a\"]")));
    }
}
