//! Canonical JSON encoding for signatures.
//!
//! Object keys are sorted recursively and `null` object members are dropped,
//! so two semantically equal payloads always produce the same bytes.

use serde_json::{Map, Value};

pub fn canonicalize(value: &Value) -> String {
    normalize(value).to_string()
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                let member = &map[key];
                if !member.is_null() {
                    sorted.insert(key.clone(), normalize(member));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Bytes covered by a request signature.
pub fn request_payload(data: &Value, timestamp: u64, nonce: &str) -> String {
    canonicalize(&serde_json::json!({
        "data": data,
        "nonce": nonce,
        "timestamp": timestamp,
    }))
}

/// Bytes covered by a response signature; binds the originating request nonce.
pub fn response_payload(data: &Value, timestamp: u64, nonce: &str, request_nonce: &str) -> String {
    canonicalize(&serde_json::json!({
        "data": data,
        "nonce": nonce,
        "request_nonce": request_nonce,
        "timestamp": timestamp,
    }))
}
