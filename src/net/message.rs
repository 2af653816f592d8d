//! Websocket envelope validation.

use serde_json::{json, Map, Value};

use crate::clock::now_millis;
use crate::error::{SecurityError, SecurityResult};

/// Parse and structurally check an inbound text frame.
pub fn validate_inbound(text: &str, max_size: usize) -> SecurityResult<Value> {
    if text.len() > max_size {
        return Err(SecurityError::MessageRejected(format!(
            "inbound message of {} bytes exceeds {} byte limit",
            text.len(),
            max_size
        )));
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SecurityError::MessageRejected(format!("invalid JSON: {}", e)))?;
    check_structure(&value)?;
    Ok(value)
}

/// Check and serialize an outbound message.
pub fn validate_outbound(value: &Value, max_size: usize) -> SecurityResult<String> {
    check_structure(value)?;
    let text = serde_json::to_string(value)?;
    if text.len() > max_size {
        return Err(SecurityError::MessageRejected(format!(
            "outbound message of {} bytes exceeds {} byte limit",
            text.len(),
            max_size
        )));
    }
    Ok(text)
}

fn check_structure(value: &Value) -> SecurityResult<()> {
    let map = value
        .as_object()
        .ok_or_else(|| SecurityError::MessageRejected("message must be a JSON object".into()))?;
    let kind = match map.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind.as_str(),
        _ => return Err(SecurityError::MessageRejected("missing 'type' discriminator".into())),
    };
    match kind {
        "subscribe" | "unsubscribe" => {
            let has_channel = map
                .get("channel")
                .and_then(Value::as_str)
                .is_some_and(|c| !c.is_empty());
            if !has_channel {
                return Err(SecurityError::MessageRejected(format!("'{}' requires a channel", kind)));
            }
        }
        "error" if !map.contains_key("message") && !map.contains_key("error") => {
            return Err(SecurityError::MessageRejected("'error' requires a message".into()));
        }
        _ => {}
    }
    Ok(())
}

pub fn subscribe_envelope(channel: &str, params: Option<Value>) -> Value {
    let mut envelope = Map::new();
    envelope.insert("type".into(), json!("subscribe"));
    envelope.insert("channel".into(), json!(channel));
    if let Some(params) = params {
        envelope.insert("params".into(), params);
    }
    envelope.insert("timestamp".into(), json!(now_millis()));
    envelope.insert("nonce".into(), json!(uuid::Uuid::new_v4().to_string()));
    Value::Object(envelope)
}

pub fn unsubscribe_envelope(channel: &str) -> Value {
    json!({
        "type": "unsubscribe",
        "channel": channel,
        "timestamp": now_millis(),
        "nonce": uuid::Uuid::new_v4().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_inbound_requires_type() {
        assert!(validate_inbound(r#"{"type":"trade","px":1}"#, MIB).is_ok());
        assert!(validate_inbound(r#"{"px":1}"#, MIB).is_err());
        assert!(validate_inbound(r#"[1,2]"#, MIB).is_err());
        assert!(validate_inbound("not json", MIB).is_err());
    }

    #[test]
    fn test_size_limit() {
        let big = format!(r#"{{"type":"blob","data":"{}"}}"#, "x".repeat(MIB));
        let err = validate_inbound(&big, MIB).unwrap_err();
        assert!(matches!(err, SecurityError::MessageRejected(_)));

        let value: Value = serde_json::from_str(&big).unwrap();
        assert!(validate_outbound(&value, MIB).is_err());
    }

    #[test]
    fn test_channel_required_for_subscriptions() {
        assert!(validate_outbound(&json!({"type": "subscribe"}), MIB).is_err());
        assert!(validate_outbound(&json!({"type": "subscribe", "channel": ""}), MIB).is_err());
        assert!(validate_outbound(&subscribe_envelope("blocks", None), MIB).is_ok());
    }

    #[test]
    fn test_envelope_shape() {
        let sub = subscribe_envelope("trades", Some(json!({"pair": "ETH/USDC"})));
        assert_eq!(sub["type"], "subscribe");
        assert_eq!(sub["channel"], "trades");
        assert_eq!(sub["params"]["pair"], "ETH/USDC");
        assert!(sub["timestamp"].as_u64().unwrap() > 0);

        let unsub = unsubscribe_envelope("trades");
        assert!(unsub.get("params").is_none());
        assert_ne!(unsub["nonce"], sub["nonce"]);
    }
}
