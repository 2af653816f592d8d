//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and cross-field
//! constraints. Returns every problem found, not just the first.

use std::fmt;
use crate::config::schema::SecurityConfig;

/// A single semantic configuration problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting all errors.
pub fn validate_config(config: &SecurityConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.api_keys.key_length < 16 {
        errors.push(ValidationError::new("api_keys.key_length", "must be at least 16 bytes"));
    }

    let rl = &config.rate_limit;
    if rl.requests_per_window == 0 {
        errors.push(ValidationError::new("rate_limit.requests_per_window", "must be > 0"));
    }
    if rl.window_ms == 0 {
        errors.push(ValidationError::new("rate_limit.window_ms", "must be > 0"));
    }
    if rl.queue_ttl_secs == 0 {
        errors.push(ValidationError::new("rate_limit.queue_ttl_secs", "must be > 0"));
    }

    if config.signing.replay_tolerance_secs == 0 {
        errors.push(ValidationError::new("signing.replay_tolerance_secs", "must be > 0"));
    }

    let st = &config.storage;
    if st.pbkdf2_iterations == 0 {
        errors.push(ValidationError::new("storage.pbkdf2_iterations", "must be > 0"));
    }
    if st.scrypt_log_n == 0 || st.scrypt_log_n >= 64 {
        errors.push(ValidationError::new("storage.scrypt_log_n", "must be in 1..64"));
    }

    if config.audit.enabled && config.audit.buffer_size == 0 {
        errors.push(ValidationError::new("audit.buffer_size", "must be > 0"));
    }
    if let Some(endpoint) = &config.audit.remote_endpoint {
        match url::Url::parse(endpoint) {
            Ok(u) if u.scheme() == "https" => {}
            Ok(_) => errors.push(ValidationError::new("audit.remote_endpoint", "must use https")),
            Err(e) => errors.push(ValidationError::new("audit.remote_endpoint", e.to_string())),
        }
    }

    let ws = &config.websocket;
    for pin in &ws.certificate_pins {
        let cleaned: String = pin.chars().filter(|c| *c != ':').collect();
        if cleaned.len() != 64 || hex::decode(&cleaned).is_err() {
            errors.push(ValidationError::new(
                "websocket.certificate_pins",
                format!("'{}' is not a SHA-256 hex fingerprint", pin),
            ));
        }
    }
    if ws.heartbeat_interval_secs == 0 {
        errors.push(ValidationError::new("websocket.heartbeat_interval_secs", "must be > 0"));
    }
    if ws.reconnect_delay_ms > ws.max_reconnect_delay_ms {
        errors.push(ValidationError::new(
            "websocket.reconnect_delay_ms",
            "must not exceed max_reconnect_delay_ms",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
