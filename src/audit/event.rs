use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::clock::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    ApiKeyRotation,
    FailedSignature,
    RateLimitExceeded,
    DdosAttempt,
    InvalidInput,
    OwaspViolation,
    CertificateMismatch,
    UnauthorizedAccess,
    Authentication,
    ApiUsage,
    DataAccess,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::ApiKeyRotation => "api_key_rotation",
            SecurityEventType::FailedSignature => "failed_signature",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::DdosAttempt => "ddos_attempt",
            SecurityEventType::InvalidInput => "invalid_input",
            SecurityEventType::OwaspViolation => "owasp_violation",
            SecurityEventType::CertificateMismatch => "certificate_mismatch",
            SecurityEventType::UnauthorizedAccess => "unauthorized_access",
            SecurityEventType::Authentication => "authentication",
            SecurityEventType::ApiUsage => "api_usage",
            SecurityEventType::DataAccess => "data_access",
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            event_type,
            severity,
            timestamp: now_millis(),
            description: description.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}
