//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the security
//! subsystem. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the security subsystem.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// API key rotation settings.
    pub api_keys: ApiKeyConfig,

    /// Request/response signing settings.
    pub signing: SigningConfig,

    /// Threshold signature settings.
    pub multisig: MultiSigSettings,

    /// Admission control and DDoS heuristics.
    pub rate_limit: RateLimitConfig,

    /// Encrypted at-rest storage.
    pub storage: StorageConfig,

    /// Audit log settings.
    pub audit: AuditConfig,

    /// Hardened websocket transport.
    pub websocket: WebSocketConfig,

    /// Input sanitization and policy scanning.
    pub validation: ValidationConfig,
}

/// API key lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Allow rotation at all (lazy, forced and background).
    pub rotation_enabled: bool,

    /// Lifetime of a primary key in seconds.
    pub rotation_interval_secs: u64,

    /// Capacity of the fallback ring.
    pub max_fallback_keys: usize,

    /// Random bytes per generated key.
    pub key_length: usize,

    /// Rotate on a timer in addition to lazy rotation on expiry.
    pub background_rotation: bool,
}

impl ApiKeyConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            rotation_enabled: true,
            rotation_interval_secs: 24 * 60 * 60,
            max_fallback_keys: 3,
            key_length: 32,
            background_rotation: false,
        }
    }
}

/// Request signing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Sign outbound requests.
    pub enabled: bool,

    /// Allowed clock difference for signed envelopes, in seconds.
    pub replay_tolerance_secs: u64,

    /// Signing key pair age that triggers rotation, in seconds.
    pub key_max_age_secs: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            replay_tolerance_secs: 5 * 60,
            key_max_age_secs: 30 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MultiSigSettings {
    pub enabled: bool,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admitted requests per identifier per window.
    pub requests_per_window: u32,

    /// Fixed window length in milliseconds.
    pub window_ms: u64,

    /// Pending admissions held per identifier once the window is full (0 disables queuing).
    pub max_queue_size: usize,

    /// Hard lifetime of a queued admission in seconds.
    pub queue_ttl_secs: u64,

    /// Requests closer together than this count as a burst.
    pub burst_gap_ms: u64,

    /// Burst requests tolerated per window before rejecting.
    pub burst_limit: u32,

    /// Enable the system-wide DDoS heuristics.
    pub ddos_protection: bool,

    /// Aggregate admitted requests per second that trips DDoS protection.
    pub ddos_threshold: u64,

    /// Missing/short user-agent requests per minute before rejecting.
    pub suspicious_agent_threshold: u64,

    /// Shortest user-agent considered legitimate.
    pub min_user_agent_len: usize,

    /// Idle entry eviction period in seconds.
    pub cleanup_interval_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window_ms: 60_000,
            max_queue_size: 50,
            queue_ttl_secs: 5 * 60,
            burst_gap_ms: 100,
            burst_limit: 10,
            ddos_protection: true,
            ddos_threshold: 1000,
            suspicious_agent_threshold: 50,
            min_user_agent_len: 10,
            cleanup_interval_secs: 60,
        }
    }
}

/// Key derivation function used for at-rest encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfKind {
    Pbkdf2,
    Scrypt,
}

/// Encrypted storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `<key>.enc` records.
    pub directory: PathBuf,

    /// Keep records in memory only.
    pub memory_only: bool,

    pub kdf: KdfKind,

    pub pbkdf2_iterations: u32,

    /// scrypt cost as log2(N).
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join(".hypersim-secure"),
            memory_only: false,
            kdf: KdfKind::Pbkdf2,
            pbkdf2_iterations: 100_000,
            scrypt_log_n: 14,
            scrypt_r: 8,
            scrypt_p: 1,
        }
    }
}

/// Audit log configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,

    /// Directory for JSON-lines audit files.
    pub log_directory: PathBuf,

    /// Size in bytes at which the current log file is rotated.
    pub max_log_size: u64,

    /// Start a new file at each UTC day boundary.
    pub rotate_daily: bool,

    /// Events held before a forced flush.
    pub buffer_size: usize,

    /// Timer flush period in seconds.
    pub flush_interval_secs: u64,

    /// Optional HTTPS endpoint receiving batched events.
    pub remote_endpoint: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_directory: std::env::temp_dir().join(".hypersim-audit"),
            max_log_size: 10 * 1024 * 1024, // 10MB
            rotate_daily: true,
            buffer_size: 100,
            flush_interval_secs: 30,
            remote_endpoint: None,
        }
    }
}

/// Websocket transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Allowed SHA-256 fingerprints (hex, colons optional) of the server leaf certificate.
    pub certificate_pins: Vec<String>,

    pub heartbeat_interval_secs: u64,

    /// Base reconnect delay in milliseconds.
    pub reconnect_delay_ms: u64,

    pub max_reconnect_delay_ms: u64,

    pub max_reconnect_attempts: u32,

    /// Largest accepted message in bytes.
    pub max_message_size: usize,

    /// Queued outbound messages older than this are dropped on reconnect.
    pub queue_max_age_secs: u64,

    /// Randomize reconnect delays by up to 10%.
    pub jitter: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            certificate_pins: Vec::new(),
            heartbeat_interval_secs: 30,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            max_message_size: 1024 * 1024, // 1MiB
            queue_max_age_secs: 5 * 60,
            jitter: true,
        }
    }
}

/// Sanitizer strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    Strict,
    Moderate,
    Basic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub level: ValidationLevel,

    /// Run the policy scanner on every request.
    pub policy_scan: bool,

    /// Reject requests with policy findings instead of only logging them.
    pub block_on_policy_findings: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            level: ValidationLevel::Strict,
            policy_scan: true,
            block_on_policy_findings: false,
        }
    }
}
