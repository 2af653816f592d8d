//! Error taxonomy shared by every security component.
//!
//! Callers get a typed error naming the failure kind. [`SecurityError::kind`]
//! separates transient failures (worth retrying later) from fatal and
//! business-level ones.

use thiserror::Error;

/// Coarse classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry after a delay (rate limit window reset, transient network).
    Transient,
    /// Never retry with the same inputs (bad signature, pin mismatch).
    Fatal,
    /// Caller must change inputs (collect more signers, initialize storage).
    Business,
    /// Misconfiguration detected at setup time.
    Configuration,
}

/// Errors produced by the security subsystem.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Rate limit exceeded for '{identifier}', retry after {retry_after_ms} ms")]
    RateLimitExceeded { identifier: String, retry_after_ms: u64 },

    #[error("Admission queue full for '{0}'")]
    QueueFull(String),

    #[error("Queued request timed out after {0} seconds")]
    RequestTimeout(u64),

    #[error("DDoS protection triggered: {0}")]
    DdosDetected(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Replay detected: {0}")]
    ReplayDetected(String),

    #[error("Certificate pin mismatch (leaf fingerprint {fingerprint})")]
    CertificatePinMismatch { fingerprint: String },

    #[error("Insufficient signatures: {valid} valid of {required} required")]
    InsufficientSignatures { valid: usize, required: usize },

    #[error("Insufficient signers. Required: {required}, Provided: {provided}")]
    InsufficientSigners { required: usize, provided: usize },

    #[error("Signer '{0}' is not authorized")]
    UnauthorizedSigner(String),

    #[error("Transaction {0} already verified and sealed")]
    TransactionSealed(String),

    #[error("Hardware wallet error: {0}")]
    HardwareWallet(String),

    #[error("Key '{0}' not found in secure storage")]
    StorageKeyNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("API key rotation is disabled")]
    RotationDisabled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Blocked by policy: {0}")]
    PolicyViolation(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0} not initialized")]
    NotInitialized(&'static str),
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::RateLimitExceeded { .. }
            | SecurityError::RequestTimeout(_)
            | SecurityError::WebSocket(_)
            | SecurityError::Transport(_) => ErrorKind::Transient,

            SecurityError::QueueFull(_)
            | SecurityError::DdosDetected(_)
            | SecurityError::SignatureInvalid(_)
            | SecurityError::ReplayDetected(_)
            | SecurityError::CertificatePinMismatch { .. }
            | SecurityError::Crypto(_)
            | SecurityError::TransactionSealed(_)
            | SecurityError::MessageRejected(_)
            | SecurityError::PolicyViolation(_) => ErrorKind::Fatal,

            SecurityError::InsufficientSignatures { .. }
            | SecurityError::InsufficientSigners { .. }
            | SecurityError::UnauthorizedSigner(_)
            | SecurityError::HardwareWallet(_)
            | SecurityError::StorageKeyNotFound(_)
            | SecurityError::Storage(_)
            | SecurityError::Serialization(_)
            | SecurityError::InvalidInput(_)
            | SecurityError::NotInitialized(_) => ErrorKind::Business,

            SecurityError::RotationDisabled | SecurityError::InvalidConfig(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// True for kinds a caller may retry later without changing inputs.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short label used for metrics and audit metadata.
    pub fn label(&self) -> &'static str {
        match self {
            SecurityError::RateLimitExceeded { .. } => "rate_limit",
            SecurityError::QueueFull(_) => "queue_full",
            SecurityError::RequestTimeout(_) => "timeout",
            SecurityError::DdosDetected(_) => "ddos",
            SecurityError::SignatureInvalid(_) => "signature",
            SecurityError::ReplayDetected(_) => "replay",
            SecurityError::CertificatePinMismatch { .. } => "certificate_pin",
            SecurityError::InsufficientSignatures { .. } => "insufficient_signatures",
            SecurityError::InsufficientSigners { .. } => "insufficient_signers",
            SecurityError::UnauthorizedSigner(_) => "unauthorized_signer",
            SecurityError::TransactionSealed(_) => "sealed",
            SecurityError::HardwareWallet(_) => "hardware_wallet",
            SecurityError::StorageKeyNotFound(_) => "storage_key_not_found",
            SecurityError::Storage(_) => "storage",
            SecurityError::Crypto(_) => "crypto",
            SecurityError::Serialization(_) => "serialization",
            SecurityError::RotationDisabled => "rotation_disabled",
            SecurityError::InvalidConfig(_) => "config",
            SecurityError::InvalidInput(_) => "input",
            SecurityError::PolicyViolation(_) => "policy",
            SecurityError::WebSocket(_) => "websocket",
            SecurityError::MessageRejected(_) => "message",
            SecurityError::Transport(_) => "transport",
            SecurityError::NotInitialized(_) => "not_initialized",
        }
    }
}

impl From<std::io::Error> for SecurityError {
    fn from(e: std::io::Error) -> Self {
        SecurityError::Storage(e.to_string())
    }
}

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;
