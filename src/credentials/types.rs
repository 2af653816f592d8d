use serde::{Deserialize, Serialize};
use std::fmt;

/// The active API key set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub primary: String,
    /// Most recently demoted key first.
    pub fallbacks: Vec<String>,
    pub created_at: u64,
    pub expires_at: u64,
    pub rotation_count: u64,
}

impl Credential {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn keys_count(&self) -> usize {
        1 + self.fallbacks.len()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("primary", &"[REDACTED]")
            .field("fallbacks", &self.fallbacks.len())
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("rotation_count", &self.rotation_count)
            .finish()
    }
}

/// Caller-supplied keys for [`ApiKeyManager::initialize`](super::ApiKeyManager::initialize).
#[derive(Clone, Default, Deserialize)]
pub struct InitialKeys {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStatus {
    pub is_rotation_enabled: bool,
    pub next_rotation: u64,
    pub rotation_count: u64,
    pub keys_count: usize,
}

/// Notifications published by the key manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    KeyRotated {
        rotation_count: u64,
        fallback_count: usize,
        expires_at: u64,
    },
}
