use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::signing::canonical;

pub const ALGORITHM: &str = "ed25519";

/// Signing key pair as persisted under `signing_keypair`.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredKeyPair {
    /// Hex-encoded 32-byte verifying key.
    pub public_key: String,
    /// Hex-encoded 32-byte secret seed.
    pub private_key: String,
    pub algorithm: String,
    pub created_at: u64,
}

impl fmt::Debug for StoredKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A signed outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Value,
    /// Base64 Ed25519 signature over [`canonical_payload`](Self::canonical_payload).
    pub signature: String,
    pub timestamp: u64,
    pub nonce: String,
    /// Hex-encoded verifying key.
    pub public_key: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl SignedEnvelope {
    pub fn canonical_payload(&self) -> String {
        canonical::request_payload(&self.data, self.timestamp, &self.nonce)
    }
}

/// A signed response bound to the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedResponse {
    pub data: Value,
    pub signature: String,
    pub timestamp: u64,
    pub nonce: String,
    pub request_nonce: String,
    pub public_key: String,
}

impl SignedResponse {
    pub fn canonical_payload(&self) -> String {
        canonical::response_payload(&self.data, self.timestamp, &self.nonce, &self.request_nonce)
    }
}

fn default_algorithm() -> String {
    ALGORITHM.to_string()
}
