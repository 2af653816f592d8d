use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{SecurityError, SecurityResult};

/// An authorized signer: address plus the key its signatures must verify against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerInfo {
    pub address: String,
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: String,
}

impl SignerInfo {
    /// Signer whose address is derived from its key.
    pub fn from_key(key: &VerifyingKey) -> Self {
        Self {
            address: address_for(key),
            public_key: hex::encode(key.to_bytes()),
        }
    }

    pub fn verifying_key(&self) -> SecurityResult<VerifyingKey> {
        let bytes: [u8; 32] = hex::decode(&self.public_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                SecurityError::InvalidInput(format!("signer {} has a malformed public key", self.address))
            })?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| {
            SecurityError::InvalidInput(format!("signer {} has an invalid public key", self.address))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigPolicy {
    pub threshold: usize,
    pub signers: Vec<SignerInfo>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub hardware_wallet_enabled: bool,
}

impl MultiSigPolicy {
    pub fn signer(&self, address: &str) -> Option<&SignerInfo> {
        self.signers.iter().find(|s| s.address == address)
    }

    pub fn is_authorized(&self, address: &str) -> bool {
        self.signer(address).is_some()
    }
}

fn default_algorithm() -> String {
    "ed25519".to_string()
}

/// A payload collecting threshold signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSigTransaction {
    pub id: String,
    pub data: Value,
    /// Hex SHA-256 of the canonical payload; this is what signers sign.
    pub payload_hash: String,
    pub required_signatures: usize,
    pub signing_addresses: Vec<String>,
    /// signer address -> base64 signature
    pub signatures: BTreeMap<String, String>,
    pub created_at: u64,
    pub algorithm: String,
    /// Set once verification succeeds; sealed transactions reject new signatures.
    pub sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedSignature {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub is_valid: bool,
    pub valid_signatures: usize,
    pub required_signatures: usize,
    pub rejected: Vec<RejectedSignature>,
}

impl VerificationReport {
    pub fn into_result(self) -> SecurityResult<Self> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(SecurityError::InsufficientSignatures {
                valid: self.valid_signatures,
                required: self.required_signatures,
            })
        }
    }
}

/// `0x` followed by the first 20 bytes of SHA-256(public key), hex.
pub fn address_for(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    format!("0x{}", hex::encode(&digest[..20]))
}
