//! Hardware signer seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SecurityResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub firmware_version: String,
}

/// A device that holds a signer's private key and signs transaction hashes.
#[async_trait]
pub trait HardwareSigner: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Hex-encoded Ed25519 verifying key held by the device.
    async fn get_public_key(&self) -> SecurityResult<String>;

    /// Base64 signature over the 32-byte payload hash.
    async fn sign(&self, hash: &[u8]) -> SecurityResult<String>;

    async fn get_device_info(&self) -> SecurityResult<DeviceInfo>;
}
