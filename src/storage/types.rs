//! Persisted record format and storage statistics.

use serde::{Deserialize, Serialize};

/// One encrypted value as written to disk (`<key>.enc`) or held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    /// Ciphertext with the GCM tag appended, base64.
    pub ciphertext: String,
    /// 96-bit nonce, base64. Fresh per write.
    pub iv: String,
    /// KDF salt, base64. Fresh per record.
    pub salt: String,
    pub algorithm: String,
    pub kdf: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub key_count: usize,
    pub storage_type: StorageType,
    /// Bytes on disk; `None` for memory storage.
    pub total_size: Option<u64>,
}
