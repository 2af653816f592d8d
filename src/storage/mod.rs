//! Encrypted at-rest storage.
//!
//! # Data Flow
//! ```text
//! value (Serialize)
//!     → serde_json bytes
//!     → cipher.rs (PBKDF2/scrypt per-record key, AES-256-GCM, key name as AAD)
//!     → EncryptedRecord JSON
//!     → backend.rs (memory map | <dir>/<key>.enc, write-then-rename)
//! ```
//!
//! Master key rotation re-encrypts every record in memory, writes the batch,
//! and only then swaps the active secret.

pub mod backend;
pub mod cipher;
pub mod secure;
pub mod types;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use cipher::RecordCipher;
pub use secure::{generate_master_secret, SecureStorage};
pub use types::{EncryptedRecord, StorageStats, StorageType};
