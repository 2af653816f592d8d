//! Encrypted key-value store.

use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::config::StorageConfig;
use crate::error::{SecurityError, SecurityResult};
use crate::storage::backend::{sanitize_key, FileBackend, MemoryBackend, StorageBackend};
use crate::storage::cipher::RecordCipher;
use crate::storage::types::{EncryptedRecord, StorageStats};

/// Encrypted persistence shared by the credential, signing and multisig components.
///
/// Record keys are bound into each record's authentication tag, so a record
/// copied under another key name fails to decrypt.
pub struct SecureStorage {
    backend: Arc<dyn StorageBackend>,
    cipher: RecordCipher,
    master: RwLock<SecretString>,
}

impl SecureStorage {
    /// Open storage per `config`.
    ///
    /// A file store that cannot be created degrades to memory with a warning.
    /// Without `master_secret` a random one is generated, which makes file
    /// records unreadable after restart.
    pub async fn open(config: &StorageConfig, master_secret: Option<SecretString>) -> SecurityResult<Self> {
        let backend: Arc<dyn StorageBackend> = if config.memory_only {
            Arc::new(MemoryBackend::new())
        } else {
            match FileBackend::open(&config.directory).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    tracing::warn!(
                        directory = %config.directory.display(),
                        error = %e,
                        "Failed to initialize secure storage directory, using memory-only"
                    );
                    Arc::new(MemoryBackend::new())
                }
            }
        };

        let master = match master_secret {
            Some(secret) => secret,
            None => {
                if !config.memory_only {
                    tracing::warn!("No master secret supplied, generated an ephemeral one");
                }
                generate_master_secret()
            }
        };

        Ok(Self::with_backend(backend, RecordCipher::from_config(config), master))
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>, cipher: RecordCipher, master: SecretString) -> Self {
        Self {
            backend,
            cipher,
            master: RwLock::new(master),
        }
    }

    /// Memory-only store with a random master secret.
    pub fn in_memory(config: &StorageConfig) -> Self {
        Self::with_backend(
            Arc::new(MemoryBackend::new()),
            RecordCipher::from_config(config),
            generate_master_secret(),
        )
    }

    pub async fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> SecurityResult<()> {
        let key = sanitize_key(key)?;
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let master = self.master.read().await;
        let record = self.seal(master.expose_secret(), plaintext, key.as_bytes().to_vec()).await?;
        self.backend.write(&key, serde_json::to_vec(&record)?).await?;
        tracing::debug!(key = %key, "Stored encrypted record");
        Ok(())
    }

    pub async fn retrieve<T: DeserializeOwned>(&self, key: &str) -> SecurityResult<T> {
        let key = sanitize_key(key)?;
        let master = self.master.read().await;
        let record = self.load_record(&key).await?;
        let plaintext = self.open_record(master.expose_secret(), record, key.as_bytes().to_vec()).await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub async fn exists(&self, key: &str) -> SecurityResult<bool> {
        let key = sanitize_key(key)?;
        Ok(self.backend.read(&key).await?.is_some())
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> SecurityResult<bool> {
        let key = sanitize_key(key)?;
        self.backend.delete(&key).await
    }

    pub async fn list_keys(&self) -> SecurityResult<Vec<String>> {
        self.backend.list().await
    }

    pub async fn clear(&self) -> SecurityResult<()> {
        self.backend.clear().await?;
        tracing::info!("Secure storage cleared");
        Ok(())
    }

    pub async fn stats(&self) -> SecurityResult<StorageStats> {
        Ok(StorageStats {
            key_count: self.backend.list().await?.len(),
            storage_type: self.backend.kind(),
            total_size: self.backend.total_size().await?,
        })
    }

    /// The encrypted record as persisted, without decrypting it.
    pub async fn raw_record(&self, key: &str) -> SecurityResult<EncryptedRecord> {
        let key = sanitize_key(key)?;
        self.load_record(&key).await
    }

    /// Encrypt a string under the current master secret (no key binding).
    pub async fn encrypt(&self, plaintext: &str) -> SecurityResult<EncryptedRecord> {
        let master = self.master.read().await;
        self.seal(master.expose_secret(), Zeroizing::new(plaintext.as_bytes().to_vec()), Vec::new())
            .await
    }

    pub async fn decrypt(&self, record: &EncryptedRecord) -> SecurityResult<String> {
        let master = self.master.read().await;
        let plaintext = self.open_record(master.expose_secret(), record.clone(), Vec::new()).await?;
        String::from_utf8(plaintext.to_vec())
            .map_err(|e| SecurityError::Crypto(format!("Decrypted value is not UTF-8: {}", e)))
    }

    /// Re-encrypt every record under a new master secret.
    ///
    /// All records are re-encrypted in memory before anything is written, and
    /// the written batch is all-or-nothing. On any failure the old secret stays
    /// active and every record remains readable with it. Returns the number of
    /// records rotated.
    pub async fn rotate_key(&self, new_master: Option<SecretString>) -> SecurityResult<usize> {
        let new_master = new_master.unwrap_or_else(generate_master_secret);
        let mut master = self.master.write().await;

        let keys = self.backend.list().await?;
        let mut batch = Vec::with_capacity(keys.len());
        for key in &keys {
            let record = self.load_record(key).await?;
            let aad = key.as_bytes().to_vec();
            let plaintext = self.open_record(master.expose_secret(), record, aad.clone()).await?;
            let resealed = self.seal(new_master.expose_secret(), plaintext, aad).await?;
            batch.push((key.clone(), serde_json::to_vec(&resealed)?));
        }

        self.backend.write_batch(batch).await?;
        *master = new_master;
        tracing::info!(records = keys.len(), "Secure storage master key rotated");
        Ok(keys.len())
    }

    async fn load_record(&self, key: &str) -> SecurityResult<EncryptedRecord> {
        let bytes = self
            .backend
            .read(key)
            .await?
            .ok_or_else(|| SecurityError::StorageKeyNotFound(key.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    // KDF work runs on the blocking pool.
    async fn seal(&self, secret: &str, plaintext: Zeroizing<Vec<u8>>, aad: Vec<u8>) -> SecurityResult<EncryptedRecord> {
        let cipher = self.cipher;
        let secret = Zeroizing::new(secret.as_bytes().to_vec());
        tokio::task::spawn_blocking(move || cipher.seal(&secret, &plaintext, &aad))
            .await
            .map_err(|e| SecurityError::Crypto(format!("Encryption task failed: {}", e)))?
    }

    async fn open_record(&self, secret: &str, record: EncryptedRecord, aad: Vec<u8>) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let cipher = self.cipher;
        let secret = Zeroizing::new(secret.as_bytes().to_vec());
        tokio::task::spawn_blocking(move || cipher.open(&secret, &record, &aad).map(Zeroizing::new))
            .await
            .map_err(|e| SecurityError::Crypto(format!("Decryption task failed: {}", e)))?
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_master_secret() -> SecretString {
    let mut bytes = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(bytes.as_mut());
    SecretString::from(hex::encode(bytes.as_ref()))
}
