//! AES-256-GCM record encryption with a per-record derived key.
//!
//! Every record gets a random salt and a random IV. The record key is
//! derived from the master secret and that salt with PBKDF2-HMAC-SHA256 or
//! scrypt, so no two records share a key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::{KdfKind, StorageConfig};
use crate::error::{SecurityError, SecurityResult};
use crate::storage::types::EncryptedRecord;

pub const ALGORITHM: &str = "aes-256-gcm";
pub const KDF_PBKDF2: &str = "pbkdf2-sha256";
pub const KDF_SCRYPT: &str = "scrypt";

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const SALT_LEN: usize = 32;

/// KDF selection and cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct RecordCipher {
    kdf: KdfKind,
    pbkdf2_iterations: u32,
    scrypt_log_n: u8,
    scrypt_r: u32,
    scrypt_p: u32,
}

impl RecordCipher {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            kdf: config.kdf,
            pbkdf2_iterations: config.pbkdf2_iterations,
            scrypt_log_n: config.scrypt_log_n,
            scrypt_r: config.scrypt_r,
            scrypt_p: config.scrypt_p,
        }
    }

    /// Encrypt `plaintext`, binding `aad` into the tag.
    pub fn seal(&self, secret: &[u8], plaintext: &[u8], aad: &[u8]) -> SecurityResult<EncryptedRecord> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(self.kdf, secret, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| SecurityError::Crypto(format!("Failed to create cipher: {}", e)))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
            .map_err(|e| SecurityError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedRecord {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(iv),
            salt: BASE64.encode(salt),
            algorithm: ALGORITHM.to_string(),
            kdf: kdf_label(self.kdf).to_string(),
        })
    }

    /// Decrypt a record. The KDF named in the record wins over the configured one.
    pub fn open(&self, secret: &[u8], record: &EncryptedRecord, aad: &[u8]) -> SecurityResult<Vec<u8>> {
        if record.algorithm != ALGORITHM {
            return Err(SecurityError::Crypto(format!(
                "Unsupported algorithm: {}",
                record.algorithm
            )));
        }
        let kdf = match record.kdf.as_str() {
            KDF_PBKDF2 => KdfKind::Pbkdf2,
            KDF_SCRYPT => KdfKind::Scrypt,
            other => return Err(SecurityError::Crypto(format!("Unsupported KDF: {}", other))),
        };

        let salt = decode(&record.salt, "salt")?;
        let iv = decode(&record.iv, "iv")?;
        let ciphertext = decode(&record.ciphertext, "ciphertext")?;
        if iv.len() != IV_LEN {
            return Err(SecurityError::Crypto("Invalid IV length".into()));
        }

        let key = self.derive_key(kdf, secret, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| SecurityError::Crypto(format!("Failed to create cipher: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(&iv), Payload { msg: &ciphertext, aad })
            .map_err(|_| SecurityError::Crypto("Decryption failed - wrong key or corrupted record".into()))
    }

    fn derive_key(&self, kdf: KdfKind, secret: &[u8], salt: &[u8]) -> SecurityResult<Zeroizing<[u8; KEY_LEN]>> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        match kdf {
            KdfKind::Pbkdf2 => {
                pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, self.pbkdf2_iterations, key.as_mut());
            }
            KdfKind::Scrypt => {
                let params = scrypt::Params::new(self.scrypt_log_n, self.scrypt_r, self.scrypt_p, KEY_LEN)
                    .map_err(|e| SecurityError::Crypto(format!("Invalid scrypt params: {}", e)))?;
                scrypt::scrypt(secret, salt, &params, key.as_mut())
                    .map_err(|e| SecurityError::Crypto(format!("Key derivation failed: {}", e)))?;
            }
        }
        Ok(key)
    }
}

fn kdf_label(kdf: KdfKind) -> &'static str {
    match kdf {
        KdfKind::Pbkdf2 => KDF_PBKDF2,
        KdfKind::Scrypt => KDF_SCRYPT,
    }
}

fn decode(field: &str, name: &str) -> SecurityResult<Vec<u8>> {
    BASE64
        .decode(field)
        .map_err(|e| SecurityError::Crypto(format!("Invalid base64 in {}: {}", name, e)))
}
