//! Ed25519 request/response signing with replay protection.

use arc_swap::ArcSwapOption;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::clock::now_millis;
use crate::config::SigningConfig;
use crate::error::{SecurityError, SecurityResult};
use crate::signing::canonical;
use crate::signing::types::{SignedEnvelope, SignedResponse, StoredKeyPair, ALGORITHM};
use crate::storage::SecureStorage;

pub const STORAGE_KEY: &str = "signing_keypair";

/// Past this many tracked nonces, expired ones are pruned inline.
const NONCE_PRUNE_THRESHOLD: usize = 10_000;

struct ActiveKey {
    signing: SigningKey,
    public_hex: String,
    created_at: u64,
}

impl ActiveKey {
    fn from_stored(stored: &StoredKeyPair) -> SecurityResult<Self> {
        let seed = Zeroizing::new(
            hex::decode(&stored.private_key)
                .map_err(|e| SecurityError::Crypto(format!("Invalid stored private key: {}", e)))?,
        );
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::Crypto("Stored private key has wrong length".into()))?;
        let signing = SigningKey::from_bytes(&seed);
        Ok(Self {
            public_hex: hex::encode(signing.verifying_key().to_bytes()),
            signing,
            created_at: stored.created_at,
        })
    }

    fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            public_key: self.public_hex.clone(),
            private_key: hex::encode(self.signing.to_bytes()),
            algorithm: ALGORITHM.to_string(),
            created_at: self.created_at,
        }
    }

    fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            public_hex: hex::encode(signing.verifying_key().to_bytes()),
            signing,
            created_at: now_millis(),
        }
    }
}

pub struct RequestSigner {
    storage: Arc<SecureStorage>,
    tolerance_ms: u64,
    key_max_age_ms: u64,
    key: ArcSwapOption<ActiveKey>,
    rotation_lock: Mutex<()>,
    /// nonce -> envelope timestamp
    seen_nonces: DashMap<String, u64>,
}

impl RequestSigner {
    pub fn new(config: &SigningConfig, storage: Arc<SecureStorage>) -> Self {
        Self {
            storage,
            tolerance_ms: config.replay_tolerance_secs * 1000,
            key_max_age_ms: config.key_max_age_secs * 1000,
            key: ArcSwapOption::empty(),
            rotation_lock: Mutex::new(()),
            seen_nonces: DashMap::new(),
        }
    }

    /// Load the persisted key pair or create one; rotates a pair past its maximum age.
    pub async fn initialize(&self) -> SecurityResult<()> {
        let _guard = self.rotation_lock.lock().await;
        let active = match self.storage.retrieve::<StoredKeyPair>(STORAGE_KEY).await {
            Ok(stored) => ActiveKey::from_stored(&stored)?,
            Err(SecurityError::StorageKeyNotFound(_)) => {
                let active = ActiveKey::generate();
                self.storage.store(STORAGE_KEY, &active.to_stored()).await?;
                tracing::info!(public_key = %active.public_hex, "Generated signing key pair");
                active
            }
            Err(e) => return Err(e),
        };
        let due = self.rotation_due(&active, now_millis());
        self.key.store(Some(Arc::new(active)));
        if due {
            self.rotate_locked().await?;
        }
        Ok(())
    }

    pub async fn rotate_key_pair(&self) -> SecurityResult<String> {
        let _guard = self.rotation_lock.lock().await;
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> SecurityResult<String> {
        let active = ActiveKey::generate();
        self.storage.store(STORAGE_KEY, &active.to_stored()).await?;
        let public_hex = active.public_hex.clone();
        self.key.store(Some(Arc::new(active)));
        tracing::info!(public_key = %public_hex, "Signing key pair rotated");
        Ok(public_hex)
    }

    fn rotation_due(&self, key: &ActiveKey, now: u64) -> bool {
        now.saturating_sub(key.created_at) > self.key_max_age_ms
    }

    async fn active_key(&self) -> SecurityResult<Arc<ActiveKey>> {
        if self.key.load().is_none() {
            self.initialize().await?;
        }
        let key = self
            .key
            .load_full()
            .ok_or(SecurityError::NotInitialized("request signer"))?;
        if !self.rotation_due(&key, now_millis()) {
            return Ok(key);
        }
        let _guard = self.rotation_lock.lock().await;
        match self.key.load_full() {
            Some(current) if !self.rotation_due(&current, now_millis()) => Ok(current),
            _ => {
                self.rotate_locked().await?;
                self.key
                    .load_full()
                    .ok_or(SecurityError::NotInitialized("request signer"))
            }
        }
    }

    /// Hex-encoded verifying key currently used for signing.
    pub fn public_key(&self) -> Option<String> {
        self.key.load_full().map(|k| k.public_hex.clone())
    }

    pub async fn sign_request(&self, data: Value) -> SecurityResult<SignedEnvelope> {
        let key = self.active_key().await?;
        let timestamp = now_millis();
        let nonce = uuid::Uuid::new_v4().to_string();
        let payload = canonical::request_payload(&data, timestamp, &nonce);
        let signature = key.signing.sign(payload.as_bytes());

        Ok(SignedEnvelope {
            data,
            signature: BASE64.encode(signature.to_bytes()),
            timestamp,
            nonce,
            public_key: key.public_hex.clone(),
            algorithm: ALGORITHM.to_string(),
        })
    }

    pub async fn verify_request(&self, envelope: &SignedEnvelope) -> SecurityResult<()> {
        self.verify_request_at(envelope, now_millis())
    }

    /// Verify against an explicit clock reading.
    ///
    /// Freshness is checked before the signature. A nonce is recorded only
    /// after the signature verifies, and a recorded nonce is never accepted
    /// again.
    pub fn verify_request_at(&self, envelope: &SignedEnvelope, now_ms: u64) -> SecurityResult<()> {
        if envelope.algorithm != ALGORITHM {
            return Err(SecurityError::SignatureInvalid(format!(
                "unsupported algorithm '{}'",
                envelope.algorithm
            )));
        }
        self.check_freshness(envelope.timestamp, now_ms)?;
        verify_signature(&envelope.public_key, &envelope.signature, envelope.canonical_payload().as_bytes())?;
        self.record_nonce(format!("req:{}", envelope.nonce), envelope.timestamp, now_ms)
    }

    /// Sign `data` as the response to `request`.
    pub async fn sign_response(&self, data: Value, request: &SignedEnvelope) -> SecurityResult<SignedResponse> {
        let key = self.active_key().await?;
        let timestamp = now_millis();
        let nonce = uuid::Uuid::new_v4().to_string();
        let payload = canonical::response_payload(&data, timestamp, &nonce, &request.nonce);
        let signature = key.signing.sign(payload.as_bytes());

        Ok(SignedResponse {
            data,
            signature: BASE64.encode(signature.to_bytes()),
            timestamp,
            nonce,
            request_nonce: request.nonce.clone(),
            public_key: key.public_hex.clone(),
        })
    }

    pub async fn verify_response(&self, response: &SignedResponse, request: &SignedEnvelope) -> SecurityResult<()> {
        self.verify_response_at(response, request, now_millis())
    }

    pub fn verify_response_at(
        &self,
        response: &SignedResponse,
        request: &SignedEnvelope,
        now_ms: u64,
    ) -> SecurityResult<()> {
        if response.request_nonce != request.nonce {
            return Err(SecurityError::SignatureInvalid(
                "response is bound to a different request".into(),
            ));
        }
        self.check_freshness(response.timestamp, now_ms)?;
        verify_signature(&response.public_key, &response.signature, response.canonical_payload().as_bytes())?;
        self.record_nonce(format!("resp:{}", response.nonce), response.timestamp, now_ms)
    }

    fn check_freshness(&self, timestamp: u64, now_ms: u64) -> SecurityResult<()> {
        if now_ms > timestamp && now_ms - timestamp > self.tolerance_ms {
            return Err(SecurityError::ReplayDetected(format!(
                "timestamp is {} ms old, tolerance {} ms",
                now_ms - timestamp,
                self.tolerance_ms
            )));
        }
        if timestamp > now_ms && timestamp - now_ms > self.tolerance_ms {
            return Err(SecurityError::ReplayDetected("timestamp is in the future".into()));
        }
        Ok(())
    }

    fn record_nonce(&self, nonce: String, timestamp: u64, now_ms: u64) -> SecurityResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.seen_nonces.entry(nonce) {
            Entry::Occupied(_) => {
                return Err(SecurityError::ReplayDetected("nonce already used".into()));
            }
            Entry::Vacant(slot) => {
                slot.insert(timestamp);
            }
        }
        if self.seen_nonces.len() > NONCE_PRUNE_THRESHOLD {
            self.prune_nonces(now_ms);
        }
        Ok(())
    }

    /// Forget nonces whose envelopes are past the replay window; returns how many were removed.
    pub fn prune_nonces(&self, now_ms: u64) -> usize {
        let before = self.seen_nonces.len();
        let tolerance = self.tolerance_ms;
        self.seen_nonces
            .retain(|_, ts| now_ms <= *ts || now_ms - *ts <= tolerance);
        before - self.seen_nonces.len()
    }

    pub fn tracked_nonces(&self) -> usize {
        self.seen_nonces.len()
    }
}

fn verify_signature(public_key_hex: &str, signature_b64: &str, message: &[u8]) -> SecurityResult<()> {
    let pk_bytes: [u8; 32] = hex::decode(public_key_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SecurityError::SignatureInvalid("malformed public key".into()))?;
    let verifying = VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|_| SecurityError::SignatureInvalid("invalid public key".into()))?;
    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| SecurityError::SignatureInvalid("malformed signature".into()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| SecurityError::SignatureInvalid("malformed signature".into()))?;
    verifying
        .verify_strict(message, &signature)
        .map_err(|_| SecurityError::SignatureInvalid("signature does not match payload".into()))
}
