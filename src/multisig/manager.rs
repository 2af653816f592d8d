//! Threshold authorization over opaque payloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::now_millis;
use crate::error::{SecurityError, SecurityResult};
use crate::multisig::hardware::{DeviceInfo, HardwareSigner};
use crate::multisig::types::{
    MultiSigPolicy, MultiSigTransaction, RejectedSignature, SignerInfo, VerificationReport,
};
use crate::signing::canonical::canonicalize;
use crate::storage::SecureStorage;

pub const STORAGE_KEY: &str = "multisig_config";

pub struct MultiSignature {
    storage: Arc<SecureStorage>,
    policy: RwLock<Option<MultiSigPolicy>>,
    hardware_wallets: DashMap<String, Arc<dyn HardwareSigner>>,
}

impl MultiSignature {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        Self {
            storage,
            policy: RwLock::new(None),
            hardware_wallets: DashMap::new(),
        }
    }

    /// Validate and persist `policy`.
    pub async fn initialize(&self, policy: MultiSigPolicy) -> SecurityResult<()> {
        validate_policy(&policy)?;
        self.storage.store(STORAGE_KEY, &policy).await?;
        tracing::info!(
            threshold = policy.threshold,
            signers = policy.signers.len(),
            "Multi-signature policy initialized"
        );
        *self.policy.write().await = Some(policy);
        Ok(())
    }

    /// Restore a previously persisted policy; returns whether one was found.
    pub async fn load(&self) -> SecurityResult<bool> {
        match self.storage.retrieve::<MultiSigPolicy>(STORAGE_KEY).await {
            Ok(policy) => {
                validate_policy(&policy)?;
                *self.policy.write().await = Some(policy);
                Ok(true)
            }
            Err(SecurityError::StorageKeyNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn policy(&self) -> Option<MultiSigPolicy> {
        self.policy.read().await.clone()
    }

    async fn require_policy(&self) -> SecurityResult<MultiSigPolicy> {
        self.policy
            .read()
            .await
            .clone()
            .ok_or(SecurityError::NotInitialized("multi-signature"))
    }

    /// Start a transaction over `data` for the authorized subset of `proposed_signers`.
    pub async fn create_transaction(
        &self,
        data: Value,
        proposed_signers: &[String],
    ) -> SecurityResult<MultiSigTransaction> {
        let policy = self.require_policy().await?;

        let mut seen = HashSet::new();
        let signing_addresses: Vec<String> = proposed_signers
            .iter()
            .filter(|addr| policy.is_authorized(addr) && seen.insert(addr.as_str()))
            .cloned()
            .collect();

        if signing_addresses.len() < policy.threshold {
            return Err(SecurityError::InsufficientSigners {
                required: policy.threshold,
                provided: signing_addresses.len(),
            });
        }

        let tx = MultiSigTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            payload_hash: hex::encode(payload_hash(&data)),
            data,
            required_signatures: policy.threshold,
            signing_addresses,
            signatures: Default::default(),
            created_at: now_millis(),
            algorithm: policy.algorithm.clone(),
            sealed: false,
        };
        tracing::debug!(tx = %tx.id, signers = tx.signing_addresses.len(), "Multi-signature transaction created");
        Ok(tx)
    }

    /// Sign with a software key belonging to `signer`.
    pub async fn sign(&self, tx: &mut MultiSigTransaction, signer: &str, key: &SigningKey) -> SecurityResult<()> {
        let info = self.authorized_signer(tx, signer).await?;
        if hex::encode(key.verifying_key().to_bytes()) != info.public_key {
            return Err(SecurityError::InvalidInput(format!(
                "signing key does not belong to signer {}",
                signer
            )));
        }
        let hash = decode_hash(tx)?;
        let signature = key.sign(&hash);
        tx.signatures.insert(signer.to_string(), BASE64.encode(signature.to_bytes()));
        tracing::debug!(tx = %tx.id, signer, "Signature added");
        Ok(())
    }

    /// Sign through the hardware wallet registered for `signer`.
    pub async fn sign_with_hardware(&self, tx: &mut MultiSigTransaction, signer: &str) -> SecurityResult<()> {
        let policy = self.require_policy().await?;
        if !policy.hardware_wallet_enabled {
            return Err(SecurityError::InvalidConfig("hardware wallets are disabled".into()));
        }
        let info = self.authorized_signer(tx, signer).await?;
        let device = self
            .hardware_wallets
            .get(signer)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| SecurityError::HardwareWallet(format!("no device registered for {}", signer)))?;

        if !device.is_connected().await {
            return Err(SecurityError::HardwareWallet(format!("device for {} is not connected", signer)));
        }
        if device.get_public_key().await? != info.public_key {
            return Err(SecurityError::HardwareWallet(format!(
                "device key does not match signer {}",
                signer
            )));
        }

        let hash = decode_hash(tx)?;
        let signature = device.sign(&hash).await?;
        tx.signatures.insert(signer.to_string(), signature);
        tracing::debug!(tx = %tx.id, signer, "Hardware signature added");
        Ok(())
    }

    /// Add a signature collected elsewhere. It is only checked by [`verify`](Self::verify).
    pub fn attach_signature(&self, tx: &mut MultiSigTransaction, signer: &str, signature: String) -> SecurityResult<()> {
        if tx.sealed {
            return Err(SecurityError::TransactionSealed(tx.id.clone()));
        }
        tx.signatures.insert(signer.to_string(), signature);
        Ok(())
    }

    pub fn remove_signature(&self, tx: &mut MultiSigTransaction, signer: &str) -> SecurityResult<bool> {
        if tx.sealed {
            return Err(SecurityError::TransactionSealed(tx.id.clone()));
        }
        Ok(tx.signatures.remove(signer).is_some())
    }

    /// Count signatures that come from an authorized signer and verify against
    /// that signer's key. A valid transaction is sealed.
    pub async fn verify(&self, tx: &mut MultiSigTransaction) -> SecurityResult<VerificationReport> {
        let report = self.evaluate(tx).await?;
        if report.is_valid && !tx.sealed {
            tx.sealed = true;
            tracing::info!(tx = %tx.id, valid = report.valid_signatures, "Multi-signature transaction verified");
        }
        Ok(report)
    }

    /// Verification without sealing.
    ///
    /// The bar is the larger of the policy threshold and the transaction's own
    /// requirement, so a transaction cannot lower it.
    pub async fn evaluate(&self, tx: &MultiSigTransaction) -> SecurityResult<VerificationReport> {
        let policy = self.require_policy().await?;
        if tx.required_signatures < 1 {
            return Err(SecurityError::InvalidInput(format!(
                "transaction {} requires no signatures",
                tx.id
            )));
        }
        let required = tx.required_signatures.max(policy.threshold);
        let expected_hash = payload_hash(&tx.data);
        let hash_matches = hex::encode(expected_hash) == tx.payload_hash;

        let mut valid = 0;
        let mut rejected = Vec::new();
        for (address, signature) in &tx.signatures {
            let reason = match policy.signer(address) {
                None => Some("unauthorized signer"),
                Some(_) if !hash_matches => Some("payload does not match hash"),
                Some(info) => match check_signature(info, &expected_hash, signature) {
                    Ok(()) => None,
                    Err(reason) => Some(reason),
                },
            };
            match reason {
                None => valid += 1,
                Some(reason) => rejected.push(RejectedSignature {
                    address: address.clone(),
                    reason: reason.to_string(),
                }),
            }
        }

        if !rejected.is_empty() {
            tracing::warn!(tx = %tx.id, rejected = rejected.len(), "Multi-signature transaction has rejected signatures");
        }

        if !hash_matches {
            tracing::warn!(tx = %tx.id, "Multi-signature payload does not match its hash");
        }

        Ok(VerificationReport {
            is_valid: hash_matches && valid >= required,
            valid_signatures: valid,
            required_signatures: required,
            rejected,
        })
    }

    pub async fn add_signer(&self, signer: SignerInfo) -> SecurityResult<()> {
        signer.verifying_key()?;
        let mut guard = self.policy.write().await;
        let policy = guard.as_mut().ok_or(SecurityError::NotInitialized("multi-signature"))?;
        if policy.is_authorized(&signer.address) {
            return Err(SecurityError::InvalidInput(format!("signer {} already exists", signer.address)));
        }

        let mut updated = policy.clone();
        updated.signers.push(signer);
        updated.threshold = updated.threshold.min(updated.signers.len());
        self.storage.store(STORAGE_KEY, &updated).await?;
        *policy = updated;
        Ok(())
    }

    pub async fn remove_signer(&self, address: &str) -> SecurityResult<()> {
        let mut guard = self.policy.write().await;
        let policy = guard.as_mut().ok_or(SecurityError::NotInitialized("multi-signature"))?;
        if !policy.is_authorized(address) {
            return Err(SecurityError::InvalidInput(format!("signer {} not found", address)));
        }
        if policy.signers.len() == 1 {
            return Err(SecurityError::InvalidInput("cannot remove the last signer".into()));
        }

        let mut updated = policy.clone();
        updated.signers.retain(|s| s.address != address);
        updated.threshold = updated.threshold.min(updated.signers.len());
        self.storage.store(STORAGE_KEY, &updated).await?;
        if updated.threshold < policy.threshold {
            tracing::warn!(threshold = updated.threshold, "Threshold clamped after signer removal");
        }
        *policy = updated;
        self.hardware_wallets.remove(address);
        Ok(())
    }

    /// Attach a device to an authorized signer; returns the device info.
    pub async fn register_hardware_wallet(
        &self,
        address: &str,
        device: Arc<dyn HardwareSigner>,
    ) -> SecurityResult<DeviceInfo> {
        let policy = self.require_policy().await?;
        if !policy.hardware_wallet_enabled {
            return Err(SecurityError::InvalidConfig("hardware wallets are disabled".into()));
        }
        let info = policy
            .signer(address)
            .ok_or_else(|| SecurityError::UnauthorizedSigner(address.to_string()))?;
        if !device.is_connected().await {
            return Err(SecurityError::HardwareWallet("device is not connected".into()));
        }
        if device.get_public_key().await? != info.public_key {
            return Err(SecurityError::HardwareWallet(format!(
                "device key does not match signer {}",
                address
            )));
        }
        let device_info = device.get_device_info().await?;
        tracing::info!(signer = address, model = %device_info.model, "Hardware wallet registered");
        self.hardware_wallets.insert(address.to_string(), device);
        Ok(device_info)
    }

    async fn authorized_signer(&self, tx: &MultiSigTransaction, signer: &str) -> SecurityResult<SignerInfo> {
        if tx.sealed {
            return Err(SecurityError::TransactionSealed(tx.id.clone()));
        }
        let policy = self.require_policy().await?;
        if !tx.signing_addresses.iter().any(|a| a == signer) {
            return Err(SecurityError::UnauthorizedSigner(signer.to_string()));
        }
        policy
            .signer(signer)
            .cloned()
            .ok_or_else(|| SecurityError::UnauthorizedSigner(signer.to_string()))
    }
}

fn validate_policy(policy: &MultiSigPolicy) -> SecurityResult<()> {
    if policy.threshold < 1 {
        return Err(SecurityError::InvalidConfig("Threshold must be at least 1".into()));
    }
    if policy.threshold > policy.signers.len() {
        return Err(SecurityError::InvalidConfig("Threshold cannot exceed number of signers".into()));
    }
    let mut seen = HashSet::new();
    for signer in &policy.signers {
        if !seen.insert(signer.address.as_str()) {
            return Err(SecurityError::InvalidConfig(format!("duplicate signer {}", signer.address)));
        }
        signer.verifying_key()?;
    }
    Ok(())
}

fn payload_hash(data: &Value) -> [u8; 32] {
    Sha256::digest(canonicalize(data).as_bytes()).into()
}

fn decode_hash(tx: &MultiSigTransaction) -> SecurityResult<Vec<u8>> {
    hex::decode(&tx.payload_hash)
        .map_err(|_| SecurityError::InvalidInput(format!("transaction {} has a malformed hash", tx.id)))
}

fn check_signature(info: &SignerInfo, hash: &[u8], signature: &str) -> Result<(), &'static str> {
    let key = info.verifying_key().map_err(|_| "invalid signer key")?;
    let bytes = BASE64.decode(signature).map_err(|_| "malformed signature")?;
    let signature = Signature::from_slice(&bytes).map_err(|_| "malformed signature")?;
    key.verify_strict(hash, &signature).map_err(|_| "signature does not verify")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use async_trait::async_trait;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn storage() -> Arc<SecureStorage> {
        Arc::new(SecureStorage::in_memory(&StorageConfig {
            memory_only: true,
            pbkdf2_iterations: 1_000,
            ..StorageConfig::default()
        }))
    }

    fn keys(n: usize) -> Vec<(SigningKey, SignerInfo)> {
        (0..n)
            .map(|_| {
                let key = SigningKey::generate(&mut OsRng);
                let info = SignerInfo::from_key(&key.verifying_key());
                (key, info)
            })
            .collect()
    }

    async fn setup(threshold: usize, n: usize) -> (MultiSignature, Vec<(SigningKey, SignerInfo)>) {
        let ms = MultiSignature::new(storage());
        let signers = keys(n);
        ms.initialize(MultiSigPolicy {
            threshold,
            signers: signers.iter().map(|(_, i)| i.clone()).collect(),
            algorithm: "ed25519".into(),
            hardware_wallet_enabled: true,
        })
        .await
        .unwrap();
        (ms, signers)
    }

    fn addresses(signers: &[(SigningKey, SignerInfo)]) -> Vec<String> {
        signers.iter().map(|(_, i)| i.address.clone()).collect()
    }

    #[tokio::test]
    async fn test_policy_validation() {
        let ms = MultiSignature::new(storage());
        let signers: Vec<_> = keys(2).into_iter().map(|(_, i)| i).collect();
        let zero = MultiSigPolicy { threshold: 0, signers: signers.clone(), algorithm: "ed25519".into(), hardware_wallet_enabled: false };
        assert!(matches!(ms.initialize(zero).await, Err(SecurityError::InvalidConfig(_))));
        let too_high = MultiSigPolicy { threshold: 3, signers, algorithm: "ed25519".into(), hardware_wallet_enabled: false };
        assert!(matches!(ms.initialize(too_high).await, Err(SecurityError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_insufficient_signers() {
        let (ms, signers) = setup(2, 3).await;
        let proposed = vec![signers[0].1.address.clone(), "0xnot-a-signer".to_string()];
        let err = ms.create_transaction(json!({"to": "0xabc"}), &proposed).await.unwrap_err();
        assert_eq!(err.to_string(), "Insufficient signers. Required: 2, Provided: 1");
    }

    #[tokio::test]
    async fn test_threshold_two_of_three() {
        let (ms, signers) = setup(2, 3).await;
        let mut tx = ms.create_transaction(json!({"value": 5}), &addresses(&signers)).await.unwrap();

        ms.sign(&mut tx, &signers[0].1.address, &signers[0].0).await.unwrap();
        assert!(!ms.evaluate(&tx).await.unwrap().is_valid);

        ms.sign(&mut tx, &signers[1].1.address, &signers[1].0).await.unwrap();
        let report = ms.evaluate(&tx).await.unwrap();
        assert!(report.is_valid);
        assert_eq!(report.valid_signatures, 2);
    }

    #[tokio::test]
    async fn test_unauthorized_signature_never_counts() {
        let (ms, signers) = setup(2, 3).await;
        let mut tx = ms.create_transaction(json!({"value": 5}), &addresses(&signers)).await.unwrap();
        ms.sign(&mut tx, &signers[0].1.address, &signers[0].0).await.unwrap();
        ms.sign(&mut tx, &signers[1].1.address, &signers[1].0).await.unwrap();

        // Swap one valid signature for one from an outsider key.
        let outsider = SigningKey::generate(&mut OsRng);
        let outsider_info = SignerInfo::from_key(&outsider.verifying_key());
        let hash = hex::decode(&tx.payload_hash).unwrap();
        ms.remove_signature(&mut tx, &signers[1].1.address).unwrap();
        ms.attach_signature(&mut tx, &outsider_info.address, BASE64.encode(outsider.sign(&hash).to_bytes()))
            .unwrap();

        let report = ms.evaluate(&tx).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.valid_signatures, 1);
        assert_eq!(report.rejected[0].reason, "unauthorized signer");
        assert!(matches!(
            report.into_result(),
            Err(SecurityError::InsufficientSignatures { valid: 1, required: 2 })
        ));
    }

    #[tokio::test]
    async fn test_forged_signature_under_authorized_address() {
        let (ms, signers) = setup(1, 2).await;
        let mut tx = ms.create_transaction(json!({"value": 1}), &addresses(&signers)).await.unwrap();
        let hash = hex::decode(&tx.payload_hash).unwrap();
        // Signed by signer 1's key but claimed for signer 0.
        let forged = BASE64.encode(signers[1].0.sign(&hash).to_bytes());
        ms.attach_signature(&mut tx, &signers[0].1.address, forged).unwrap();

        let report = ms.evaluate(&tx).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.rejected[0].reason, "signature does not verify");
    }

    #[tokio::test]
    async fn test_wrong_key_rejected_at_sign() {
        let (ms, signers) = setup(1, 2).await;
        let mut tx = ms.create_transaction(json!({}), &addresses(&signers)).await.unwrap();
        let err = ms.sign(&mut tx, &signers[0].1.address, &signers[1].0).await.unwrap_err();
        assert!(matches!(err, SecurityError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_verified_transaction_is_sealed() {
        let (ms, signers) = setup(1, 2).await;
        let mut tx = ms.create_transaction(json!({"v": 1}), &addresses(&signers)).await.unwrap();
        ms.sign(&mut tx, &signers[0].1.address, &signers[0].0).await.unwrap();
        assert!(ms.verify(&mut tx).await.unwrap().is_valid);
        assert!(tx.sealed);

        let err = ms.sign(&mut tx, &signers[1].1.address, &signers[1].0).await.unwrap_err();
        assert!(matches!(err, SecurityError::TransactionSealed(_)));
    }

    #[tokio::test]
    async fn test_transaction_cannot_lower_policy_threshold() {
        let (ms, signers) = setup(2, 3).await;
        let mut tx = ms.create_transaction(json!({"v": 1}), &addresses(&signers)).await.unwrap();

        tx.required_signatures = 0;
        assert!(matches!(ms.verify(&mut tx).await, Err(SecurityError::InvalidInput(_))));
        assert!(!tx.sealed);

        tx.required_signatures = 1;
        ms.sign(&mut tx, &signers[0].1.address, &signers[0].0).await.unwrap();
        let report = ms.verify(&mut tx).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.required_signatures, 2);
        assert!(!tx.sealed);

        ms.sign(&mut tx, &signers[1].1.address, &signers[1].0).await.unwrap();
        assert!(ms.verify(&mut tx).await.unwrap().is_valid);
        assert!(tx.sealed);
    }

    #[tokio::test]
    async fn test_rehashed_payload_is_never_sealed() {
        let (ms, signers) = setup(1, 2).await;
        let mut tx = ms.create_transaction(json!({"amount": 1}), &addresses(&signers)).await.unwrap();
        ms.sign(&mut tx, &signers[0].1.address, &signers[0].0).await.unwrap();
        tx.payload_hash = "00".repeat(32);

        let report = ms.verify(&mut tx).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.valid_signatures, 0);
        assert!(!tx.sealed);
    }

    #[tokio::test]
    async fn test_tampered_data_invalidates_signatures() {
        let (ms, signers) = setup(1, 2).await;
        let mut tx = ms.create_transaction(json!({"amount": 1}), &addresses(&signers)).await.unwrap();
        ms.sign(&mut tx, &signers[0].1.address, &signers[0].0).await.unwrap();
        tx.data = json!({"amount": 1_000_000});
        assert!(!ms.evaluate(&tx).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_signer_edits_clamp_threshold() {
        let (ms, signers) = setup(3, 3).await;
        ms.remove_signer(&signers[2].1.address).await.unwrap();
        assert_eq!(ms.policy().await.unwrap().threshold, 2);

        ms.remove_signer(&signers[1].1.address).await.unwrap();
        let err = ms.remove_signer(&signers[0].1.address).await.unwrap_err();
        assert!(matches!(err, SecurityError::InvalidInput(_)));

        let new = keys(1).remove(0).1;
        ms.add_signer(new.clone()).await.unwrap();
        let policy = ms.policy().await.unwrap();
        assert_eq!(policy.signers.len(), 2);
        assert_eq!(policy.threshold, 1);
        assert!(ms.add_signer(new).await.is_err());
    }

    #[tokio::test]
    async fn test_policy_persisted() {
        let storage = storage();
        let ms = MultiSignature::new(storage.clone());
        let signers: Vec<_> = keys(2).into_iter().map(|(_, i)| i).collect();
        ms.initialize(MultiSigPolicy { threshold: 2, signers, algorithm: "ed25519".into(), hardware_wallet_enabled: false })
            .await
            .unwrap();

        let restored = MultiSignature::new(storage);
        assert!(restored.load().await.unwrap());
        assert_eq!(restored.policy().await, ms.policy().await);
    }

    struct MockDevice {
        key: SigningKey,
        connected: bool,
    }

    #[async_trait]
    impl HardwareSigner for MockDevice {
        async fn is_connected(&self) -> bool {
            self.connected
        }

        async fn get_public_key(&self) -> SecurityResult<String> {
            Ok(hex::encode(self.key.verifying_key().to_bytes()))
        }

        async fn sign(&self, hash: &[u8]) -> SecurityResult<String> {
            Ok(BASE64.encode(self.key.sign(hash).to_bytes()))
        }

        async fn get_device_info(&self) -> SecurityResult<DeviceInfo> {
            Ok(DeviceInfo {
                vendor: "test".into(),
                model: "mock".into(),
                firmware_version: "1.0.0".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_hardware_signing() {
        let (ms, signers) = setup(1, 2).await;
        let (key, info) = &signers[0];
        let device = Arc::new(MockDevice { key: key.clone(), connected: true });
        let device_info = ms.register_hardware_wallet(&info.address, device).await.unwrap();
        assert_eq!(device_info.model, "mock");

        let mut tx = ms.create_transaction(json!({"hw": true}), &addresses(&signers)).await.unwrap();
        ms.sign_with_hardware(&mut tx, &info.address).await.unwrap();
        assert!(ms.verify(&mut tx).await.unwrap().is_valid);
    }

    #[tokio::test]
    async fn test_hardware_key_mismatch_rejected() {
        let (ms, signers) = setup(1, 2).await;
        let device = Arc::new(MockDevice { key: signers[1].0.clone(), connected: true });
        let err = ms.register_hardware_wallet(&signers[0].1.address, device).await.unwrap_err();
        assert!(matches!(err, SecurityError::HardwareWallet(_)));

        let offline = Arc::new(MockDevice { key: signers[0].0.clone(), connected: false });
        assert!(ms.register_hardware_wallet(&signers[0].1.address, offline).await.is_err());
    }
}
