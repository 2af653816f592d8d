//! API key rotation state machine.

use arc_swap::ArcSwapOption;
use rand::{rngs::OsRng, RngCore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

use crate::clock::now_millis;
use crate::config::ApiKeyConfig;
use crate::credentials::types::{Credential, InitialKeys, KeyEvent, RotationStatus};
use crate::error::{SecurityError, SecurityResult};
use crate::lifecycle::{Scheduler, TaskHandle};
use crate::storage::SecureStorage;

pub const STORAGE_KEY: &str = "api_keys";
const KEY_PREFIX: &str = "hsk_";
const INITIAL_FALLBACKS: usize = 2;

/// Owns the API key set.
///
/// Readers load the current [`Credential`] lock-free; rotations are serialized
/// and publish a complete new credential in a single swap, so a reader sees
/// either the old set or the new one.
pub struct ApiKeyManager {
    storage: Arc<SecureStorage>,
    rotation_enabled: bool,
    background_rotation: bool,
    max_fallback_keys: usize,
    key_length: usize,
    rotation_interval_ms: AtomicU64,
    current: ArcSwapOption<Credential>,
    rotation_lock: Mutex<()>,
    events: broadcast::Sender<KeyEvent>,
}

impl ApiKeyManager {
    pub fn new(config: &ApiKeyConfig, storage: Arc<SecureStorage>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            storage,
            rotation_enabled: config.rotation_enabled,
            background_rotation: config.background_rotation,
            max_fallback_keys: config.max_fallback_keys,
            key_length: config.key_length,
            rotation_interval_ms: AtomicU64::new(config.rotation_interval().as_millis() as u64),
            current: ArcSwapOption::empty(),
            rotation_lock: Mutex::new(()),
            events,
        }
    }

    /// Install `initial` keys, or load the persisted set, or generate a new one.
    pub async fn initialize(&self, initial: Option<InitialKeys>) -> SecurityResult<()> {
        let _guard = self.rotation_lock.lock().await;
        let now = now_millis();
        let interval = self.rotation_interval_ms.load(Ordering::Relaxed);

        let credential = match initial {
            Some(keys) => {
                if keys.primary.is_empty() {
                    return Err(SecurityError::InvalidInput("primary API key is empty".into()));
                }
                let mut fallbacks = keys.fallbacks;
                fallbacks.truncate(self.max_fallback_keys);
                let credential = Credential {
                    primary: keys.primary,
                    fallbacks,
                    created_at: now,
                    expires_at: now + interval,
                    rotation_count: 0,
                };
                self.storage.store(STORAGE_KEY, &credential).await?;
                credential
            }
            None => match self.storage.retrieve::<Credential>(STORAGE_KEY).await {
                Ok(credential) => {
                    tracing::debug!(rotation_count = credential.rotation_count, "Loaded API keys");
                    credential
                }
                Err(SecurityError::StorageKeyNotFound(_)) => {
                    let credential = Credential {
                        primary: self.generate_key(),
                        fallbacks: (0..INITIAL_FALLBACKS.min(self.max_fallback_keys))
                            .map(|_| self.generate_key())
                            .collect(),
                        created_at: now,
                        expires_at: now + interval,
                        rotation_count: 0,
                    };
                    self.storage.store(STORAGE_KEY, &credential).await?;
                    tracing::info!("Generated new API key set");
                    credential
                }
                Err(e) => return Err(e),
            },
        };

        let expired = credential.is_expired(now);
        self.current.store(Some(Arc::new(credential)));

        if expired && self.rotation_enabled {
            self.rotate_locked().await?;
        }
        Ok(())
    }

    /// Current key set, rotating first if it has expired.
    pub async fn get_current_key(&self) -> SecurityResult<Arc<Credential>> {
        let credential = match self.current.load_full() {
            Some(credential) => credential,
            None => {
                self.initialize(None).await?;
                self.current
                    .load_full()
                    .ok_or(SecurityError::NotInitialized("API key manager"))?
            }
        };

        if !credential.is_expired(now_millis()) {
            return Ok(credential);
        }
        if !self.rotation_enabled {
            tracing::warn!(
                expires_at = credential.expires_at,
                "API key expired but rotation is disabled"
            );
            return Ok(credential);
        }

        let _guard = self.rotation_lock.lock().await;
        // Another caller may have rotated while we waited.
        match self.current.load_full() {
            Some(current) if !current.is_expired(now_millis()) => Ok(current),
            _ => self.rotate_locked().await,
        }
    }

    /// Generate a new primary and demote the old one into the fallback ring.
    pub async fn rotate_keys(&self) -> SecurityResult<Arc<Credential>> {
        if !self.rotation_enabled {
            return Err(SecurityError::RotationDisabled);
        }
        let _guard = self.rotation_lock.lock().await;
        self.rotate_locked().await
    }

    pub async fn force_rotation(&self) -> SecurityResult<Arc<Credential>> {
        self.rotate_keys().await
    }

    /// Caller must hold `rotation_lock`.
    async fn rotate_locked(&self) -> SecurityResult<Arc<Credential>> {
        let old = self.current.load_full();
        let now = now_millis();

        let mut fallbacks = Vec::with_capacity(self.max_fallback_keys);
        if let Some(old) = &old {
            fallbacks.push(old.primary.clone());
            fallbacks.extend(old.fallbacks.iter().cloned());
        }
        fallbacks.truncate(self.max_fallback_keys);

        let credential = Credential {
            primary: self.generate_key(),
            fallbacks,
            created_at: now,
            expires_at: now + self.rotation_interval_ms.load(Ordering::Relaxed),
            rotation_count: old.as_ref().map_or(1, |c| c.rotation_count + 1),
        };

        // Persist before publishing; a failed write leaves the old set active.
        self.storage.store(STORAGE_KEY, &credential).await?;
        let credential = Arc::new(credential);
        self.current.store(Some(credential.clone()));

        tracing::info!(
            rotation_count = credential.rotation_count,
            fallback_count = credential.fallbacks.len(),
            "API keys rotated"
        );
        let _ = self.events.send(KeyEvent::KeyRotated {
            rotation_count: credential.rotation_count,
            fallback_count: credential.fallbacks.len(),
            expires_at: credential.expires_at,
        });
        Ok(credential)
    }

    /// True iff `key` is the primary or one of the fallbacks.
    pub async fn validate_key(&self, key: &str) -> SecurityResult<bool> {
        let current = self.get_current_key().await?;
        let mut valid = constant_time_eq(current.primary.as_bytes(), key.as_bytes());
        for fallback in &current.fallbacks {
            valid |= constant_time_eq(fallback.as_bytes(), key.as_bytes());
        }
        Ok(valid)
    }

    pub fn rotation_status(&self) -> RotationStatus {
        let current = self.current.load_full();
        RotationStatus {
            is_rotation_enabled: self.rotation_enabled,
            next_rotation: current.as_ref().map_or(0, |c| c.expires_at),
            rotation_count: current.as_ref().map_or(0, |c| c.rotation_count),
            keys_count: current.as_ref().map_or(0, |c| c.keys_count()),
        }
    }

    /// Change the key lifetime; the current key's expiry is recomputed from its creation time.
    pub async fn update_rotation_interval(&self, interval: Duration) -> SecurityResult<()> {
        let interval_ms = interval.as_millis() as u64;
        let _guard = self.rotation_lock.lock().await;
        self.rotation_interval_ms.store(interval_ms, Ordering::Relaxed);

        if let Some(current) = self.current.load_full() {
            let mut updated = (*current).clone();
            updated.expires_at = updated.created_at + interval_ms;
            self.storage.store(STORAGE_KEY, &updated).await?;
            self.current.store(Some(Arc::new(updated)));
        }
        tracing::info!(interval_ms, "API key rotation interval updated");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    /// Schedule periodic forced rotation when enabled in config.
    pub fn spawn_background_rotation(self: &Arc<Self>, scheduler: &Scheduler) -> Option<TaskHandle> {
        if !self.rotation_enabled || !self.background_rotation {
            return None;
        }
        let period = Duration::from_millis(self.rotation_interval_ms.load(Ordering::Relaxed).max(1));
        let manager = Arc::clone(self);
        Some(scheduler.every("api_key_rotation", period, move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.rotate_keys().await {
                    tracing::error!(error = %e, "Background API key rotation failed");
                }
            }
        }))
    }

    fn generate_key(&self) -> String {
        let mut bytes = vec![0u8; self.key_length];
        OsRng.fill_bytes(&mut bytes);
        format!("{}{}", KEY_PREFIX, hex::encode(bytes))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn storage() -> Arc<SecureStorage> {
        Arc::new(SecureStorage::in_memory(&StorageConfig {
            memory_only: true,
            pbkdf2_iterations: 1_000,
            ..StorageConfig::default()
        }))
    }

    fn manager(config: ApiKeyConfig) -> ApiKeyManager {
        ApiKeyManager::new(&config, storage())
    }

    #[tokio::test]
    async fn test_initialize_generates_keys() {
        let mgr = manager(ApiKeyConfig::default());
        mgr.initialize(None).await.unwrap();

        let current = mgr.get_current_key().await.unwrap();
        assert!(current.primary.starts_with("hsk_"));
        assert_eq!(current.primary.len(), 4 + 64);
        assert_eq!(current.fallbacks.len(), 2);
        assert_eq!(current.rotation_count, 0);
        assert_eq!(current.expires_at - current.created_at, 86_400_000);
    }

    #[tokio::test]
    async fn test_initialize_loads_persisted_keys() {
        let storage = storage();
        let first = ApiKeyManager::new(&ApiKeyConfig::default(), storage.clone());
        first.initialize(None).await.unwrap();
        let primary = first.get_current_key().await.unwrap().primary.clone();

        let second = ApiKeyManager::new(&ApiKeyConfig::default(), storage);
        second.initialize(None).await.unwrap();
        assert_eq!(second.get_current_key().await.unwrap().primary, primary);
    }

    #[tokio::test]
    async fn test_rotation_demotes_primary() {
        let mgr = manager(ApiKeyConfig::default());
        mgr.initialize(Some(InitialKeys { primary: "hsk_a".into(), fallbacks: vec!["hsk_b".into()] }))
            .await
            .unwrap();

        let rotated = mgr.rotate_keys().await.unwrap();
        assert_ne!(rotated.primary, "hsk_a");
        assert_eq!(rotated.fallbacks, vec!["hsk_a", "hsk_b"]);
        assert_eq!(rotated.rotation_count, 1);

        assert!(mgr.validate_key("hsk_a").await.unwrap());
        assert!(mgr.validate_key(&rotated.primary).await.unwrap());
        assert!(!mgr.validate_key("hsk_unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_ring_is_bounded() {
        let mgr = manager(ApiKeyConfig { max_fallback_keys: 3, ..ApiKeyConfig::default() });
        mgr.initialize(None).await.unwrap();

        let mut previous = Vec::new();
        for n in 1..=10u64 {
            previous.insert(0, mgr.get_current_key().await.unwrap().primary.clone());
            let credential = mgr.rotate_keys().await.unwrap();
            assert!(credential.fallbacks.len() <= 3);
            assert_eq!(credential.rotation_count, n);
            assert_eq!(credential.fallbacks[0], previous[0]);
        }
        // Oldest keys fall out of the ring.
        assert!(!mgr.validate_key(&previous[9]).await.unwrap());
        assert_eq!(mgr.rotation_status().keys_count, 4);
    }

    #[tokio::test]
    async fn test_rotation_disabled() {
        let mgr = manager(ApiKeyConfig { rotation_enabled: false, ..ApiKeyConfig::default() });
        mgr.initialize(None).await.unwrap();
        assert!(matches!(mgr.rotate_keys().await, Err(SecurityError::RotationDisabled)));

        // Expired keys stay in use rather than failing requests.
        mgr.update_rotation_interval(Duration::ZERO).await.unwrap();
        let current = mgr.get_current_key().await.unwrap();
        assert_eq!(current.rotation_count, 0);
    }

    #[tokio::test]
    async fn test_lazy_rotation_on_expiry() {
        let mgr = manager(ApiKeyConfig::default());
        mgr.initialize(None).await.unwrap();
        let mut events = mgr.subscribe();

        mgr.update_rotation_interval(Duration::ZERO).await.unwrap();
        let rotated = mgr.get_current_key().await.unwrap();
        assert_eq!(rotated.rotation_count, 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, KeyEvent::KeyRotated { rotation_count: 1, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_rotations_are_serialized() {
        let mgr = Arc::new(manager(ApiKeyConfig::default()));
        mgr.initialize(None).await.unwrap();

        let rotations: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.rotate_keys().await.unwrap().rotation_count })
            })
            .collect();
        let mut counts = Vec::new();
        for handle in rotations {
            counts.push(handle.await.unwrap());
        }
        counts.sort();
        assert_eq!(counts, (1..=8).collect::<Vec<_>>());
        assert_eq!(mgr.rotation_status().rotation_count, 8);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let credential = Credential {
            primary: "hsk_secret".into(),
            fallbacks: vec!["hsk_old".into()],
            created_at: 0,
            expires_at: 1,
            rotation_count: 0,
        };
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("hsk_secret"));
        assert!(!rendered.contains("hsk_old"));
    }
}
