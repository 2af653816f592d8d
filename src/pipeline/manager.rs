//! Subsystem entry point wiring every component into the request pipeline.

use secrecy::SecretString;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::audit::{SecurityAuditor, SecurityEvent, SecurityEventType, Severity};
use crate::clock::now_millis;
use crate::config::validation::validate_config;
use crate::config::SecurityConfig;
use crate::credentials::{ApiKeyManager, InitialKeys, KeyEvent};
use crate::error::{SecurityError, SecurityResult};
use crate::lifecycle::Scheduler;
use crate::multisig::MultiSignature;
use crate::net::{Dialer, SecureWebSocket, WsEvent};
use crate::observability::metrics::{MetricsSnapshot, SecurityMetrics};
use crate::pipeline::context::{RequestContext, SignedRequest};
use crate::pipeline::transport::Transport;
use crate::security::{InputSanitizer, PolicyFinding, PolicyScanner, RateLimiter, RequestMeta};
use crate::signing::{RequestSigner, SignedResponse};
use crate::storage::SecureStorage;

/// Owns every security component and runs requests through them in order:
/// admission, sanitization, policy scan, signing, credential headers.
pub struct SecurityManager {
    config: SecurityConfig,
    storage: Arc<SecureStorage>,
    api_keys: Arc<ApiKeyManager>,
    signer: Arc<RequestSigner>,
    multisig: Arc<MultiSignature>,
    rate_limiter: Arc<RateLimiter>,
    sanitizer: InputSanitizer,
    scanner: PolicyScanner,
    auditor: Arc<SecurityAuditor>,
    metrics: Arc<SecurityMetrics>,
    scheduler: Scheduler,
    websockets: Mutex<Vec<Weak<SecureWebSocket>>>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

impl SecurityManager {
    /// Validate `config` and open storage and the auditor it describes.
    pub async fn new(config: SecurityConfig, master_secret: Option<SecretString>) -> SecurityResult<Self> {
        validate_config(&config).map_err(|errors| {
            SecurityError::InvalidConfig(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let storage = Arc::new(SecureStorage::open(&config.storage, master_secret).await?);
        let auditor = Arc::new(SecurityAuditor::new(&config.audit).await?);
        Ok(Self::with_parts(config, storage, auditor))
    }

    /// Assemble around an existing store and auditor.
    pub fn with_parts(config: SecurityConfig, storage: Arc<SecureStorage>, auditor: Arc<SecurityAuditor>) -> Self {
        Self {
            api_keys: Arc::new(ApiKeyManager::new(&config.api_keys, Arc::clone(&storage))),
            signer: Arc::new(RequestSigner::new(&config.signing, Arc::clone(&storage))),
            multisig: Arc::new(MultiSignature::new(Arc::clone(&storage))),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            sanitizer: InputSanitizer::new(config.validation.level),
            scanner: PolicyScanner::new(config.validation.policy_scan),
            metrics: Arc::new(SecurityMetrics::default()),
            scheduler: Scheduler::new(),
            websockets: Mutex::new(Vec::new()),
            init_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            config,
            storage,
            auditor,
        }
    }

    /// Load or create credentials and key material, then start background jobs.
    /// Calling it again is a no-op.
    pub async fn initialize(&self, initial_keys: Option<InitialKeys>) -> SecurityResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let rotations = self.api_keys.subscribe();
        self.api_keys.initialize(initial_keys).await?;
        if self.config.signing.enabled {
            self.signer.initialize().await?;
        }
        if self.config.multisig.enabled && !self.multisig.load().await? {
            tracing::info!("No multisig policy persisted yet");
        }

        self.spawn_background_tasks(rotations);
        self.initialized.store(true, Ordering::Release);

        tracing::info!(
            signing = self.config.signing.enabled,
            multisig = self.config.multisig.enabled,
            validation_level = ?self.config.validation.level,
            scheduled_tasks = self.scheduler.active_tasks(),
            "Security manager initialized"
        );
        Ok(())
    }

    fn spawn_background_tasks(&self, mut rotations: tokio::sync::broadcast::Receiver<KeyEvent>) {
        self.api_keys.spawn_background_rotation(&self.scheduler);
        self.rate_limiter.spawn_cleanup(&self.scheduler);
        self.auditor.spawn_flush_timer(&self.scheduler);

        if self.config.signing.enabled {
            let signer = Arc::clone(&self.signer);
            let period = Duration::from_secs(self.config.signing.replay_tolerance_secs.max(1));
            self.scheduler.every("nonce_prune", period, move || {
                let signer = signer.clone();
                async move {
                    let pruned = signer.prune_nonces(now_millis());
                    if pruned > 0 {
                        tracing::debug!(pruned, "Pruned expired nonces");
                    }
                }
            });
        }

        let auditor = Arc::clone(&self.auditor);
        let metrics = Arc::clone(&self.metrics);
        self.scheduler.spawn("key_rotation_audit", async move {
            loop {
                match rotations.recv().await {
                    Ok(KeyEvent::KeyRotated {
                        rotation_count,
                        fallback_count,
                        expires_at,
                    }) => {
                        metrics.record_key_rotation();
                        auditor
                            .log(
                                SecurityEvent::new(SecurityEventType::ApiKeyRotation, Severity::Low, "API keys rotated")
                                    .with_metadata("rotation_count", rotation_count)
                                    .with_metadata("fallback_count", fallback_count)
                                    .with_metadata("expires_at", expires_at),
                            )
                            .await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Key rotation listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Run `payload` through the whole pipeline.
    ///
    /// Every rejection is counted and audited before the error is returned.
    pub async fn secure_request(&self, payload: Value, meta: &RequestMeta) -> SecurityResult<SignedRequest> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(SecurityError::NotInitialized("SecurityManager"));
        }
        self.metrics.record_request();

        match self.run_pipeline(payload, meta).await {
            Ok(request) => Ok(request),
            Err(e) => {
                self.record_rejection(&e, meta).await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, payload: Value, meta: &RequestMeta) -> SecurityResult<SignedRequest> {
        self.rate_limiter.admit(meta).await?;

        let scanned = RequestContext::new(payload, meta.clone())
            .sanitize(&self.sanitizer)?
            .scan(&self.scanner);
        if !scanned.findings().is_empty() {
            self.report_findings(scanned.findings(), meta).await?;
        }

        let credential = self.api_keys.get_current_key().await?;
        let signer = self.config.signing.enabled.then_some(self.signer.as_ref());
        scanned.sign(signer, &credential).await
    }

    async fn report_findings(&self, findings: &[PolicyFinding], meta: &RequestMeta) -> SecurityResult<()> {
        self.metrics.record_policy_findings(findings.len());
        let categories: Vec<&str> = findings.iter().map(|f| f.category).collect();
        self.auditor
            .log(
                SecurityEvent::new(
                    SecurityEventType::OwaspViolation,
                    Severity::High,
                    format!("Policy scan reported {} finding(s)", findings.len()),
                )
                .with_metadata("violations", serde_json::to_value(findings)?)
                .with_metadata("identifier", meta.identifier())
                .with_metadata("ip", meta.client_ip()),
            )
            .await;

        if self.config.validation.block_on_policy_findings {
            return Err(SecurityError::PolicyViolation(categories.join(", ")));
        }
        tracing::warn!(findings = ?categories, "Advisory policy findings");
        Ok(())
    }

    async fn record_rejection(&self, error: &SecurityError, meta: &RequestMeta) {
        self.metrics.record_blocked(error.label());
        if matches!(error, SecurityError::SignatureInvalid(_) | SecurityError::ReplayDetected(_)) {
            self.metrics.record_signature_failure();
        }

        let (event_type, severity) = match error {
            SecurityError::RateLimitExceeded { .. }
            | SecurityError::QueueFull(_)
            | SecurityError::RequestTimeout(_) => (SecurityEventType::RateLimitExceeded, Severity::Medium),
            SecurityError::DdosDetected(_) => (SecurityEventType::DdosAttempt, Severity::Critical),
            SecurityError::InvalidInput(_) => (SecurityEventType::InvalidInput, Severity::Medium),
            SecurityError::SignatureInvalid(_) | SecurityError::ReplayDetected(_) => {
                (SecurityEventType::FailedSignature, Severity::High)
            }
            // Findings were audited when the scan ran.
            SecurityError::PolicyViolation(_) => return,
            _ => (SecurityEventType::ApiUsage, Severity::Medium),
        };
        self.auditor
            .log(
                SecurityEvent::new(event_type, severity, format!("Request rejected: {}", error))
                    .with_metadata("identifier", meta.identifier())
                    .with_metadata("ip", meta.client_ip())
                    .with_metadata("error", error.label()),
            )
            .await;
    }

    /// Secure `payload`, send it, and verify the response.
    ///
    /// Signed requests expect a [`SignedResponse`] body bound to the request
    /// nonce; its `data` is returned. Unsigned requests return the body as JSON.
    pub async fn execute(&self, payload: Value, meta: &RequestMeta, transport: &dyn Transport) -> SecurityResult<Value> {
        let request = self.secure_request(payload, meta).await?;

        let started = Instant::now();
        let response = transport.send(&request).await?;
        self.auditor
            .log_api_usage(
                transport.endpoint(),
                "POST",
                response.status,
                started.elapsed().as_millis() as u64,
                meta.client_id.as_deref(),
            )
            .await;
        if !response.is_success() {
            return Err(SecurityError::Transport(format!(
                "{} returned HTTP {}",
                transport.endpoint(),
                response.status
            )));
        }

        if request.envelope().is_none() {
            return Ok(serde_json::from_str(&response.body)?);
        }
        match serde_json::from_str::<SignedResponse>(&response.body) {
            Ok(signed) => {
                self.verify_response(&signed, &request).await?;
                Ok(signed.data)
            }
            Err(e) => {
                let error = SecurityError::SignatureInvalid(format!("response is not a signed envelope: {}", e));
                self.record_signature_failure(&error, &request).await;
                Err(error)
            }
        }
    }

    /// Check that `response` is a fresh, valid answer to `request`.
    /// Always succeeds for requests that were not signed.
    pub async fn verify_response(&self, response: &SignedResponse, request: &SignedRequest) -> SecurityResult<()> {
        let Some(envelope) = request.envelope() else {
            return Ok(());
        };
        if let Err(e) = self.signer.verify_response(response, envelope).await {
            self.record_signature_failure(&e, request).await;
            return Err(e);
        }
        Ok(())
    }

    async fn record_signature_failure(&self, error: &SecurityError, request: &SignedRequest) {
        self.metrics.record_signature_failure();
        self.auditor
            .log(
                SecurityEvent::new(
                    SecurityEventType::FailedSignature,
                    Severity::High,
                    format!("Response verification failed: {}", error),
                )
                .with_metadata("request_nonce", request.envelope().map(|e| e.nonce.clone()))
                .with_metadata("identifier", request.meta().identifier())
                .with_metadata("error", error.label()),
            )
            .await;
    }

    /// Force an API key rotation.
    pub async fn rotate_api_keys(&self) -> SecurityResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(SecurityError::NotInitialized("SecurityManager"));
        }
        match self.api_keys.force_rotation().await {
            Ok(credential) => {
                tracing::info!(rotation_count = credential.rotation_count, "API keys rotated on request");
                Ok(())
            }
            Err(e) => {
                self.auditor
                    .log(
                        SecurityEvent::new(
                            SecurityEventType::ApiKeyRotation,
                            Severity::High,
                            format!("API key rotation failed: {}", e),
                        )
                        .with_metadata("error", e.label()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Open a pinned websocket using the configured certificate pins.
    pub fn create_secure_websocket(&self, url: &str) -> SecurityResult<Arc<SecureWebSocket>> {
        let ws = Arc::new(SecureWebSocket::connect_pinned(url, &self.config.websocket)?);
        self.track_websocket(&ws);
        Ok(ws)
    }

    /// Open a websocket over a caller-supplied dialer.
    pub fn create_websocket_with(&self, url: &str, dialer: Arc<dyn Dialer>) -> SecurityResult<Arc<SecureWebSocket>> {
        let ws = Arc::new(SecureWebSocket::connect(url, &self.config.websocket, dialer)?);
        self.track_websocket(&ws);
        Ok(ws)
    }

    fn track_websocket(&self, ws: &Arc<SecureWebSocket>) {
        let mut events = ws.events();
        let url = ws.url().to_string();
        let auditor = Arc::clone(&self.auditor);
        self.scheduler.spawn("websocket_audit", async move {
            loop {
                match events.recv().await {
                    Ok(WsEvent::PinMismatch { fingerprint }) => {
                        auditor
                            .log(
                                SecurityEvent::new(
                                    SecurityEventType::CertificateMismatch,
                                    Severity::Critical,
                                    "Websocket certificate pin mismatch",
                                )
                                .with_metadata("url", url.as_str())
                                .with_metadata("fingerprint", fingerprint),
                            )
                            .await;
                        break;
                    }
                    Ok(WsEvent::MaxReconnectsReached) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        });

        let mut sockets = self.websockets.lock().unwrap_or_else(|e| e.into_inner());
        sockets.retain(|weak| weak.strong_count() > 0);
        sockets.push(Arc::downgrade(ws));
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<SecureStorage> {
        &self.storage
    }

    pub fn api_keys(&self) -> &Arc<ApiKeyManager> {
        &self.api_keys
    }

    pub fn signer(&self) -> &Arc<RequestSigner> {
        &self.signer
    }

    pub fn multisig(&self) -> &Arc<MultiSignature> {
        &self.multisig
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn sanitizer(&self) -> &InputSanitizer {
        &self.sanitizer
    }

    pub fn scanner(&self) -> PolicyScanner {
        self.scanner
    }

    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    /// Close open websockets, cancel every scheduled job and flush the audit log.
    pub async fn shutdown(&self) -> SecurityResult<()> {
        let sockets: Vec<Arc<SecureWebSocket>> = {
            let mut tracked = self.websockets.lock().unwrap_or_else(|e| e.into_inner());
            tracked.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for ws in &sockets {
            ws.close().await;
        }
        self.scheduler.shutdown().await;
        self.auditor.shutdown().await?;
        self.initialized.store(false, Ordering::Release);
        tracing::info!(websockets_closed = sockets.len(), "Security manager shut down");
        Ok(())
    }
}
