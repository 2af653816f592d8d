//! Shared utilities for integration and load testing.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use hypersim_security::audit::{AuditSink, SecurityAuditor, SecurityEvent};
use hypersim_security::config::{AuditConfig, SecurityConfig, StorageConfig};
use hypersim_security::net::{Dialer, WsLink};
use hypersim_security::signing::RequestSigner;
use hypersim_security::storage::SecureStorage;
use hypersim_security::{RequestMeta, SecurityError, SecurityManager, SecurityResult, SignedRequest, Transport, TransportResponse};

pub const USER_AGENT: &str = "hypersim-sdk/1.0 (rust)";

/// Memory-only storage with a cheap KDF.
pub fn fast_storage_config() -> StorageConfig {
    StorageConfig {
        memory_only: true,
        pbkdf2_iterations: 1_000,
        ..StorageConfig::default()
    }
}

pub fn fast_config() -> SecurityConfig {
    let mut config = SecurityConfig::default();
    config.storage = fast_storage_config();
    config.websocket.jitter = false;
    config
}

pub fn caller(ip: &str) -> RequestMeta {
    RequestMeta::new().with_ip(ip).with_header("user-agent", USER_AGENT)
}

/// Audit sink that keeps every batch in memory and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<SecurityEvent>>,
    pub failing: AtomicBool,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn write(&self, events: &[SecurityEvent]) -> SecurityResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SecurityError::Storage("sink offline".into()));
        }
        self.events.lock().unwrap().extend_from_slice(events);
        Ok(())
    }
}

/// Manager over in-memory storage with its audit trail captured by a [`RecordingSink`].
pub fn manager(config: SecurityConfig) -> (SecurityManager, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let audit = AuditConfig {
        buffer_size: 1_000,
        ..AuditConfig::default()
    };
    let auditor = Arc::new(SecurityAuditor::with_sinks(&audit, vec![sink.clone() as Arc<dyn AuditSink>]));
    let storage = Arc::new(SecureStorage::in_memory(&config.storage));
    (SecurityManager::with_parts(config, storage, auditor), sink)
}

/// How the in-memory transport answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Signed echo of the request data.
    Signed,
    /// Signed echo with the data swapped after signing.
    Tampered,
    /// Signed, but bound to some other request's nonce.
    WrongRequest,
    /// Plain JSON body.
    Unsigned,
    Status(u16),
    Unreachable,
}

/// In-memory server: answers each request with a response signed under its own key.
pub struct MemoryTransport {
    server: RequestSigner,
    reply: Reply,
    pub sent: Mutex<Vec<SignedRequest>>,
}

impl MemoryTransport {
    pub async fn new(reply: Reply) -> Self {
        let storage = Arc::new(SecureStorage::in_memory(&fast_storage_config()));
        let server = RequestSigner::new(&Default::default(), storage);
        server.initialize().await.unwrap();
        Self {
            server,
            reply,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> &str {
        "memory://hypersim/v1/simulate"
    }

    async fn send(&self, request: &SignedRequest) -> SecurityResult<TransportResponse> {
        self.sent.lock().unwrap().push(request.clone());
        let echo = json!({"echo": request.payload().clone()});
        let body = match self.reply {
            Reply::Unreachable => return Err(SecurityError::Transport("connection refused".into())),
            Reply::Status(status) => {
                return Ok(TransportResponse {
                    status,
                    body: json!({"error": "upstream failure"}).to_string(),
                })
            }
            Reply::Unsigned => echo.to_string(),
            Reply::Signed | Reply::Tampered | Reply::WrongRequest => {
                let envelope = match self.reply {
                    Reply::WrongRequest => self.server.sign_request(json!({"other": true})).await?,
                    _ => request
                        .envelope()
                        .cloned()
                        .ok_or_else(|| SecurityError::Transport("request was not signed".into()))?,
                };
                let mut response = self.server.sign_response(echo, &envelope).await?;
                if self.reply == Reply::Tampered {
                    response.data = json!({"echo": "forged"});
                }
                serde_json::to_string(&response)?
            }
        };
        Ok(TransportResponse { status: 200, body })
    }
}

/// Dialer handing out pre-built links, then refusing.
#[derive(Default)]
pub struct ScriptedDialer {
    script: Mutex<VecDeque<SecurityResult<WsLink>>>,
    pub dials: AtomicUsize,
}

impl ScriptedDialer {
    pub fn with(results: Vec<SecurityResult<WsLink>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, _url: &Url) -> SecurityResult<WsLink> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SecurityError::WebSocket("connection refused".into())))
    }
}

pub fn payload(n: u64) -> Value {
    json!({"action": "simulate", "block": n})
}
