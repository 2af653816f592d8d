//! Supervised websocket connection with pinning, heartbeat and reconnection.
//!
//! # State Machine
//! ```text
//! Connecting ──dial ok──▶ Open ──close ≠ 1000 / stale──▶ Reconnecting ──backoff──▶ Connecting
//!     │                    │                                  │
//!     │ pin mismatch       │ close 1000 / close()             │ attempts exhausted / close()
//!     ▼                    ▼                                  ▼
//! Disconnected (terminal) ◀───────────────────────────────────┘
//! ```

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use url::Url;

use crate::clock::now_millis;
use crate::config::WebSocketConfig;
use crate::error::{SecurityError, SecurityResult};
use crate::net::dialer::{Dialer, Frame, TungsteniteDialer, WsLink, ABNORMAL_CLOSURE};
use crate::net::message::{subscribe_envelope, unsubscribe_envelope, validate_inbound, validate_outbound};
use crate::net::pinning::CertificatePinner;
use crate::observability::metrics;
use crate::resilience::Backoff;

pub const NORMAL_CLOSURE: u16 = 1000;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Message(Value),
    /// No pong within one heartbeat interval; the link is dropped.
    Stale,
    Disconnected { code: u16 },
    MaxReconnectsReached,
    PinMismatch { fingerprint: String },
}

#[derive(Debug)]
struct Outbound {
    text: String,
    queued_at: Instant,
}

pub struct SecureWebSocket {
    url: Url,
    max_message_size: usize,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<WsEvent>,
    commands: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SecureWebSocket {
    /// Connect over TLS using the configured certificate pins.
    pub fn connect_pinned(url: &str, config: &WebSocketConfig) -> SecurityResult<Self> {
        let pinner = CertificatePinner::new(&config.certificate_pins)?;
        Self::connect(url, config, Arc::new(TungsteniteDialer::new(pinner, config.max_message_size)?))
    }

    /// Start the connection supervisor. Subscribe to [`events`](Self::events)
    /// before yielding to the runtime to observe the first `Connected`.
    pub fn connect(url: &str, config: &WebSocketConfig, dialer: Arc<dyn Dialer>) -> SecurityResult<Self> {
        let url = Url::parse(url).map_err(|e| SecurityError::InvalidInput(format!("websocket url: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SecurityError::InvalidInput(format!(
                "unsupported websocket scheme '{}'",
                url.scheme()
            )));
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let supervisor = Supervisor {
            url: url.clone(),
            config: config.clone(),
            dialer,
            backoff: Backoff::new(config.reconnect_delay_ms, config.max_reconnect_delay_ms, config.jitter),
            state: state_tx,
            events: events.clone(),
            commands: commands_rx,
            closed: closed_rx,
            queue: VecDeque::new(),
        };
        let task = tokio::spawn(supervisor.run());

        Ok(Self {
            url,
            max_message_size: config.max_message_size,
            state: state_rx,
            events,
            commands: commands_tx,
            closed: closed_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<WsEvent> {
        self.events.subscribe()
    }

    /// Validate and send `message`, queuing it while reconnecting.
    pub fn send(&self, message: &Value) -> SecurityResult<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(SecurityError::WebSocket("connection closed".into()));
        }
        let text = validate_outbound(message, self.max_message_size)?;
        self.commands
            .send(Outbound {
                text,
                queued_at: Instant::now(),
            })
            .map_err(|_| SecurityError::WebSocket("connection closed".into()))
    }

    pub fn subscribe(&self, channel: &str, params: Option<Value>) -> SecurityResult<()> {
        self.send(&subscribe_envelope(channel, params))
    }

    pub fn unsubscribe(&self, channel: &str) -> SecurityResult<()> {
        self.send(&unsubscribe_envelope(channel))
    }

    /// Close with code 1000 and cancel any pending heartbeat or backoff.
    pub async fn close(&self) {
        let _ = self.closed.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "websocket supervisor ended abnormally");
            }
        }
    }
}

enum LinkEnd {
    Closed,
    Dropped(u16),
}

struct Supervisor {
    url: Url,
    config: WebSocketConfig,
    dialer: Arc<dyn Dialer>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<WsEvent>,
    commands: mpsc::UnboundedReceiver<Outbound>,
    closed: watch::Receiver<bool>,
    queue: VecDeque<Outbound>,
}

/// Resolve once `close()` has been called or the socket handle is gone.
async fn close_requested(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let dialed = tokio::select! {
                result = self.dialer.dial(&self.url) => result,
                _ = close_requested(&mut self.closed) => {
                    self.finish(Some(NORMAL_CLOSURE));
                    return;
                }
            };

            match dialed {
                Ok(link) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Open);
                    self.emit(WsEvent::Connected);
                    tracing::info!(url = %self.url, "websocket connected");
                    match self.run_link(link).await {
                        LinkEnd::Closed => {
                            self.finish(Some(NORMAL_CLOSURE));
                            return;
                        }
                        LinkEnd::Dropped(NORMAL_CLOSURE) => {
                            tracing::info!(url = %self.url, "websocket closed by server");
                            self.finish(Some(NORMAL_CLOSURE));
                            return;
                        }
                        LinkEnd::Dropped(code) => {
                            tracing::warn!(url = %self.url, code, "websocket connection lost");
                            self.emit(WsEvent::Disconnected { code });
                        }
                    }
                }
                Err(SecurityError::CertificatePinMismatch { fingerprint }) => {
                    tracing::error!(url = %self.url, fingerprint = %fingerprint, "Refusing connection with unpinned certificate");
                    self.finish(None);
                    self.emit(WsEvent::PinMismatch { fingerprint });
                    return;
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt, error = %e, "websocket dial failed");
                }
            }

            if attempt >= self.config.max_reconnect_attempts {
                tracing::error!(url = %self.url, attempts = attempt, "websocket reconnect attempts exhausted");
                self.finish(None);
                self.emit(WsEvent::MaxReconnectsReached);
                return;
            }

            let delay = self.backoff.delay(attempt);
            attempt += 1;
            metrics::record_ws_reconnect(attempt);
            self.set_state(ConnectionState::Reconnecting);
            self.emit(WsEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = close_requested(&mut self.closed) => {
                    self.finish(Some(NORMAL_CLOSURE));
                    return;
                }
            }
        }
    }

    async fn run_link(&mut self, mut link: WsLink) -> LinkEnd {
        if !self.flush_queue(&link).await {
            return LinkEnd::Dropped(ABNORMAL_CLOSURE);
        }

        let period = Duration::from_secs(self.config.heartbeat_interval_secs);
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(Frame::Text(text)) => match validate_inbound(&text, self.config.max_message_size) {
                        Ok(value) => self.emit(WsEvent::Message(value)),
                        Err(e) => tracing::warn!(error = %e, "Dropping inbound websocket message"),
                    },
                    Some(Frame::Ping(data)) => {
                        let _ = link.outbound.send(Frame::Pong(data)).await;
                    }
                    Some(Frame::Pong(_)) => awaiting_pong = false,
                    Some(Frame::Close(code)) => return LinkEnd::Dropped(code),
                    None => return LinkEnd::Dropped(ABNORMAL_CLOSURE),
                },
                command = self.commands.recv() => match command {
                    Some(out) => {
                        if link.outbound.send(Frame::Text(out.text.clone())).await.is_err() {
                            self.queue.push_back(out);
                            return LinkEnd::Dropped(ABNORMAL_CLOSURE);
                        }
                    }
                    None => {
                        let _ = link.outbound.send(Frame::Close(NORMAL_CLOSURE)).await;
                        return LinkEnd::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        tracing::warn!(url = %self.url, "websocket heartbeat missed, connection stale");
                        self.emit(WsEvent::Stale);
                        return LinkEnd::Dropped(ABNORMAL_CLOSURE);
                    }
                    awaiting_pong = true;
                    let _ = link.outbound.send(Frame::Ping(now_millis().to_be_bytes().to_vec())).await;
                }
                _ = close_requested(&mut self.closed) => {
                    let _ = link.outbound.send(Frame::Close(NORMAL_CLOSURE)).await;
                    return LinkEnd::Closed;
                }
            }
        }
    }

    /// Send queued messages still younger than the queue age limit.
    async fn flush_queue(&mut self, link: &WsLink) -> bool {
        while let Ok(out) = self.commands.try_recv() {
            self.queue.push_back(out);
        }
        let max_age = Duration::from_secs(self.config.queue_max_age_secs);
        let before = self.queue.len();
        self.queue.retain(|out| out.queued_at.elapsed() <= max_age);
        let expired = before - self.queue.len();
        if expired > 0 {
            tracing::warn!(expired, "Dropped expired queued websocket messages");
        }

        while let Some(out) = self.queue.pop_front() {
            if link.outbound.send(Frame::Text(out.text.clone())).await.is_err() {
                self.queue.push_front(out);
                return false;
            }
        }
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: WsEvent) {
        let _ = self.events.send(event);
    }

    /// Enter the terminal state.
    fn finish(&self, code: Option<u16>) {
        self.set_state(ConnectionState::Disconnected);
        if let Some(code) = code {
            self.emit(WsEvent::Disconnected { code });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedDialer {
        script: std::sync::Mutex<VecDeque<SecurityResult<WsLink>>>,
        dials: AtomicUsize,
    }

    impl ScriptedDialer {
        fn with(results: Vec<SecurityResult<WsLink>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(results.into()),
                dials: AtomicUsize::new(0),
            })
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

    fn config() -> WebSocketConfig {
        WebSocketConfig {
            jitter: false,
            ..WebSocketConfig::default()
        }
    }

    async fn next(events: &mut broadcast::Receiver<WsEvent>) -> WsEvent {
        events.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_backs_off_until_exhausted() {
        let (link, peer) = WsLink::pair();
        let dialer = ScriptedDialer::with(vec![Ok(link)]);
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), dialer.clone()).unwrap();
        let mut events = ws.events();

        assert_eq!(next(&mut events).await, WsEvent::Connected);
        peer.outbound.send(Frame::Close(1006)).await.unwrap();
        assert_eq!(next(&mut events).await, WsEvent::Disconnected { code: 1006 });

        let started = Instant::now();
        let mut expected = Duration::from_millis(1000);
        for attempt in 1..=5 {
            assert_eq!(
                next(&mut events).await,
                WsEvent::Reconnecting { attempt, delay: expected }
            );
            expected *= 2;
        }
        assert_eq!(next(&mut events).await, WsEvent::MaxReconnectsReached);
        assert_eq!(ws.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 6);
        // 1 + 2 + 4 + 8 + 16 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert!(ws.send(&json!({"type": "ping"})).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_is_terminal() {
        let (link, peer) = WsLink::pair();
        let dialer = ScriptedDialer::with(vec![Ok(link)]);
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), dialer.clone()).unwrap();
        let mut events = ws.events();

        assert_eq!(next(&mut events).await, WsEvent::Connected);
        peer.outbound.send(Frame::Close(NORMAL_CLOSURE)).await.unwrap();
        assert_eq!(next(&mut events).await, WsEvent::Disconnected { code: 1000 });
        ws.close().await;
        assert_eq!(ws.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_mismatch_never_retries() {
        let dialer = ScriptedDialer::with(vec![Err(SecurityError::CertificatePinMismatch {
            fingerprint: "ab".repeat(32),
        })]);
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), dialer.clone()).unwrap();
        let mut events = ws.events();

        assert!(matches!(next(&mut events).await, WsEvent::PinMismatch { .. }));
        ws.close().await;
        assert_eq!(ws.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_flow_and_invalid_inbound_dropped() {
        let (link, mut peer) = WsLink::pair();
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), ScriptedDialer::with(vec![Ok(link)])).unwrap();
        let mut events = ws.events();
        assert_eq!(next(&mut events).await, WsEvent::Connected);

        ws.subscribe("blocks", None).unwrap();
        match peer.inbound.recv().await {
            Some(Frame::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "subscribe");
                assert_eq!(value["channel"], "blocks");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        peer.outbound.send(Frame::Text(r#"{"no_type":1}"#.into())).await.unwrap();
        peer.outbound.send(Frame::Text(r#"{"type":"block","n":7}"#.into())).await.unwrap();
        assert_eq!(next(&mut events).await, WsEvent::Message(json!({"type": "block", "n": 7})));

        assert!(ws.send(&json!({"missing": "type"})).is_err());
        ws.close().await;
        assert_eq!(peer.inbound.recv().await, Some(Frame::Close(NORMAL_CLOSURE)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_pong_marks_stale() {
        let (link, mut peer) = WsLink::pair();
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), ScriptedDialer::with(vec![Ok(link)])).unwrap();
        let mut events = ws.events();
        assert_eq!(next(&mut events).await, WsEvent::Connected);

        assert!(matches!(peer.inbound.recv().await, Some(Frame::Ping(_))));
        assert_eq!(next(&mut events).await, WsEvent::Stale);
        assert_eq!(next(&mut events).await, WsEvent::Disconnected { code: ABNORMAL_CLOSURE });
        ws.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_heartbeat_keeps_connection_open() {
        let (link, mut peer) = WsLink::pair();
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), ScriptedDialer::with(vec![Ok(link)])).unwrap();
        let mut events = ws.events();
        assert_eq!(next(&mut events).await, WsEvent::Connected);

        tokio::spawn(async move {
            while let Some(frame) = peer.inbound.recv().await {
                if let Frame::Ping(data) = frame {
                    let _ = peer.outbound.send(Frame::Pong(data)).await;
                }
            }
        });

        time::sleep(Duration::from_secs(200)).await;
        assert_eq!(ws.state(), ConnectionState::Open);
        ws.close().await;
        assert_eq!(ws.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_flushed_on_reconnect_and_expired_dropped() {
        let (first, first_peer) = WsLink::pair();
        let (second, mut second_peer) = WsLink::pair();
        let cfg = WebSocketConfig {
            reconnect_delay_ms: 5000,
            queue_max_age_secs: 3,
            ..config()
        };
        let ws = SecureWebSocket::connect(
            "wss://feed.hypersim.test/ws",
            &cfg,
            ScriptedDialer::with(vec![Ok(first), Ok(second)]),
        )
        .unwrap();
        let mut events = ws.events();
        assert_eq!(next(&mut events).await, WsEvent::Connected);

        first_peer.outbound.send(Frame::Close(1011)).await.unwrap();
        assert_eq!(next(&mut events).await, WsEvent::Disconnected { code: 1011 });
        assert!(matches!(next(&mut events).await, WsEvent::Reconnecting { attempt: 1, .. }));

        ws.send(&json!({"type": "order", "id": "old"})).unwrap();
        time::sleep(Duration::from_millis(3500)).await;
        ws.send(&json!({"type": "order", "id": "fresh"})).unwrap();

        assert_eq!(next(&mut events).await, WsEvent::Connected);
        match second_peer.inbound.recv().await {
            Some(Frame::Text(text)) => assert!(text.contains("fresh")),
            other => panic!("unexpected frame: {:?}", other),
        }
        ws.close().await;
    }

    struct StalledDialer;

    #[async_trait]
    impl Dialer for StalledDialer {
        async fn dial(&self, _url: &Url) -> SecurityResult<WsLink> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_dial() {
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), Arc::new(StalledDialer)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(ws.state(), ConnectionState::Connecting);

        ws.close().await;
        assert_eq!(ws.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_backoff() {
        let (link, peer) = WsLink::pair();
        let dialer = ScriptedDialer::with(vec![Ok(link)]);
        let ws = SecureWebSocket::connect("wss://feed.hypersim.test/ws", &config(), dialer.clone()).unwrap();
        let mut events = ws.events();
        assert_eq!(next(&mut events).await, WsEvent::Connected);

        peer.outbound.send(Frame::Close(1011)).await.unwrap();
        assert_eq!(next(&mut events).await, WsEvent::Disconnected { code: 1011 });
        assert!(matches!(next(&mut events).await, WsEvent::Reconnecting { attempt: 1, .. }));

        ws.close().await;
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ws.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let result = SecureWebSocket::connect("https://example.com", &config(), ScriptedDialer::with(vec![]));
            assert!(matches!(result, Err(SecurityError::InvalidInput(_))));
        });
    }
}
