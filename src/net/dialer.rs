//! Connection establishment seam for the websocket supervisor.
//!
//! A [`Dialer`] turns a URL into a [`WsLink`]: a pair of frame channels. The
//! production dialer runs tokio-tungstenite over the pinned rustls config; tests
//! script links directly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use url::Url;

use crate::error::{SecurityError, SecurityResult};
use crate::net::pinning::{pinned_client_config, CertificatePinner, PinMismatchSlot};

/// Close code the peer never sent explicitly (stream ended or errored).
pub const ABNORMAL_CLOSURE: u16 = 1006;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Tungstenite answers pings itself, so its links never deliver one inbound.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16),
}

/// An established connection as seen by the supervisor.
#[derive(Debug)]
pub struct WsLink {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl WsLink {
    /// Two linked ends; the second is the peer's view.
    pub fn pair() -> (WsLink, WsLink) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            WsLink {
                outbound: a_tx,
                inbound: b_rx,
            },
            WsLink {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &Url) -> SecurityResult<WsLink>;
}

pub struct TungsteniteDialer {
    connector: Arc<rustls::ClientConfig>,
    mismatch: PinMismatchSlot,
    max_message_size: usize,
}

impl TungsteniteDialer {
    /// Frames or messages larger than `max_message_size` fail the read
    /// instead of being buffered.
    pub fn new(pinner: CertificatePinner, max_message_size: usize) -> SecurityResult<Self> {
        let (connector, mismatch) = pinned_client_config(pinner)?;
        Ok(Self {
            connector,
            mismatch,
            max_message_size,
        })
    }

    fn protocol_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }

    fn take_mismatch(&self) -> Option<String> {
        self.mismatch.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: &Url) -> SecurityResult<WsLink> {
        if url.scheme() != "wss" {
            return Err(SecurityError::InvalidInput(format!(
                "refusing non-TLS websocket url '{}'",
                url
            )));
        }
        let connected = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            Some(self.protocol_config()),
            false,
            Some(Connector::Rustls(Arc::clone(&self.connector))),
        )
        .await;

        let (stream, _response) = match connected {
            Ok(ok) => ok,
            Err(e) => {
                if let Some(fingerprint) = self.take_mismatch() {
                    return Err(SecurityError::CertificatePinMismatch { fingerprint });
                }
                return Err(SecurityError::WebSocket(e.to_string()));
            }
        };

        let (mut sink, mut source) = stream.split();
        let (ours, mut theirs) = WsLink::pair();
        let inbound_tx = theirs.outbound.clone();

        tokio::spawn(async move {
            while let Some(frame) = theirs.inbound.recv().await {
                let closing = matches!(frame, Frame::Close(_));
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Ping(data) => Message::Ping(data.into()),
                    Frame::Pong(data) => Message::Pong(data.into()),
                    Frame::Close(code) => Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: "closing".into(),
                    })),
                };
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut close_code = ABNORMAL_CLOSURE;
            while let Some(message) = source.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break;
                    }
                };
                let Some(frame) = inbound_frame(message) else { continue };
                if let Frame::Close(code) = frame {
                    close_code = code;
                    break;
                }
                if inbound_tx.send(frame).await.is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(Frame::Close(close_code)).await;
        });

        Ok(ours)
    }
}

/// Map a tungstenite message to the frame the supervisor sees, if any.
fn inbound_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(_) => {
            tracing::debug!("Ignoring binary websocket frame");
            None
        }
        // Already answered by tungstenite on the next write or flush.
        Message::Ping(_) => None,
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(frame) => Some(Frame::Close(frame.map(|f| u16::from(f.code)).unwrap_or(1005))),
        Message::Frame(_) => None,
    }
}
