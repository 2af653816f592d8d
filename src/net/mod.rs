//! Hardened websocket transport.
//!
//! # Data Flow
//! ```text
//! SecureWebSocket::connect(url)
//!     → websocket.rs supervisor task
//!     → dialer.rs (tokio-tungstenite over rustls)
//!         → pinning.rs (WebPKI chain check, then leaf SHA-256 pin check)
//!     → Open: message.rs validates every frame in and out
//!     → heartbeat ping / pong, reconnect with backoff on abnormal close
//! ```
//!
//! # Design Decisions
//! - A pin mismatch is terminal; there is no unpinned fallback
//! - Messages sent while reconnecting are queued and expire after a fixed age
//! - `close()` cancels heartbeat and backoff timers by ending the supervisor

pub mod dialer;
pub mod message;
pub mod pinning;
pub mod websocket;

pub use dialer::{Dialer, Frame, TungsteniteDialer, WsLink};
pub use pinning::CertificatePinner;
pub use websocket::{ConnectionState, SecureWebSocket, WsEvent};
