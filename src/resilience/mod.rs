//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! Websocket connection lost:
//!     → backoff.rs (exponential delay, capped, optional jitter)
//!     → reconnect attempt
//! ```

pub mod backoff;

pub use backoff::Backoff;
