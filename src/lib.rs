//! HyperSim SDK security subsystem.
//!
//! Credential rotation, request signing with replay protection, threshold
//! signatures, admission control, encrypted storage, a pinned websocket and
//! an audit log, composed into one request pipeline by [`SecurityManager`].

// Pipeline and its components
pub mod credentials;
pub mod multisig;
pub mod net;
pub mod pipeline;
pub mod security;
pub mod signing;
pub mod storage;

// Cross-cutting concerns
pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::SecurityConfig;
pub use error::{ErrorKind, SecurityError, SecurityResult};
pub use lifecycle::{Scheduler, Shutdown, TaskHandle};
pub use observability::metrics::MetricsSnapshot;
pub use pipeline::{SecurityManager, SignedRequest, Transport, TransportResponse};
pub use security::RequestMeta;
