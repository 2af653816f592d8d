//! Request pipeline subsystem.
//!
//! # Data Flow
//! ```text
//! payload + RequestMeta
//!     → manager.rs: RateLimiter::admit
//!     → context.rs: RequestContext<Raw> → sanitize → <Sanitized>
//!                   → scan → <Scanned> (findings audited, optionally blocking)
//!                   → sign + credential headers → SignedRequest
//!     → transport.rs: Transport::send
//!     → manager.rs: RequestSigner::verify_response → response data
//! ```
//!
//! # Design Decisions
//! - Stage transitions are crate-private; a `SignedRequest` cannot be built
//!   outside the pipeline
//! - Any stage error aborts the request; the manager counts and audits it
//!   before returning the same error

pub mod context;
pub mod manager;
pub mod transport;

pub use context::{RequestContext, SignedRequest, AUTHORIZATION, KEY_ROTATION};
pub use manager::SecurityManager;
pub use transport::{HttpTransport, Transport, TransportResponse};
