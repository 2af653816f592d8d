//! Request and response signing.
//!
//! # Data Flow
//! ```text
//! request JSON
//!     → canonical.rs ({data, nonce, timestamp}, keys sorted, nulls dropped)
//!     → signer.rs (Ed25519 over canonical bytes)
//!     → SignedEnvelope {data, signature, timestamp, nonce, public_key}
//! ```
//!
//! Verification rejects stale or future timestamps first, then checks the
//! signature against the declared key, then records the nonce. Responses
//! carry `request_nonce` so a response cannot be replayed against another
//! request.

pub mod canonical;
pub mod signer;
pub mod types;

pub use signer::RequestSigner;
pub use types::{SignedEnvelope, SignedResponse, StoredKeyPair};
