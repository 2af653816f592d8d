//! API key lifecycle.
//!
//! # State
//! ```text
//! ACTIVE ──(expires_at reached)──> rotated lazily on next get_current_key() ──> ACTIVE
//!        ──(rotate_keys / force_rotation / background timer)──────────────────> ACTIVE
//! ```
//! Each rotation demotes the old primary to the front of a bounded fallback
//! ring, persists the new set under `api_keys`, and then publishes it.

pub mod manager;
pub mod types;

pub use manager::ApiKeyManager;
pub use types::{Credential, InitialKeys, KeyEvent, RotationStatus};
