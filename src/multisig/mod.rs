//! Threshold multi-signature authorization.
//!
//! # Data Flow
//! ```text
//! policy {threshold, signers[address, public_key]} ── persisted as multisig_config
//! create_transaction(data, proposed) → hash = SHA-256(canonical data)
//!     → sign (software key) | sign_with_hardware (HardwareSigner) | attach_signature
//!     → verify: count authorized + cryptographically valid signatures ≥ threshold
//!     → sealed
//! ```

pub mod hardware;
pub mod manager;
pub mod types;

pub use hardware::{DeviceInfo, HardwareSigner};
pub use manager::MultiSignature;
pub use types::{
    address_for, MultiSigPolicy, MultiSigTransaction, RejectedSignature, SignerInfo,
    VerificationReport,
};
