//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → SecurityConfig (validated, immutable)
//!     → cloned into each component at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; components copy the section they own
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ApiKeyConfig, AuditConfig, KdfKind, MultiSigSettings, RateLimitConfig, SecurityConfig,
    SigningConfig, StorageConfig, ValidationConfig, ValidationLevel, WebSocketConfig,
};
