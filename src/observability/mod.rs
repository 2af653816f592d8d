//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All components produce:
//!     → tracing macros (structured log events, installed by logging.rs)
//!     → metrics.rs (counters via the `metrics` facade + local snapshot)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Whatever metrics recorder the embedding application installs
//!     → SecurityManager::metrics() snapshot
//! ```
//!
//! # Design Decisions
//! - Secrets never appear in log fields
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
