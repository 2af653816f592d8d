//! Request admission and payload screening.
//!
//! # Data Flow
//! ```text
//! Outbound request:
//!     → meta.rs (derive identifier from ip / client id / forwarded headers)
//!     → rate_limit.rs (ddos.rs heuristics, then per-identifier window, burst, queue)
//!     → sanitizer.rs (per-field string cleaning, prototype keys dropped)
//!     → policy.rs (advisory OWASP findings)
//!     → Pass to signing
//! ```
//!
//! # Design Decisions
//! - DDoS heuristics run before any per-identifier state is touched
//! - Fail closed: any admission failure rejects the request
//! - Policy findings are advisory unless configured to block

pub mod ddos;
pub mod meta;
pub mod policy;
pub mod rate_limit;
pub mod sanitizer;

pub use ddos::{DdosMetrics, DdosMonitor};
pub use meta::RequestMeta;
pub use policy::{PolicyFinding, PolicyScanner};
pub use rate_limit::{RateLimitEvent, RateLimitStatus, RateLimiter};
pub use sanitizer::{InputSanitizer, SanitizationRules, Threat, ThreatKind, UrlCheck};
