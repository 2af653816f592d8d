//! Security audit trail.
//!
//! # Data Flow
//! ```text
//! SecurityEvent
//!     → auditor.rs buffer
//!     → flush (buffer full | critical event | timer | shutdown)
//!     → sink.rs: FileSink (security-audit-YYYY-MM-DD.log, JSON lines, size rotation)
//!                RemoteSink (POST {events: [...]})
//! ```
//!
//! A batch no sink accepted is put back at the front of the buffer.

pub mod auditor;
pub mod event;
pub mod sink;

pub use auditor::{AuditQuery, AuditStats, SecurityAuditor};
pub use event::{SecurityEvent, SecurityEventType, Severity};
pub use sink::{AuditSink, FileSink, RemoteSink};
