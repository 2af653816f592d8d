//! Metrics collection.
//!
//! # Metrics
//! - `security_requests_total` (counter): requests entering the pipeline
//! - `security_blocked_requests_total` (counter): rejections by reason
//! - `security_keys_rotated_total` (counter): API key rotations
//! - `security_signature_failures_total` (counter): failed verifications
//! - `security_policy_findings_total` (counter): advisory scanner findings
//! - `security_ws_reconnects_total` (counter): websocket reconnect attempts
//! - `security_audit_events_total` (counter): audit events by severity
//!
//! Each recorder also bumps the in-process [`SecurityMetrics`] so callers can
//! read counts without a metrics exporter.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub rate_limit_violations: u64,
    pub failed_signatures: u64,
    pub owasp_violations: u64,
    pub keys_rotated: u64,
}

/// Lock-free pipeline counters.
#[derive(Debug, Default)]
pub struct SecurityMetrics {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    rate_limit_violations: AtomicU64,
    failed_signatures: AtomicU64,
    owasp_violations: AtomicU64,
    keys_rotated: AtomicU64,
}

impl SecurityMetrics {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("security_requests_total").increment(1);
    }

    pub fn record_blocked(&self, reason: &'static str) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        if matches!(reason, "rate_limit" | "queue_full" | "timeout" | "ddos") {
            self.rate_limit_violations.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!("security_blocked_requests_total", "reason" => reason).increment(1);
    }

    pub fn record_signature_failure(&self) {
        self.failed_signatures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("security_signature_failures_total").increment(1);
    }

    pub fn record_policy_findings(&self, count: usize) {
        self.owasp_violations.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("security_policy_findings_total").increment(count as u64);
    }

    pub fn record_key_rotation(&self) {
        self.keys_rotated.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("security_keys_rotated_total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            rate_limit_violations: self.rate_limit_violations.load(Ordering::Relaxed),
            failed_signatures: self.failed_signatures.load(Ordering::Relaxed),
            owasp_violations: self.owasp_violations.load(Ordering::Relaxed),
            keys_rotated: self.keys_rotated.load(Ordering::Relaxed),
        }
    }
}

pub fn record_ws_reconnect(attempt: u32) {
    metrics::counter!("security_ws_reconnects_total").increment(1);
    tracing::debug!(attempt, "websocket reconnect recorded");
}

pub fn record_audit_event(severity: &'static str) {
    metrics::counter!("security_audit_events_total", "severity" => severity).increment(1);
}
