//! Buffered security audit log.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::audit::event::{SecurityEvent, SecurityEventType, Severity};
use crate::audit::sink::{log_files, AuditSink, FileSink, RemoteSink};
use crate::config::AuditConfig;
use crate::error::SecurityResult;
use crate::lifecycle::{Scheduler, TaskHandle};
use crate::observability::metrics;

/// Multiples of `buffer_size` kept while every sink is failing.
const MAX_BACKLOG_FACTOR: usize = 10;

/// Filter for [`SecurityAuditor::query`].
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<SecurityEventType>,
    pub min_severity: Option<Severity>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &SecurityEvent) -> bool {
        self.event_type.map_or(true, |t| t == event.event_type)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && self.since.map_or(true, |t| event.timestamp >= t)
            && self.until.map_or(true, |t| event.timestamp <= t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    pub total_events: usize,
    pub events_by_severity: HashMap<Severity, usize>,
    pub events_by_type: HashMap<SecurityEventType, usize>,
    /// Most frequent `metadata.ip` values, highest first.
    pub top_ips: Vec<(String, usize)>,
}

pub struct SecurityAuditor {
    enabled: bool,
    buffer_size: usize,
    flush_interval: Duration,
    log_directory: Option<PathBuf>,
    buffer: Mutex<Vec<SecurityEvent>>,
    flush_lock: Mutex<()>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl SecurityAuditor {
    /// Build from config. An unusable log directory disables the file sink with a warning.
    pub async fn new(config: &AuditConfig) -> SecurityResult<Self> {
        let mut sinks: Vec<Arc<dyn AuditSink>> = Vec::new();
        let mut log_directory = None;
        if config.enabled {
            match FileSink::open(&config.log_directory, config.max_log_size, config.rotate_daily).await {
                Ok(sink) => {
                    log_directory = Some(sink.directory().to_path_buf());
                    sinks.push(Arc::new(sink));
                }
                Err(e) => tracing::warn!(
                    directory = %config.log_directory.display(),
                    error = %e,
                    "Failed to create audit log directory"
                ),
            }
            if let Some(endpoint) = &config.remote_endpoint {
                sinks.push(Arc::new(RemoteSink::new(endpoint.clone())?));
            }
        }
        let mut auditor = Self::with_sinks(config, sinks);
        auditor.log_directory = log_directory;
        Ok(auditor)
    }

    pub fn with_sinks(config: &AuditConfig, sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            enabled: config.enabled,
            buffer_size: config.buffer_size.max(1),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            log_directory: None,
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            sinks,
        }
    }

    /// A disabled auditor that drops every event.
    pub fn disabled() -> Self {
        Self::with_sinks(
            &AuditConfig {
                enabled: false,
                ..AuditConfig::default()
            },
            Vec::new(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Buffer an event; a full buffer or a critical event flushes immediately.
    pub async fn log(&self, event: SecurityEvent) {
        if !self.enabled {
            return;
        }
        metrics::record_audit_event(event.severity.as_str());
        match event.severity {
            Severity::Critical | Severity::High => tracing::warn!(
                event_type = event.event_type.as_str(),
                severity = %event.severity,
                "{}",
                event.description
            ),
            _ => tracing::debug!(
                event_type = event.event_type.as_str(),
                severity = %event.severity,
                "{}",
                event.description
            ),
        }

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            let critical = event.severity == Severity::Critical;
            buffer.push(event);
            critical || buffer.len() >= self.buffer_size
        };
        if should_flush {
            if let Err(e) = self.flush().await {
                tracing::error!(error = %e, "Failed to flush audit logs");
            }
        }
    }

    pub async fn log_auth(&self, success: bool, user_id: Option<&str>, ip: Option<&str>, user_agent: Option<&str>) {
        let (severity, description) = if success {
            (Severity::Low, "Successful authentication")
        } else {
            (Severity::Medium, "Failed authentication attempt")
        };
        self.log(
            SecurityEvent::new(SecurityEventType::Authentication, severity, description)
                .with_metadata("user_id", user_id)
                .with_metadata("ip", ip)
                .with_metadata("user_agent", user_agent)
                .with_metadata("success", success),
        )
        .await;
    }

    pub async fn log_api_usage(
        &self,
        endpoint: &str,
        method: &str,
        status_code: u16,
        response_time_ms: u64,
        user_id: Option<&str>,
    ) {
        let severity = if status_code >= 400 { Severity::Medium } else { Severity::Low };
        self.log(
            SecurityEvent::new(
                SecurityEventType::ApiUsage,
                severity,
                format!("API {} {} - {}", method, endpoint, status_code),
            )
            .with_metadata("endpoint", endpoint)
            .with_metadata("method", method)
            .with_metadata("status_code", status_code)
            .with_metadata("response_time", response_time_ms)
            .with_metadata("user_id", user_id),
        )
        .await;
    }

    pub async fn log_data_access(&self, resource: &str, action: &str, user_id: Option<&str>, success: bool) {
        let severity = if success { Severity::Low } else { Severity::High };
        self.log(
            SecurityEvent::new(SecurityEventType::DataAccess, severity, format!("Data {} on {}", action, resource))
                .with_metadata("resource", resource)
                .with_metadata("action", action)
                .with_metadata("user_id", user_id)
                .with_metadata("success", success),
        )
        .await;
    }

    /// Write buffered events to every sink; returns how many were flushed.
    ///
    /// Events go back to the front of the buffer when no sink accepted them.
    pub async fn flush(&self) -> SecurityResult<usize> {
        let _flushing = self.flush_lock.lock().await;
        let events = std::mem::take(&mut *self.buffer.lock().await);
        if events.is_empty() || self.sinks.is_empty() {
            return Ok(events.len());
        }

        let mut delivered = false;
        let mut last_error = None;
        for sink in &self.sinks {
            match sink.write(&events).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    tracing::warn!(sink = sink.name(), error = %e, events = events.len(), "Audit sink write failed");
                    last_error = Some(e);
                }
            }
        }

        if delivered {
            return Ok(events.len());
        }

        let mut buffer = self.buffer.lock().await;
        let newer = std::mem::replace(&mut *buffer, events);
        buffer.extend(newer);
        let cap = self.buffer_size * MAX_BACKLOG_FACTOR;
        if buffer.len() > cap {
            let dropped = buffer.len() - cap;
            buffer.drain(..dropped);
            tracing::error!(dropped, "Audit backlog full, oldest events dropped");
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Read written events back from the log directory.
    pub async fn query(&self, filter: &AuditQuery) -> SecurityResult<Vec<SecurityEvent>> {
        let Some(dir) = &self.log_directory else {
            return Ok(Vec::new());
        };
        query_directory(dir, filter).await
    }

    pub async fn stats(&self, filter: &AuditQuery) -> SecurityResult<AuditStats> {
        Ok(summarize(&self.query(filter).await?))
    }

    pub fn spawn_flush_timer(self: &Arc<Self>, scheduler: &Scheduler) -> Option<TaskHandle> {
        if !self.enabled {
            return None;
        }
        let auditor = Arc::clone(self);
        Some(scheduler.every("audit_flush", self.flush_interval, move || {
            let auditor = auditor.clone();
            async move {
                if let Err(e) = auditor.flush().await {
                    tracing::error!(error = %e, "Periodic audit flush failed");
                }
            }
        }))
    }

    pub async fn shutdown(&self) -> SecurityResult<()> {
        self.flush().await.map(|_| ())
    }
}

/// Scan every audit file in `dir` for events matching `filter`.
pub async fn query_directory(dir: &std::path::Path, filter: &AuditQuery) -> SecurityResult<Vec<SecurityEvent>> {
    let mut events = Vec::new();
    for file in log_files(dir).await? {
        let content = tokio::fs::read_to_string(&file).await?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<SecurityEvent>(line) {
                Ok(event) if filter.matches(&event) => events.push(event),
                Ok(_) => {}
                Err(e) => tracing::debug!(file = %file.display(), error = %e, "Skipping malformed audit line"),
            }
        }
    }
    events.sort_by_key(|e| e.timestamp);
    if let Some(limit) = filter.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }
    Ok(events)
}

pub fn summarize(events: &[SecurityEvent]) -> AuditStats {
    let mut stats = AuditStats {
        total_events: events.len(),
        ..AuditStats::default()
    };
    let mut ips: HashMap<String, usize> = HashMap::new();
    for event in events {
        *stats.events_by_severity.entry(event.severity).or_default() += 1;
        *stats.events_by_type.entry(event.event_type).or_default() += 1;
        if let Some(ip) = event.metadata.get("ip").and_then(|v| v.as_str()) {
            *ips.entry(ip.to_string()).or_default() += 1;
        }
    }
    let mut top_ips: Vec<_> = ips.into_iter().collect();
    top_ips.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_ips.truncate(10);
    stats.top_ips = top_ips;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SecurityError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        written: AtomicUsize,
        batches: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn write(&self, events: &[SecurityEvent]) -> SecurityResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SecurityError::Transport("sink down".into()));
            }
            self.written.fetch_add(events.len(), Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(buffer_size: usize) -> AuditConfig {
        AuditConfig {
            buffer_size,
            ..AuditConfig::default()
        }
    }

    fn low(n: usize) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::ApiUsage, Severity::Low, format!("e{}", n))
    }

    #[tokio::test]
    async fn test_flush_on_full_buffer() {
        let sink = Arc::new(RecordingSink::default());
        let auditor = SecurityAuditor::with_sinks(&config(3), vec![sink.clone()]);
        auditor.log(low(1)).await;
        auditor.log(low(2)).await;
        assert_eq!(sink.written.load(Ordering::SeqCst), 0);
        auditor.log(low(3)).await;
        assert_eq!(sink.written.load(Ordering::SeqCst), 3);
        assert_eq!(sink.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_flushes_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let auditor = SecurityAuditor::with_sinks(&config(100), vec![sink.clone()]);
        auditor.log(low(1)).await;
        auditor
            .log(SecurityEvent::new(SecurityEventType::DdosAttempt, Severity::Critical, "flood"))
            .await;
        assert_eq!(sink.written.load(Ordering::SeqCst), 2);
        assert_eq!(auditor.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_rebuffers() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let auditor = SecurityAuditor::with_sinks(&config(100), vec![sink.clone()]);
        auditor.log(low(1)).await;
        auditor.log(low(2)).await;

        assert!(auditor.flush().await.is_err());
        assert_eq!(auditor.buffered().await, 2);

        sink.failing.store(false, Ordering::SeqCst);
        assert_eq!(auditor.flush().await.unwrap(), 2);
        assert_eq!(auditor.buffered().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_drops_events() {
        let auditor = SecurityAuditor::disabled();
        auditor.log(low(1)).await;
        assert_eq!(auditor.buffered().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flush() {
        let sink = Arc::new(RecordingSink::default());
        let auditor = Arc::new(SecurityAuditor::with_sinks(
            &AuditConfig {
                flush_interval_secs: 30,
                ..config(100)
            },
            vec![sink.clone()],
        ));
        let scheduler = Scheduler::new();
        auditor.spawn_flush_timer(&scheduler).unwrap();
        auditor.log(low(1)).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.written.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_and_stats_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let auditor = SecurityAuditor::new(&AuditConfig {
            log_directory: dir.path().to_path_buf(),
            ..config(100)
        })
        .await
        .unwrap();

        auditor.log_auth(false, Some("u1"), Some("10.0.0.1"), None).await;
        auditor.log_auth(true, Some("u1"), Some("10.0.0.1"), None).await;
        auditor.log_data_access("wallet", "export", Some("u2"), false).await;
        auditor.log_api_usage("/v1/simulate", "POST", 500, 12, None).await;
        auditor.flush().await.unwrap();

        let all = auditor.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let serious = auditor
            .query(&AuditQuery { min_severity: Some(Severity::Medium), ..AuditQuery::default() })
            .await
            .unwrap();
        assert_eq!(serious.len(), 3);

        let auth = auditor
            .query(&AuditQuery {
                event_type: Some(SecurityEventType::Authentication),
                limit: Some(1),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(auth.len(), 1);

        let stats = auditor.stats(&AuditQuery::default()).await.unwrap();
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.events_by_type[&SecurityEventType::Authentication], 2);
        assert_eq!(stats.events_by_severity[&Severity::High], 1);
        assert_eq!(stats.top_ips, vec![("10.0.0.1".to_string(), 2)]);
    }
}
