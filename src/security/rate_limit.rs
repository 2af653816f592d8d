//! Fixed-window admission control with queuing and burst detection.
//!
//! Per identifier: a hard window of `requests_per_window` admissions. Once the
//! window is full, callers wait in a bounded queue that is drained when the
//! window rolls over; every queued caller gives up after `queue_ttl`.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{self, Instant};

use crate::clock::now_millis;
use crate::config::RateLimitConfig;
use crate::error::{SecurityError, SecurityResult};
use crate::lifecycle::{Scheduler, TaskHandle};
use crate::security::ddos::{DdosMetrics, DdosMonitor};
use crate::security::meta::RequestMeta;

/// Notifications published by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    DdosDetected { identifier: String, reason: String },
    LimitExceeded { identifier: String },
    Queued { identifier: String, position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub count: u32,
    pub limit: u32,
    pub remaining: u32,
    /// Wall-clock milliseconds at which the current window ends.
    pub reset_at_ms: u64,
    pub queue_length: usize,
}

struct Waiter {
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
    queue: VecDeque<Waiter>,
    burst_count: u32,
    last_request: Option<Instant>,
}

impl WindowEntry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            queue: VecDeque::new(),
            burst_count: 0,
            last_request: None,
        }
    }

    fn live_queue_len(&self) -> usize {
        self.queue.iter().filter(|w| !w.tx.is_closed()).count()
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    entries: DashMap<String, WindowEntry>,
    ddos: DdosMonitor,
    events: broadcast::Sender<RateLimitEvent>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            ddos: DdosMonitor::new(&config),
            config,
            entries: DashMap::new(),
            events,
        }
    }

    /// Admit one request, waiting in the queue if the window is full.
    pub async fn admit(&self, meta: &RequestMeta) -> SecurityResult<()> {
        let identifier = meta.identifier();
        let now = Instant::now();

        if self.config.ddos_protection {
            if let Err(reason) = self.ddos.check(meta, now) {
                tracing::error!(identifier = %identifier, reason = %reason, "DDoS protection triggered");
                let _ = self.events.send(RateLimitEvent::DdosDetected {
                    identifier: identifier.clone(),
                    reason: reason.clone(),
                });
                return Err(SecurityError::DdosDetected(reason));
            }
        }

        let rx = {
            let mut entry = self
                .entries
                .entry(identifier.clone())
                .or_insert_with(|| WindowEntry::new(now));
            self.roll_window(&mut entry, now);

            let is_burst = entry
                .last_request
                .is_some_and(|last| now.duration_since(last) < Duration::from_millis(self.config.burst_gap_ms));
            entry.last_request = Some(now);
            if is_burst {
                entry.burst_count += 1;
            }
            if is_burst && entry.burst_count > self.config.burst_limit {
                tracing::warn!(identifier = %identifier, bursts = entry.burst_count, "Suspicious request burst");
                let retry_after_ms = self.retry_after(&entry, now);
                drop(entry);
                let _ = self.events.send(RateLimitEvent::LimitExceeded { identifier: identifier.clone() });
                return Err(SecurityError::RateLimitExceeded { identifier, retry_after_ms });
            }

            if entry.count < self.config.requests_per_window {
                entry.count += 1;
                drop(entry);
                self.ddos.record_admitted(meta, now);
                return Ok(());
            }

            entry.queue.retain(|w| !w.tx.is_closed());
            if self.config.max_queue_size == 0 {
                let retry_after_ms = self.retry_after(&entry, now);
                drop(entry);
                let _ = self.events.send(RateLimitEvent::LimitExceeded { identifier: identifier.clone() });
                return Err(SecurityError::RateLimitExceeded { identifier, retry_after_ms });
            }
            if entry.queue.len() >= self.config.max_queue_size {
                drop(entry);
                tracing::warn!(identifier = %identifier, "Admission queue full");
                return Err(SecurityError::QueueFull(identifier));
            }

            let (tx, rx) = oneshot::channel();
            entry.queue.push_back(Waiter { enqueued_at: now, tx });
            let position = entry.queue.len();
            drop(entry);
            tracing::debug!(identifier = %identifier, position, "Request queued");
            let _ = self.events.send(RateLimitEvent::Queued { identifier: identifier.clone(), position });
            rx
        };

        self.wait_in_queue(&identifier, meta, rx, now + self.config.queue_ttl()).await
    }

    async fn wait_in_queue(
        &self,
        identifier: &str,
        meta: &RequestMeta,
        mut rx: oneshot::Receiver<()>,
        deadline: Instant,
    ) -> SecurityResult<()> {
        loop {
            let wake = self
                .entries
                .get(identifier)
                .map(|e| e.window_start + self.config.window())
                .unwrap_or(deadline)
                .min(deadline);

            tokio::select! {
                result = &mut rx => {
                    return match result {
                        Ok(()) => {
                            self.ddos.record_admitted(meta, Instant::now());
                            Ok(())
                        }
                        // Entry was reset while we waited.
                        Err(_) => Err(SecurityError::RateLimitExceeded {
                            identifier: identifier.to_string(),
                            retry_after_ms: 0,
                        }),
                    };
                }
                _ = time::sleep_until(wake) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // A drain racing with the deadline may already have admitted us.
                        if rx.try_recv().is_ok() {
                            self.ddos.record_admitted(meta, now);
                            return Ok(());
                        }
                        tracing::warn!(identifier, "Queued request timed out");
                        return Err(SecurityError::RequestTimeout(self.config.queue_ttl_secs));
                    }
                    if let Some(mut entry) = self.entries.get_mut(identifier) {
                        self.roll_window(&mut entry, now);
                    }
                }
            }
        }
    }

    /// Start a new window if the current one has elapsed, admitting queued
    /// callers into it up to the limit.
    fn roll_window(&self, entry: &mut WindowEntry, now: Instant) {
        if now.duration_since(entry.window_start) < self.config.window() {
            return;
        }
        entry.count = 0;
        entry.burst_count = 0;
        entry.window_start = now;

        let ttl = self.config.queue_ttl();
        while entry.count < self.config.requests_per_window {
            let Some(waiter) = entry.queue.pop_front() else { break };
            if now.duration_since(waiter.enqueued_at) >= ttl {
                continue;
            }
            if waiter.tx.send(()).is_ok() {
                entry.count += 1;
            }
        }
    }

    fn retry_after(&self, entry: &WindowEntry, now: Instant) -> u64 {
        (entry.window_start + self.config.window())
            .saturating_duration_since(now)
            .as_millis() as u64
    }

    pub fn status(&self, identifier: &str) -> RateLimitStatus {
        let limit = self.config.requests_per_window;
        let now = Instant::now();
        match self.entries.get(identifier) {
            Some(entry) if now.duration_since(entry.window_start) < self.config.window() => RateLimitStatus {
                count: entry.count,
                limit,
                remaining: limit.saturating_sub(entry.count),
                reset_at_ms: now_millis() + self.retry_after(&entry, now),
                queue_length: entry.live_queue_len(),
            },
            Some(entry) => RateLimitStatus {
                count: 0,
                limit,
                remaining: limit,
                reset_at_ms: now_millis() + self.config.window_ms,
                queue_length: entry.live_queue_len(),
            },
            None => RateLimitStatus {
                count: 0,
                limit,
                remaining: limit,
                reset_at_ms: now_millis() + self.config.window_ms,
                queue_length: 0,
            },
        }
    }

    pub fn ddos_metrics(&self) -> DdosMetrics {
        self.ddos.metrics(Instant::now())
    }

    /// Forget one identifier. Its queued callers are rejected.
    pub fn reset(&self, identifier: &str) {
        self.entries.remove(identifier);
    }

    pub fn reset_all(&self) {
        self.entries.clear();
        self.ddos.reset();
    }

    /// Drop entries idle for two full windows with nothing queued; returns how many.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.window() * 2;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.window_start) < idle || e.live_queue_len() > 0);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Evicted idle rate limit entries");
        }
        removed
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.entries.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.events.subscribe()
    }

    pub fn spawn_cleanup(self: &Arc<Self>, scheduler: &Scheduler) -> TaskHandle {
        let limiter = Arc::clone(self);
        scheduler.every(
            "rate_limit_cleanup",
            Duration::from_secs(self.config.cleanup_interval_secs.max(1)),
            move || {
                let limiter = limiter.clone();
                async move {
                    limiter.cleanup();
                }
            },
        )
    }
}
