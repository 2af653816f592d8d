//! System-wide abuse heuristics.
//!
//! Two signals, both independent of per-identifier state:
//! - admitted requests in the current second above `ddos_threshold`
//! - requests with a missing or short user agent in the current minute
//!   above `suspicious_agent_threshold`

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::security::meta::RequestMeta;

const RATE_PERIOD: Duration = Duration::from_secs(1);
const AGENT_PERIOD: Duration = Duration::from_secs(60);
const MAX_TRACKED_IPS: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DdosMetrics {
    pub requests_per_second: u64,
    pub unique_ips: usize,
    pub suspicious_patterns: u64,
    pub blocked_requests: u64,
}

struct DdosState {
    second_start: Instant,
    requests_this_second: u64,
    agent_period_start: Instant,
    suspicious_this_period: u64,
    suspicious_total: u64,
    blocked: u64,
    unique_ips: HashSet<String>,
}

pub struct DdosMonitor {
    threshold: u64,
    suspicious_threshold: u64,
    min_user_agent_len: usize,
    state: Mutex<DdosState>,
}

impl DdosMonitor {
    pub fn new(config: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            threshold: config.ddos_threshold,
            suspicious_threshold: config.suspicious_agent_threshold,
            min_user_agent_len: config.min_user_agent_len,
            state: Mutex::new(DdosState {
                second_start: now,
                requests_this_second: 0,
                agent_period_start: now,
                suspicious_this_period: 0,
                suspicious_total: 0,
                blocked: 0,
                unique_ips: HashSet::new(),
            }),
        }
    }

    /// Returns the reason when the request must be rejected.
    pub fn check(&self, meta: &RequestMeta, now: Instant) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        roll(&mut state, now);

        let verdict = if state.requests_this_second > self.threshold {
            Err(format!(
                "system load {} req/s exceeds {}",
                state.requests_this_second, self.threshold
            ))
        } else if meta.user_agent().map_or(true, |ua| ua.len() < self.min_user_agent_len) {
            state.suspicious_this_period += 1;
            state.suspicious_total += 1;
            if state.suspicious_this_period > self.suspicious_threshold {
                Err(format!(
                    "{} requests with missing or short user agent this minute",
                    state.suspicious_this_period
                ))
            } else {
                Ok(())
            }
        } else {
            Ok(())
        };

        if verdict.is_err() {
            state.blocked += 1;
        }
        verdict
    }

    /// Count an admitted request toward the per-second aggregate.
    pub fn record_admitted(&self, meta: &RequestMeta, now: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        roll(&mut state, now);
        state.requests_this_second += 1;
        if let Some(ip) = meta.client_ip() {
            if state.unique_ips.len() >= MAX_TRACKED_IPS {
                state.unique_ips.clear();
            }
            state.unique_ips.insert(ip.to_string());
        }
    }

    pub fn metrics(&self, now: Instant) -> DdosMetrics {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        roll(&mut state, now);
        DdosMetrics {
            requests_per_second: state.requests_this_second,
            unique_ips: state.unique_ips.len(),
            suspicious_patterns: state.suspicious_total,
            blocked_requests: state.blocked,
        }
    }

    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.second_start = now;
        state.requests_this_second = 0;
        state.agent_period_start = now;
        state.suspicious_this_period = 0;
        state.suspicious_total = 0;
        state.blocked = 0;
        state.unique_ips.clear();
    }
}

fn roll(state: &mut DdosState, now: Instant) {
    if now.duration_since(state.second_start) >= RATE_PERIOD {
        state.second_start = now;
        state.requests_this_second = 0;
    }
    if now.duration_since(state.agent_period_start) >= AGENT_PERIOD {
        state.agent_period_start = now;
        state.suspicious_this_period = 0;
    }
}
