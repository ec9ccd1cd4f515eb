//! Rate limiting, request metrics, and usage stats.
//! Grounded verbatim in `_check_rate_limit` / `_record_metric` /
//! `_get_metrics` / `_record_usage` / `_get_usage_stats` from
//! `zimi/server.py`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const WINDOW: Duration = Duration::from_secs(60);
const STALE_IP_CLEANUP_THRESHOLD: usize = 1000;

/// Sliding 60-second-window rate limiter, one bucket of timestamps per
/// client IP. `limit <= 0` disables limiting entirely.
pub struct RateLimiter {
    limit: u32,
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self { limit, buckets: Mutex::new(HashMap::new()) }
    }

    /// Returns `Some(retry_after_secs)` if `ip` is over the limit, `None` if
    /// the request is allowed (and records it).
    pub fn check(&self, ip: &str) -> Option<u64> {
        if self.limit == 0 {
            return None;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let timestamps = buckets.entry(ip.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < WINDOW);

        if timestamps.len() >= self.limit as usize {
            let oldest = timestamps[0];
            let elapsed = now.duration_since(oldest);
            let remaining = WINDOW.saturating_sub(elapsed).as_secs() + 1;
            return Some(remaining.max(1));
        }
        timestamps.push(now);

        if buckets.len() > STALE_IP_CLEANUP_THRESHOLD {
            buckets.retain(|_, v| v.last().is_some_and(|t| now.duration_since(*t) < WINDOW));
        }
        None
    }
}

/// Per-endpoint request counter and latency accumulator, plus global error
/// and rate-limit counts.
pub struct Metrics {
    start_time: Instant,
    requests: Mutex<HashMap<String, (u64, Duration)>>,
    errors: Mutex<u64>,
    rate_limited: Mutex<u64>,
}

#[derive(Debug, Serialize)]
pub struct EndpointMetrics {
    pub count: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub total_requests: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub endpoints: HashMap<String, EndpointMetrics>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: Mutex::new(HashMap::new()),
            errors: Mutex::new(0),
            rate_limited: Mutex::new(0),
        }
    }

    pub fn record(&self, endpoint: &str, latency: Duration, error: bool) {
        let mut requests = self.requests.lock().unwrap();
        let entry = requests.entry(endpoint.to_string()).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += latency;
        drop(requests);
        if error {
            *self.errors.lock().unwrap() += 1;
        }
    }

    pub fn record_rate_limited(&self) {
        *self.rate_limited.lock().unwrap() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.lock().unwrap();
        let total_requests = requests.values().map(|(count, _)| count).sum();
        let endpoints = requests
            .iter()
            .map(|(ep, (count, total_latency))| {
                let avg_ms = if *count > 0 { total_latency.as_secs_f64() * 1000.0 / *count as f64 } else { 0.0 };
                (ep.clone(), EndpointMetrics { count: *count, avg_latency_ms: (avg_ms * 10.0).round() / 10.0 })
            })
            .collect();
        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            total_requests,
            errors: *self.errors.lock().unwrap(),
            rate_limited: *self.rate_limited.lock().unwrap(),
            endpoints,
        }
    }
}

/// What kind of usage event occurred. `Iframe` counts as an article read,
/// matching the Python original treating `read`/`iframe` identically for
/// totals but recording under the same per-ZIM `reads` bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEvent {
    Search,
    Read,
    Iframe,
}

#[derive(Debug, Default, Clone, Serialize)]
struct ZimUsage {
    reads: u64,
    searches: u64,
}

/// In-memory usage stats, reset on restart.
pub struct UsageStats {
    searches: Mutex<u64>,
    article_reads: Mutex<u64>,
    by_zim: Mutex<HashMap<String, ZimUsage>>,
}

#[derive(Debug, Serialize)]
pub struct TopZim {
    pub name: String,
    pub reads: u64,
    pub searches: u64,
}

#[derive(Debug, Serialize)]
pub struct UsageSnapshot {
    pub searches: u64,
    pub article_reads: u64,
    pub top_zims: Vec<TopZim>,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageStats {
    pub fn new() -> Self {
        Self { searches: Mutex::new(0), article_reads: Mutex::new(0), by_zim: Mutex::new(HashMap::new()) }
    }

    /// Record one event. `zim_name` is only tracked per-archive if it's
    /// found in `known_zims` (the caller's current `get_zim_files()`-style list).
    pub fn record(&self, event: UsageEvent, zim_name: Option<&str>, known_zims: &[String]) {
        match event {
            UsageEvent::Search => *self.searches.lock().unwrap() += 1,
            UsageEvent::Read | UsageEvent::Iframe => *self.article_reads.lock().unwrap() += 1,
        }
        if let Some(name) = zim_name {
            if known_zims.iter().any(|z| z == name) {
                let mut by_zim = self.by_zim.lock().unwrap();
                let bucket = by_zim.entry(name.to_string()).or_default();
                if event == UsageEvent::Search {
                    bucket.searches += 1;
                } else {
                    bucket.reads += 1;
                }
            }
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let by_zim = self.by_zim.lock().unwrap();
        let mut top: Vec<TopZim> =
            by_zim.iter().map(|(name, u)| TopZim { name: name.clone(), reads: u.reads, searches: u.searches }).collect();
        top.sort_by(|a, b| (b.reads + b.searches).cmp(&(a.reads + a.searches)));
        top.truncate(10);
        UsageSnapshot { searches: *self.searches.lock().unwrap(), article_reads: *self.article_reads.lock().unwrap(), top_zims: top }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("1.2.3.4").is_none());
        assert!(limiter.check("1.2.3.4").is_none());
        let retry = limiter.check("1.2.3.4");
        assert!(retry.is_some());
        assert!(retry.unwrap() >= 1);
    }

    #[test]
    fn rate_limiter_disabled_when_limit_is_zero() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.check("1.2.3.4").is_none());
        }
    }

    #[test]
    fn rate_limiter_tracks_ips_independently() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("a").is_none());
        assert!(limiter.check("b").is_none());
        assert!(limiter.check("a").is_some());
    }

    #[test]
    fn metrics_snapshot_aggregates_count_and_latency() {
        let metrics = Metrics::new();
        metrics.record("search", Duration::from_millis(100), false);
        metrics.record("search", Duration::from_millis(300), false);
        metrics.record("read", Duration::from_millis(50), true);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.errors, 1);
        let search = &snap.endpoints["search"];
        assert_eq!(search.count, 2);
        assert!((search.avg_latency_ms - 200.0).abs() < 0.01);
    }

    #[test]
    fn metrics_records_rate_limited_count() {
        let metrics = Metrics::new();
        metrics.record_rate_limited();
        metrics.record_rate_limited();
        assert_eq!(metrics.snapshot().rate_limited, 2);
    }

    #[test]
    fn usage_stats_only_tracks_known_zims() {
        let usage = UsageStats::new();
        let known = vec!["wikipedia".to_string()];
        usage.record(UsageEvent::Search, Some("wikipedia"), &known);
        usage.record(UsageEvent::Read, Some("unknown-zim"), &known);

        let snap = usage.snapshot();
        assert_eq!(snap.searches, 1);
        assert_eq!(snap.article_reads, 1);
        assert_eq!(snap.top_zims.len(), 1);
        assert_eq!(snap.top_zims[0].name, "wikipedia");
        assert_eq!(snap.top_zims[0].searches, 1);
        assert_eq!(snap.top_zims[0].reads, 0);
    }

    #[test]
    fn usage_stats_top_zims_sorted_and_capped_at_ten() {
        let usage = UsageStats::new();
        let known: Vec<String> = (0..15).map(|i| format!("zim{i}")).collect();
        for (i, name) in known.iter().enumerate() {
            for _ in 0..i {
                usage.record(UsageEvent::Read, Some(name), &known);
            }
        }
        let snap = usage.snapshot();
        assert_eq!(snap.top_zims.len(), 10);
        assert_eq!(snap.top_zims[0].name, "zim14");
        assert_eq!(snap.top_zims[0].reads, 14);
    }

    #[test]
    fn iframe_events_count_as_article_reads() {
        let usage = UsageStats::new();
        usage.record(UsageEvent::Iframe, None, &[]);
        assert_eq!(usage.snapshot().article_reads, 1);
    }
}
