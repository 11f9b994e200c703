//! Runtime telemetry: counters and latency histograms describing what the
//! SDK has been doing, plus the one-shot config echo sent on startup.
//!
//! Recording is designed to be cheap and infallible; failures pushing
//! telemetry to the backend are logged and never propagate.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Number of exponential latency buckets.
pub const LATENCY_BUCKETS: usize = 23;

/// Public API methods tracked individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Treatment,
    Treatments,
    TreatmentWithConfig,
    TreatmentsWithConfig,
    TreatmentsByFlagSet,
    TreatmentsByFlagSets,
    Track,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Treatment => "treatment",
            Method::Treatments => "treatments",
            Method::TreatmentWithConfig => "treatmentWithConfig",
            Method::TreatmentsWithConfig => "treatmentsWithConfig",
            Method::TreatmentsByFlagSet => "treatmentsByFlagSet",
            Method::TreatmentsByFlagSets => "treatmentsByFlagSets",
            Method::Track => "track",
        }
    }
}

/// Backend endpoints tracked for HTTP errors and latencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    SplitChanges,
    SegmentChanges,
    Auth,
    ImpressionsBulk,
    ImpressionsCount,
    UniqueKeys,
    EventsBulk,
    TelemetryUsage,
    TelemetryConfig,
    Streaming,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::SplitChanges => "splitChanges",
            Endpoint::SegmentChanges => "segmentChanges",
            Endpoint::Auth => "auth",
            Endpoint::ImpressionsBulk => "impressionsBulk",
            Endpoint::ImpressionsCount => "impressionsCount",
            Endpoint::UniqueKeys => "uniqueKeys",
            Endpoint::EventsBulk => "eventsBulk",
            Endpoint::TelemetryUsage => "telemetryUsage",
            Endpoint::TelemetryConfig => "telemetryConfig",
            Endpoint::Streaming => "streaming",
        }
    }
}

/// Map a duration to its exponential bucket: upper bounds grow by 1.5x
/// starting at 1 ms.
pub fn latency_bucket(latency: Duration) -> usize {
    let ms = latency.as_secs_f64() * 1000.0;
    let mut bound = 1.0;
    for bucket in 0..LATENCY_BUCKETS {
        if ms <= bound {
            return bucket;
        }
        bound *= 1.5;
    }
    LATENCY_BUCKETS - 1
}

/// Aggregated runtime statistics, drained on each telemetry flush.
#[derive(Debug, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub method_latencies: HashMap<String, Vec<u64>>,
    pub method_exceptions: HashMap<String, u64>,
    pub http_errors: HashMap<String, HashMap<u16, u64>>,
    pub http_latencies: HashMap<String, Vec<u64>>,
    pub impressions_queued: u64,
    pub impressions_deduped: u64,
    pub impressions_dropped: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub token_refreshes: u64,
    pub auth_rejections: u64,
    pub streaming_events: u64,
    pub listener_failures: u64,
    pub session_length_ms: u64,
}

/// One-time config echo describing how the factory was built.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEcho {
    pub operation_mode: String,
    pub streaming_enabled: bool,
    pub refresh_rates: RefreshRates,
    pub impressions_queue_size: usize,
    pub events_queue_size: usize,
    pub impressions_mode: String,
    pub impression_listener: bool,
    pub http_timeouts_ms: (u64, u64),
    pub active_factories: usize,
    pub time_until_ready_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRates {
    pub features: u64,
    pub segments: u64,
    pub impressions: u64,
    pub events: u64,
    pub telemetry: u64,
}

#[derive(Default)]
pub struct TelemetryRuntime {
    method_latencies: Mutex<HashMap<Method, [u64; LATENCY_BUCKETS]>>,
    method_exceptions: Mutex<HashMap<Method, u64>>,
    http_errors: Mutex<HashMap<Endpoint, HashMap<u16, u64>>>,
    http_latencies: Mutex<HashMap<Endpoint, [u64; LATENCY_BUCKETS]>>,
    impressions_queued: AtomicU64,
    impressions_deduped: AtomicU64,
    impressions_dropped: AtomicU64,
    events_queued: AtomicU64,
    events_dropped: AtomicU64,
    token_refreshes: AtomicU64,
    auth_rejections: AtomicU64,
    streaming_events: AtomicU64,
    listener_failures: AtomicU64,
    session_start: Mutex<Option<Instant>>,
}

impl TelemetryRuntime {
    pub fn new() -> TelemetryRuntime {
        let telemetry = TelemetryRuntime::default();
        *telemetry
            .session_start
            .lock()
            .expect("thread holding telemetry lock should not panic") = Some(Instant::now());
        telemetry
    }

    pub fn record_latency(&self, method: Method, latency: Duration) {
        let mut latencies = self
            .method_latencies
            .lock()
            .expect("thread holding telemetry lock should not panic");
        latencies.entry(method).or_insert([0; LATENCY_BUCKETS])[latency_bucket(latency)] += 1;
    }

    pub fn record_exception(&self, method: Method) {
        let mut exceptions = self
            .method_exceptions
            .lock()
            .expect("thread holding telemetry lock should not panic");
        *exceptions.entry(method).or_insert(0) += 1;
    }

    pub fn record_http_error(&self, endpoint: Endpoint, status: u16) {
        let mut errors = self
            .http_errors
            .lock()
            .expect("thread holding telemetry lock should not panic");
        *errors.entry(endpoint).or_default().entry(status).or_insert(0) += 1;
    }

    pub fn record_http_latency(&self, endpoint: Endpoint, latency: Duration) {
        let mut latencies = self
            .http_latencies
            .lock()
            .expect("thread holding telemetry lock should not panic");
        latencies.entry(endpoint).or_insert([0; LATENCY_BUCKETS])[latency_bucket(latency)] += 1;
    }

    pub fn record_impressions_queued(&self, count: u64) {
        self.impressions_queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_impressions_deduped(&self, count: u64) {
        self.impressions_deduped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_impressions_dropped(&self, count: u64) {
        self.impressions_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_events_queued(&self, count: u64) {
        self.events_queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_events_dropped(&self, count: u64) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_token_refresh(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_rejection(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streaming_event(&self) {
        self.streaming_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain all counters into a stats payload for flushing.
    pub fn pop_stats(&self) -> RuntimeStats {
        let method_latencies = self
            .method_latencies
            .lock()
            .expect("thread holding telemetry lock should not panic")
            .drain()
            .map(|(method, buckets)| (method.as_str().to_owned(), buckets.to_vec()))
            .collect();
        let method_exceptions = self
            .method_exceptions
            .lock()
            .expect("thread holding telemetry lock should not panic")
            .drain()
            .map(|(method, count)| (method.as_str().to_owned(), count))
            .collect();
        let http_errors = self
            .http_errors
            .lock()
            .expect("thread holding telemetry lock should not panic")
            .drain()
            .map(|(endpoint, counts)| (endpoint.as_str().to_owned(), counts))
            .collect();
        let http_latencies = self
            .http_latencies
            .lock()
            .expect("thread holding telemetry lock should not panic")
            .drain()
            .map(|(endpoint, buckets)| (endpoint.as_str().to_owned(), buckets.to_vec()))
            .collect();
        let session_length_ms = self
            .session_start
            .lock()
            .expect("thread holding telemetry lock should not panic")
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);

        RuntimeStats {
            method_latencies,
            method_exceptions,
            http_errors,
            http_latencies,
            impressions_queued: self.impressions_queued.swap(0, Ordering::Relaxed),
            impressions_deduped: self.impressions_deduped.swap(0, Ordering::Relaxed),
            impressions_dropped: self.impressions_dropped.swap(0, Ordering::Relaxed),
            events_queued: self.events_queued.swap(0, Ordering::Relaxed),
            events_dropped: self.events_dropped.swap(0, Ordering::Relaxed),
            token_refreshes: self.token_refreshes.swap(0, Ordering::Relaxed),
            auth_rejections: self.auth_rejections.swap(0, Ordering::Relaxed),
            streaming_events: self.streaming_events.swap(0, Ordering::Relaxed),
            listener_failures: self.listener_failures.swap(0, Ordering::Relaxed),
            session_length_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_buckets_grow_exponentially() {
        assert_eq!(latency_bucket(Duration::from_micros(500)), 0);
        assert_eq!(latency_bucket(Duration::from_millis(1)), 0);
        assert_eq!(latency_bucket(Duration::from_micros(1400)), 1);
        assert_eq!(latency_bucket(Duration::from_millis(2)), 2);
        // Anything enormous lands in the last bucket.
        assert_eq!(latency_bucket(Duration::from_secs(3600)), LATENCY_BUCKETS - 1);
    }

    #[test]
    fn counters_accumulate_and_drain() {
        let telemetry = TelemetryRuntime::new();
        telemetry.record_latency(Method::Treatment, Duration::from_millis(1));
        telemetry.record_latency(Method::Treatment, Duration::from_millis(1));
        telemetry.record_exception(Method::Track);
        telemetry.record_http_error(Endpoint::SplitChanges, 500);
        telemetry.record_impressions_queued(3);
        telemetry.record_impressions_dropped(1);

        let stats = telemetry.pop_stats();
        assert_eq!(stats.method_latencies["treatment"][0], 2);
        assert_eq!(stats.method_exceptions["track"], 1);
        assert_eq!(stats.http_errors["splitChanges"][&500], 1);
        assert_eq!(stats.impressions_queued, 3);
        assert_eq!(stats.impressions_dropped, 1);

        // Draining resets everything.
        let stats = telemetry.pop_stats();
        assert!(stats.method_latencies.is_empty());
        assert_eq!(stats.impressions_queued, 0);
    }
}
