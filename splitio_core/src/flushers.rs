//! Periodic flush tasks draining the telemetry pipelines to the backend,
//! plus the one-shot final flush used on shutdown.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{is_retryable, SplitApi};
use crate::events::EventsQueue;
use crate::impressions::ImpressionsManager;
use crate::sync::Backoff;
use crate::tasks::Shutdown;
use crate::telemetry::TelemetryRuntime;
use crate::Result;

/// Maximum entries per POST.
pub const FLUSH_BULK_SIZE: usize = 5_000;
/// Cadence for the per-feature impression counters.
pub const COUNTS_FLUSH_INTERVAL: Duration = Duration::from_secs(1800);
/// Cadence for the unique-keys tracker.
pub const UNIQUE_KEYS_FLUSH_INTERVAL: Duration = Duration::from_secs(900);

const POST_RETRIES: u32 = 3;
const POST_RETRY_BASE: Duration = Duration::from_millis(500);

/// Retry transient failures; client errors drop the batch (it would fail
/// again) and surface only through telemetry.
async fn post_with_retries<F, Fut>(op: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut backoff = Backoff::new(POST_RETRY_BASE, POST_RETRY_BASE * 8);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) if is_retryable(&err) && attempt + 1 < POST_RETRIES => {
                attempt += 1;
                tokio::time::sleep(backoff.next()).await;
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn flush_impressions(api: &SplitApi, impressions: &ImpressionsManager) {
    loop {
        let batch = impressions.pop_batch(FLUSH_BULK_SIZE);
        if batch.is_empty() {
            return;
        }
        if let Err(err) = post_with_retries(|| api.post_impressions(&batch)).await {
            log::warn!(target: "splitio", "dropping {} impressions after failed flush: {err}", batch.len());
            return;
        }
    }
}

pub async fn flush_impression_counts(api: &SplitApi, impressions: &ImpressionsManager) {
    let counts = impressions.counter().pop_all();
    if counts.is_empty() {
        return;
    }
    if let Err(err) = post_with_retries(|| api.post_impression_counts(&counts)).await {
        log::warn!(target: "splitio", "dropping impression counts after failed flush: {err}");
    }
}

pub async fn flush_unique_keys(api: &SplitApi, impressions: &ImpressionsManager) {
    let unique_keys = impressions.unique_keys().pop_all();
    if unique_keys.is_empty() {
        return;
    }
    if let Err(err) = post_with_retries(|| api.post_unique_keys(&unique_keys)).await {
        log::warn!(target: "splitio", "dropping unique keys after failed flush: {err}");
    }
}

pub async fn flush_events(api: &SplitApi, events: &EventsQueue) {
    loop {
        let batch = events.pop_batch(FLUSH_BULK_SIZE);
        if batch.is_empty() {
            return;
        }
        if let Err(err) = post_with_retries(|| api.post_events(&batch)).await {
            log::warn!(target: "splitio", "dropping {} events after failed flush: {err}", batch.len());
            return;
        }
    }
}

pub async fn flush_telemetry(api: &SplitApi, telemetry: &TelemetryRuntime) {
    let stats = telemetry.pop_stats();
    // Telemetry delivery is strictly best effort.
    if let Err(err) = api.post_telemetry_stats(&stats).await {
        log::debug!(target: "splitio", "telemetry stats push failed: {err}");
    }
}

fn spawn_periodic<F, Fut>(interval: Duration, mut shutdown: Shutdown, flush: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => flush().await,
                _ = shutdown.signalled() => return,
            }
        }
    });
}

/// Spawn every flusher the in-memory pipelines need.
pub fn spawn_flushers(
    api: Arc<SplitApi>,
    impressions: Arc<ImpressionsManager>,
    events: Arc<EventsQueue>,
    telemetry: Arc<TelemetryRuntime>,
    impressions_interval: Duration,
    events_interval: Duration,
    telemetry_interval: Duration,
    shutdown: &Shutdown,
) {
    {
        let api = Arc::clone(&api);
        let impressions = Arc::clone(&impressions);
        spawn_periodic(impressions_interval, shutdown.clone(), move || {
            let api = Arc::clone(&api);
            let impressions = Arc::clone(&impressions);
            async move { flush_impressions(&api, &impressions).await }
        });
    }
    {
        let api = Arc::clone(&api);
        let impressions = Arc::clone(&impressions);
        spawn_periodic(COUNTS_FLUSH_INTERVAL, shutdown.clone(), move || {
            let api = Arc::clone(&api);
            let impressions = Arc::clone(&impressions);
            async move { flush_impression_counts(&api, &impressions).await }
        });
    }
    {
        let api = Arc::clone(&api);
        let impressions = Arc::clone(&impressions);
        spawn_periodic(UNIQUE_KEYS_FLUSH_INTERVAL, shutdown.clone(), move || {
            let api = Arc::clone(&api);
            let impressions = Arc::clone(&impressions);
            async move { flush_unique_keys(&api, &impressions).await }
        });
    }
    {
        let api = Arc::clone(&api);
        let events = Arc::clone(&events);
        spawn_periodic(events_interval, shutdown.clone(), move || {
            let api = Arc::clone(&api);
            let events = Arc::clone(&events);
            async move { flush_events(&api, &events).await }
        });
    }
    {
        spawn_periodic(telemetry_interval, shutdown.clone(), move || {
            let api = Arc::clone(&api);
            let telemetry = Arc::clone(&telemetry);
            async move { flush_telemetry(&api, &telemetry).await }
        });
    }
}

/// One last attempt to drain everything, run on destroy within the grace
/// window.
pub async fn final_flush(
    api: &SplitApi,
    impressions: &ImpressionsManager,
    events: &EventsQueue,
    telemetry: &TelemetryRuntime,
) {
    flush_impressions(api, impressions).await;
    flush_impression_counts(api, impressions).await;
    flush_unique_keys(api, impressions).await;
    flush_events(api, events).await;
    flush_telemetry(api, telemetry).await;
}
