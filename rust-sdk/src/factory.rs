//! The factory: owns storage, the background runtime, and every long-lived
//! task; hands out clients and managers that share its internals.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use splitio_core::api::{ApiConfig, SplitApi};
use splitio_core::events::EventsQueue;
use splitio_core::flushers;
use splitio_core::impressions::{spawn_listener_worker, ImpressionsManager};
use splitio_core::localhost;
use splitio_core::push::{PushManager, PushMessage};
use splitio_core::storage::{InMemorySegmentStorage, InMemorySplitStorage};
use splitio_core::sync::{ReadinessGate, SyncConfig, SyncManager, Synchronizer};
use splitio_core::tasks::{shutdown_channel, ShutdownHandle};
use splitio_core::telemetry::{ConfigEcho, RefreshRates, TelemetryRuntime};
use splitio_core::{Error, Result, SdkMetadata};

use crate::client::SplitClient;
use crate::manager::SplitManager;
use crate::validation::sanitize_flag_sets;
use crate::SplitConfig;

/// The sdk_key that switches the factory into localhost (network-free)
/// mode.
pub const LOCALHOST_API_KEY: &str = "localhost";

/// Process-wide registry of active factories per sdk_key, used to warn on
/// duplicate instantiation.
static ACTIVE_FACTORIES: Lazy<Mutex<HashMap<String, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn register_factory(sdk_key: &str) {
    let mut registry = ACTIVE_FACTORIES
        .lock()
        .expect("thread holding factory registry lock should not panic");
    let count = registry.entry(sdk_key.to_owned()).or_insert(0);
    *count += 1;
    if *count == 2 {
        log::warn!(
            target: "splitio",
            "factory instantiation: you already have 1 factory with this sdk_key. \
             We recommend keeping only one instance of the factory at all times \
             (singleton pattern) and reusing it throughout your application."
        );
    }
}

fn unregister_factory(sdk_key: &str) {
    let mut registry = ACTIVE_FACTORIES
        .lock()
        .expect("thread holding factory registry lock should not panic");
    if let Some(count) = registry.get_mut(sdk_key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            registry.remove(sdk_key);
        }
    }
}

fn active_factories() -> usize {
    ACTIVE_FACTORIES
        .lock()
        .expect("thread holding factory registry lock should not panic")
        .values()
        .sum()
}

pub(crate) struct FactoryInner {
    sdk_key: String,
    pub(crate) splits: Arc<InMemorySplitStorage>,
    pub(crate) segments: Arc<InMemorySegmentStorage>,
    pub(crate) large_segments: Arc<InMemorySegmentStorage>,
    pub(crate) impressions: Option<Arc<ImpressionsManager>>,
    pub(crate) events: Option<Arc<EventsQueue>>,
    pub(crate) telemetry: Arc<TelemetryRuntime>,
    pub(crate) readiness: Arc<ReadinessGate>,
    api: Option<Arc<SplitApi>>,
    destroyed: AtomicBool,
    shutdown: ShutdownHandle,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    shutdown_grace: Duration,
}

impl FactoryInner {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }
}

/// Entry point of the SDK.
///
/// Builds a [`SplitFactory`], starting background synchronization
/// immediately. With the `"localhost"` sdk_key the factory runs entirely
/// off a local flag file and performs no network I/O.
///
/// # Examples
/// ```no_run
/// # use splitio::{build_factory, SplitConfig};
/// let factory = build_factory("YOUR_SDK_KEY", SplitConfig::new()).unwrap();
/// factory.block_until_ready(std::time::Duration::from_secs(10)).unwrap();
/// let client = factory.client();
/// let treatment = client.get_treatment("user-123", "new_ui", None);
/// ```
pub fn build_factory(sdk_key: &str, config: SplitConfig) -> Result<SplitFactory> {
    if sdk_key.trim().is_empty() {
        log::error!(target: "splitio", "factory instantiation: you passed an empty sdk_key");
        return Err(Error::InvalidSdkKey);
    }

    let factory = if sdk_key == LOCALHOST_API_KEY {
        build_localhost(&config)?
    } else {
        build_standalone(sdk_key, &config)?
    };

    register_factory(sdk_key);

    if !config.ready.is_zero() {
        factory.block_until_ready(config.ready)?;
    }
    Ok(factory)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("splitio-sync")
        .enable_all()
        .build()?)
}

fn build_localhost(config: &SplitConfig) -> Result<SplitFactory> {
    let runtime = build_runtime()?;
    let (shutdown_handle, shutdown) = shutdown_channel();
    let splits = Arc::new(InMemorySplitStorage::new());
    let readiness = Arc::new(ReadinessGate::new());

    {
        let _guard = runtime.enter();
        localhost::spawn_file_watcher(
            config.resolved_split_file(),
            Arc::clone(&splits),
            config.features_refresh_rate,
            Arc::clone(&readiness),
            shutdown,
        );
    }

    Ok(SplitFactory {
        inner: Arc::new(FactoryInner {
            sdk_key: LOCALHOST_API_KEY.to_owned(),
            splits,
            segments: Arc::new(InMemorySegmentStorage::new()),
            large_segments: Arc::new(InMemorySegmentStorage::new()),
            impressions: None,
            events: None,
            telemetry: Arc::new(TelemetryRuntime::new()),
            readiness,
            api: None,
            destroyed: AtomicBool::new(false),
            shutdown: shutdown_handle,
            runtime: Mutex::new(Some(runtime)),
            shutdown_grace: config.shutdown_grace,
        }),
    })
}

fn build_standalone(sdk_key: &str, config: &SplitConfig) -> Result<SplitFactory> {
    let telemetry = Arc::new(TelemetryRuntime::new());
    let metadata = build_metadata(config);
    let api = Arc::new(SplitApi::new(
        sdk_key.to_owned(),
        ApiConfig {
            sdk_url: config.sdk_api_base_url.clone(),
            events_url: config.events_api_base_url.clone(),
            auth_url: config.auth_api_base_url.clone(),
            connect_timeout: config.connection_timeout,
            read_timeout: config.read_timeout,
        },
        metadata,
        Arc::clone(&telemetry),
    )?);

    let splits = Arc::new(InMemorySplitStorage::new());
    let segments = Arc::new(InMemorySegmentStorage::new());
    let readiness = Arc::new(ReadinessGate::new());

    let flag_sets = config.flag_sets_filter.as_ref().map(|sets| {
        sanitize_flag_sets(sets, "factory instantiation")
    });
    let fetcher: Arc<dyn splitio_core::sync::FeedFetcher> = api.clone();
    let synchronizer = Arc::new(Synchronizer::new(
        fetcher,
        Arc::clone(&splits),
        Arc::clone(&segments),
        flag_sets.filter(|sets| !sets.is_empty()),
    ));

    let runtime = build_runtime()?;
    let (shutdown_handle, shutdown) = shutdown_channel();

    let (impressions, events) = {
        let _guard = runtime.enter();

        let listener_tx = config.impression_listener.as_ref().map(|listener| {
            spawn_listener_worker(
                Arc::clone(listener),
                Arc::clone(&telemetry),
                shutdown.clone(),
            )
        });
        let impressions = Arc::new(ImpressionsManager::new(
            config.impressions_mode,
            config.impressions_queue_size,
            Arc::clone(&telemetry),
            listener_tx,
        ));
        let events = Arc::new(EventsQueue::new(
            config.events_queue_size,
            Arc::clone(&telemetry),
        ));

        let sync_manager = Arc::new(SyncManager::new(
            Arc::clone(&synchronizer),
            Arc::clone(&readiness),
            SyncConfig {
                features_refresh: config.features_refresh_rate,
                segments_refresh: config.segments_refresh_rate,
                randomize_intervals: config.randomize_intervals,
                streaming_enabled: config.streaming_enabled,
            },
        ));
        let (push_tx, push_rx) = mpsc::channel::<PushMessage>(128);
        tokio::spawn(Arc::clone(&sync_manager).run(push_rx, shutdown.clone()));

        if config.streaming_enabled {
            let push_manager = PushManager::new(
                Arc::clone(&api),
                config.streaming_api_base_url.clone(),
                config.connection_timeout,
                push_tx,
                Arc::clone(&telemetry),
            )?;
            tokio::spawn(push_manager.run(shutdown.clone()));
        }

        flushers::spawn_flushers(
            Arc::clone(&api),
            Arc::clone(&impressions),
            Arc::clone(&events),
            Arc::clone(&telemetry),
            config.impressions_refresh_rate,
            config.events_push_rate,
            config.metrics_refresh_rate,
            &shutdown,
        );

        spawn_config_echo(Arc::clone(&api), Arc::clone(&readiness), config);

        (impressions, events)
    };

    Ok(SplitFactory {
        inner: Arc::new(FactoryInner {
            sdk_key: sdk_key.to_owned(),
            splits,
            segments,
            large_segments: Arc::new(InMemorySegmentStorage::new()),
            impressions: Some(impressions),
            events: Some(events),
            telemetry,
            readiness,
            api: Some(api),
            destroyed: AtomicBool::new(false),
            shutdown: shutdown_handle,
            runtime: Mutex::new(Some(runtime)),
            shutdown_grace: config.shutdown_grace,
        }),
    })
}

fn build_metadata(config: &SplitConfig) -> SdkMetadata {
    if !config.ip_addresses_enabled {
        return SdkMetadata::default();
    }
    SdkMetadata {
        machine_name: config
            .machine_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok()),
        machine_ip: config.machine_ip.clone(),
        ..SdkMetadata::default()
    }
}

/// POST the one-time config echo once the first sync settles (or after the
/// readiness wait gives up).
fn spawn_config_echo(api: Arc<SplitApi>, readiness: Arc<ReadinessGate>, config: &SplitConfig) {
    let mut echo = ConfigEcho {
        operation_mode: "in-memory-standalone".to_owned(),
        streaming_enabled: config.streaming_enabled,
        refresh_rates: RefreshRates {
            features: config.features_refresh_rate.as_secs(),
            segments: config.segments_refresh_rate.as_secs(),
            impressions: config.impressions_refresh_rate.as_secs(),
            events: config.events_push_rate.as_secs(),
            telemetry: config.metrics_refresh_rate.as_secs(),
        },
        impressions_queue_size: config.impressions_queue_size,
        events_queue_size: config.events_queue_size,
        impressions_mode: config.impressions_mode.as_str().to_owned(),
        impression_listener: config.impression_listener.is_some(),
        http_timeouts_ms: (
            config.connection_timeout.as_millis() as u64,
            config.read_timeout.as_millis() as u64,
        ),
        active_factories: active_factories() + 1,
        time_until_ready_ms: None,
    };

    tokio::spawn(async move {
        let started = Instant::now();
        let gate = Arc::clone(&readiness);
        let became_ready =
            tokio::task::spawn_blocking(move || gate.wait(Duration::from_secs(600)).is_ok())
                .await
                .unwrap_or(false);
        if became_ready {
            echo.time_until_ready_ms = Some(started.elapsed().as_millis() as u64);
        }
        if let Err(err) = api.post_telemetry_config(&echo).await {
            log::debug!(target: "splitio", "config echo push failed: {err}");
        }
    });
}

/// Handle to a built SDK instance. The factory is the sole owner of the
/// background machinery; [`SplitClient`] and [`SplitManager`] handles share
/// its internals and turn inert once [`SplitFactory::destroy`] runs.
pub struct SplitFactory {
    inner: Arc<FactoryInner>,
}

impl SplitFactory {
    /// Get a client handle for evaluating treatments and tracking events.
    pub fn client(&self) -> SplitClient {
        SplitClient::new(Arc::clone(&self.inner))
    }

    /// Get a manager handle for inspecting the cached flag definitions.
    pub fn manager(&self) -> SplitManager {
        SplitManager::new(Arc::clone(&self.inner))
    }

    /// Wait until the first full synchronization lands. Evaluations before
    /// readiness return `"control"`.
    ///
    /// # Errors
    ///
    /// - [`Error::ReadyTimeout`] if the deadline elapses first.
    /// - [`Error::Unauthorized`] if the sdk_key was rejected.
    /// - [`Error::Destroyed`] if the factory has been destroyed.
    pub fn block_until_ready(&self, timeout: Duration) -> Result<()> {
        if self.inner.is_destroyed() {
            return Err(Error::Destroyed);
        }
        self.inner.readiness.wait(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    /// Stop all background work, attempt one final flush within the grace
    /// window, and invalidate all handles. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "splitio", "destroying factory");
        self.inner.shutdown.signal();

        let runtime = self
            .inner
            .runtime
            .lock()
            .expect("thread holding runtime lock should not panic")
            .take();
        if let Some(runtime) = runtime {
            if let (Some(api), Some(impressions), Some(events)) = (
                &self.inner.api,
                &self.inner.impressions,
                &self.inner.events,
            ) {
                let flush = flushers::final_flush(api, impressions, events, &self.inner.telemetry);
                let grace = self.inner.shutdown_grace;
                let _ = runtime.block_on(async move { tokio::time::timeout(grace, flush).await });
            }
            runtime.shutdown_timeout(Duration::from_secs(1));
        }

        unregister_factory(&self.inner.sdk_key);
    }

    pub fn destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

impl Drop for SplitFactory {
    fn drop(&mut self) {
        // Only the last handle standing tears the machinery down
        // implicitly; explicit destroy() is still the recommended path.
        if Arc::strong_count(&self.inner) == 1 && !self.inner.is_destroyed() {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_sdk_key_is_rejected() {
        assert!(matches!(
            build_factory("", SplitConfig::new()),
            Err(Error::InvalidSdkKey)
        ));
    }

    #[test]
    fn localhost_factory_reads_the_flag_file_without_network() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "my_feature on").unwrap();
        writeln!(file, "other_feature off").unwrap();

        let factory = build_factory(
            LOCALHOST_API_KEY,
            SplitConfig::new().split_file(file.path()),
        )
        .unwrap();
        factory.block_until_ready(Duration::from_secs(5)).unwrap();

        let client = factory.client();
        assert_eq!(client.get_treatment("anyone", "my_feature", None), "on");
        assert_eq!(client.get_treatment("anyone", "other_feature", None), "off");
        assert_eq!(client.get_treatment("anyone", "missing", None), "control");

        factory.destroy();
        assert!(factory.destroyed());
        assert_eq!(client.get_treatment("anyone", "my_feature", None), "control");
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "my_feature on").unwrap();
        let factory = build_factory(
            LOCALHOST_API_KEY,
            SplitConfig::new().split_file(file.path()),
        )
        .unwrap();
        factory.destroy();
        factory.destroy();
        assert!(factory.destroyed());
        assert!(matches!(
            factory.block_until_ready(Duration::from_millis(10)),
            Err(Error::Destroyed)
        ));
    }
}
