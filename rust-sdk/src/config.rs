use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use splitio_core::api;
use splitio_core::impressions::{ImpressionListener, ImpressionsMode};

/// Configuration for [`crate::SplitFactory`].
///
/// # Examples
/// ```
/// # use splitio::SplitConfig;
/// let config = SplitConfig::new()
///     .features_refresh_rate(std::time::Duration::from_secs(60))
///     .streaming_enabled(false);
/// ```
pub struct SplitConfig {
    pub(crate) connection_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) features_refresh_rate: Duration,
    pub(crate) segments_refresh_rate: Duration,
    pub(crate) impressions_refresh_rate: Duration,
    pub(crate) events_push_rate: Duration,
    pub(crate) metrics_refresh_rate: Duration,
    pub(crate) randomize_intervals: bool,
    /// How long `build_factory` itself blocks waiting for readiness. Zero
    /// means don't block; callers use `block_until_ready` instead.
    pub(crate) ready: Duration,
    pub(crate) impressions_mode: ImpressionsMode,
    pub(crate) impressions_queue_size: usize,
    pub(crate) events_queue_size: usize,
    pub(crate) streaming_enabled: bool,
    pub(crate) ip_addresses_enabled: bool,
    pub(crate) flag_sets_filter: Option<Vec<String>>,
    pub(crate) sdk_api_base_url: String,
    pub(crate) events_api_base_url: String,
    pub(crate) auth_api_base_url: String,
    pub(crate) streaming_api_base_url: String,
    pub(crate) impression_listener: Option<Arc<dyn ImpressionListener>>,
    pub(crate) machine_name: Option<String>,
    pub(crate) machine_ip: Option<String>,
    /// Flag file used in localhost mode. Defaults to `$HOME/.split`.
    pub(crate) split_file: Option<PathBuf>,
    pub(crate) shutdown_grace: Duration,
}

impl Default for SplitConfig {
    fn default() -> SplitConfig {
        SplitConfig {
            connection_timeout: api::DEFAULT_CONNECT_TIMEOUT,
            read_timeout: api::DEFAULT_READ_TIMEOUT,
            features_refresh_rate: Duration::from_secs(30),
            segments_refresh_rate: Duration::from_secs(60),
            impressions_refresh_rate: Duration::from_secs(60),
            events_push_rate: Duration::from_secs(60),
            metrics_refresh_rate: Duration::from_secs(3600),
            randomize_intervals: false,
            ready: Duration::ZERO,
            impressions_mode: ImpressionsMode::Optimized,
            impressions_queue_size: splitio_core::impressions::manager::DEFAULT_QUEUE_SIZE,
            events_queue_size: splitio_core::events::DEFAULT_QUEUE_SIZE,
            streaming_enabled: true,
            ip_addresses_enabled: true,
            flag_sets_filter: None,
            sdk_api_base_url: api::DEFAULT_SDK_URL.to_owned(),
            events_api_base_url: api::DEFAULT_EVENTS_URL.to_owned(),
            auth_api_base_url: api::DEFAULT_AUTH_URL.to_owned(),
            streaming_api_base_url: api::DEFAULT_STREAMING_URL.to_owned(),
            impression_listener: None,
            machine_name: None,
            machine_ip: None,
            split_file: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SplitConfig {
    /// Create a configuration with the default settings.
    pub fn new() -> SplitConfig {
        SplitConfig::default()
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn features_refresh_rate(mut self, rate: Duration) -> Self {
        self.features_refresh_rate = rate;
        self
    }

    pub fn segments_refresh_rate(mut self, rate: Duration) -> Self {
        self.segments_refresh_rate = rate;
        self
    }

    pub fn impressions_refresh_rate(mut self, rate: Duration) -> Self {
        self.impressions_refresh_rate = rate;
        self
    }

    pub fn events_push_rate(mut self, rate: Duration) -> Self {
        self.events_push_rate = rate;
        self
    }

    pub fn metrics_refresh_rate(mut self, rate: Duration) -> Self {
        self.metrics_refresh_rate = rate;
        self
    }

    /// Randomize poll intervals within [0.5x, 2x] to avoid synchronized
    /// fleets.
    pub fn randomize_intervals(mut self, randomize: bool) -> Self {
        self.randomize_intervals = randomize;
        self
    }

    /// Block `build_factory` until the SDK is ready, up to the given wait.
    pub fn ready(mut self, ready: Duration) -> Self {
        self.ready = ready;
        self
    }

    pub fn impressions_mode(mut self, mode: ImpressionsMode) -> Self {
        self.impressions_mode = mode;
        self
    }

    pub fn impressions_queue_size(mut self, size: usize) -> Self {
        self.impressions_queue_size = size;
        self
    }

    pub fn events_queue_size(mut self, size: usize) -> Self {
        self.events_queue_size = size;
        self
    }

    pub fn streaming_enabled(mut self, enabled: bool) -> Self {
        self.streaming_enabled = enabled;
        self
    }

    /// Send host name / IP headers with backend requests.
    pub fn ip_addresses_enabled(mut self, enabled: bool) -> Self {
        self.ip_addresses_enabled = enabled;
        self
    }

    /// Restrict synchronization to flags tagged with these flag sets.
    pub fn flag_sets_filter(mut self, sets: Vec<String>) -> Self {
        self.flag_sets_filter = Some(sets);
        self
    }

    pub fn sdk_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.sdk_api_base_url = url.into();
        self
    }

    pub fn events_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.events_api_base_url = url.into();
        self
    }

    pub fn auth_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.auth_api_base_url = url.into();
        self
    }

    pub fn streaming_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.streaming_api_base_url = url.into();
        self
    }

    /// Hook invoked with every emitted impression, on a dedicated worker.
    pub fn impression_listener(mut self, listener: Arc<dyn ImpressionListener>) -> Self {
        self.impression_listener = Some(listener);
        self
    }

    pub fn machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = Some(name.into());
        self
    }

    pub fn machine_ip(mut self, ip: impl Into<String>) -> Self {
        self.machine_ip = Some(ip.into());
        self
    }

    /// Flag file to use in localhost mode instead of `$HOME/.split`.
    pub fn split_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.split_file = Some(path.into());
        self
    }

    /// How long `destroy` waits for final flushes.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub(crate) fn resolved_split_file(&self) -> PathBuf {
        self.split_file.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());
            PathBuf::from(home).join(".split")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = SplitConfig::new();
        assert_eq!(config.connection_timeout, Duration::from_millis(1500));
        assert_eq!(config.read_timeout, Duration::from_millis(1500));
        assert_eq!(config.features_refresh_rate, Duration::from_secs(30));
        assert_eq!(config.segments_refresh_rate, Duration::from_secs(60));
        assert_eq!(config.impressions_refresh_rate, Duration::from_secs(60));
        assert_eq!(config.events_push_rate, Duration::from_secs(60));
        assert_eq!(config.metrics_refresh_rate, Duration::from_secs(3600));
        assert!(!config.randomize_intervals);
        assert_eq!(config.ready, Duration::ZERO);
        assert_eq!(config.impressions_mode, ImpressionsMode::Optimized);
        assert!(config.streaming_enabled);
        assert!(config.ip_addresses_enabled);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn split_file_defaults_to_home_dot_split() {
        let config = SplitConfig::new();
        let path = config.resolved_split_file();
        assert!(path.ends_with(".split"));

        let config = SplitConfig::new().split_file("/tmp/flags.yaml");
        assert_eq!(config.resolved_split_file(), PathBuf::from("/tmp/flags.yaml"));
    }
}
