//! The impression pipeline: dedup, counting, unique-keys tracking, and the
//! bounded queue feeding the periodic flusher.
pub mod counter;
pub mod manager;
pub mod observer;
pub mod strategies;
pub mod unique_keys;

use serde::Serialize;

use crate::splits::ChangeNumber;

pub use counter::{CountPerFeature, ImpressionsCounter};
pub use manager::{spawn_listener_worker, ImpressionListener, ImpressionsManager};
pub use observer::ImpressionObserver;
pub use strategies::ImpressionsMode;
pub use unique_keys::{UniqueKeysPerFeature, UniqueKeysTracker};

/// One hour, the backend's counting timeframe.
pub const COUNTING_WINDOW_MS: i64 = 3600 * 1000;

/// Truncate a millisecond timestamp to its hour bucket.
pub fn truncate_to_hour(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(COUNTING_WINDOW_MS)
}

/// Record of one evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub feature_name: String,
    pub matching_key: String,
    pub bucketing_key: Option<String>,
    pub treatment: String,
    pub label: String,
    pub change_number: ChangeNumber,
    /// Creation timestamp, epoch milliseconds.
    pub time: i64,
    /// When the same (feature, key, treatment, change-number) was last seen,
    /// filled by the observer in debug/optimized modes.
    pub previous_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::truncate_to_hour;

    #[test]
    fn hour_truncation() {
        // 2023-02-03T16:58:57.882Z truncates to 16:00:00.
        assert_eq!(truncate_to_hour(1675443537882), 1675440000000);
        assert_eq!(truncate_to_hour(1675440000000), 1675440000000);
    }
}
