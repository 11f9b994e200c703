//! Per-feature, per-hour impression counters for optimized and none modes.
use std::collections::HashMap;
use std::sync::Mutex;

use super::{truncate_to_hour, Impression};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountPerFeature {
    pub feature: String,
    pub timeframe: i64,
    pub count: u64,
}

/// Counts impressions per (feature, hour) timeframe.
#[derive(Default)]
pub struct ImpressionsCounter {
    counts: Mutex<HashMap<(String, i64), u64>>,
}

impl ImpressionsCounter {
    pub fn new() -> ImpressionsCounter {
        ImpressionsCounter::default()
    }

    pub fn track(&self, impressions: &[Impression]) {
        if impressions.is_empty() {
            return;
        }
        let mut counts = self
            .counts
            .lock()
            .expect("thread holding counter lock should not panic");
        for impression in impressions {
            let key = (
                impression.feature_name.clone(),
                truncate_to_hour(impression.time),
            );
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    /// Drain all accumulated counts for flushing.
    pub fn pop_all(&self) -> Vec<CountPerFeature> {
        let mut counts = self
            .counts
            .lock()
            .expect("thread holding counter lock should not panic");
        counts
            .drain()
            .map(|((feature, timeframe), count)| CountPerFeature {
                feature,
                timeframe,
                count,
            })
            .collect()
    }
}
