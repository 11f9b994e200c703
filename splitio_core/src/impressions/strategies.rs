//! Impression processing strategies: what gets queued for flush, what feeds
//! the counters, and what the unique-keys tracker sees.
use serde::Deserialize;

use super::{truncate_to_hour, Impression, ImpressionObserver};

/// How evaluation outcomes are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImpressionsMode {
    /// Every impression is queued verbatim.
    Debug,
    /// Duplicates within the counting window are suppressed and counted.
    Optimized,
    /// Nothing is queued; only counters and unique keys are tracked.
    None,
}

impl Default for ImpressionsMode {
    fn default() -> ImpressionsMode {
        ImpressionsMode::Optimized
    }
}

impl ImpressionsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpressionsMode::Debug => "DEBUG",
            ImpressionsMode::Optimized => "OPTIMIZED",
            ImpressionsMode::None => "NONE",
        }
    }
}

/// The outcome of running impressions through a strategy.
#[derive(Debug, Default)]
pub struct ProcessedImpressions {
    /// Impressions to enqueue for the next flush.
    pub for_flush: Vec<Impression>,
    /// All observed impressions (previous-time filled in), handed to the
    /// impression listener.
    pub for_listener: Vec<Impression>,
    /// Impressions that contribute to per-feature hourly counters.
    pub for_counter: Vec<Impression>,
    /// (matching-key, feature) pairs for the unique-keys tracker.
    pub unique_keys: Vec<(String, String)>,
}

pub struct Strategy {
    mode: ImpressionsMode,
    observer: ImpressionObserver,
}

impl Strategy {
    pub fn new(mode: ImpressionsMode) -> Strategy {
        Strategy {
            mode,
            observer: ImpressionObserver::default(),
        }
    }

    pub fn mode(&self) -> ImpressionsMode {
        self.mode
    }

    pub fn process(&self, impressions: Vec<Impression>) -> ProcessedImpressions {
        match self.mode {
            ImpressionsMode::Debug => {
                let observed: Vec<Impression> = impressions
                    .into_iter()
                    .map(|i| self.observer.test_and_set(i))
                    .collect();
                ProcessedImpressions {
                    for_flush: observed.clone(),
                    for_listener: observed,
                    ..ProcessedImpressions::default()
                }
            }
            ImpressionsMode::Optimized => {
                let observed: Vec<Impression> = impressions
                    .into_iter()
                    .map(|i| self.observer.test_and_set(i))
                    .collect();
                // Everything already seen this hour is suppressed from the
                // flush queue but still counted.
                let for_counter: Vec<Impression> = observed
                    .iter()
                    .filter(|i| i.previous_time.is_some())
                    .cloned()
                    .collect();
                let for_flush: Vec<Impression> = observed
                    .iter()
                    .filter(|i| match i.previous_time {
                        None => true,
                        Some(previous) => previous < truncate_to_hour(i.time),
                    })
                    .cloned()
                    .collect();
                ProcessedImpressions {
                    for_flush,
                    for_listener: observed,
                    for_counter,
                    unique_keys: Vec::new(),
                }
            }
            ImpressionsMode::None => {
                let unique_keys = impressions
                    .iter()
                    .map(|i| (i.matching_key.clone(), i.feature_name.clone()))
                    .collect();
                ProcessedImpressions {
                    for_flush: Vec::new(),
                    for_listener: impressions.clone(),
                    for_counter: impressions,
                    unique_keys,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impression(time: i64) -> Impression {
        Impression {
            feature_name: "f".to_owned(),
            matching_key: "alice".to_owned(),
            bucketing_key: None,
            treatment: "on".to_owned(),
            label: "default rule".to_owned(),
            change_number: 1,
            time,
            previous_time: None,
        }
    }

    #[test]
    fn debug_mode_queues_everything() {
        let strategy = Strategy::new(ImpressionsMode::Debug);
        let processed = strategy.process(vec![impression(1000), impression(2000)]);
        assert_eq!(processed.for_flush.len(), 2);
        assert_eq!(processed.for_listener.len(), 2);
        assert!(processed.for_counter.is_empty());
        assert!(processed.unique_keys.is_empty());
        // The duplicate still carries its previous time.
        assert_eq!(processed.for_flush[1].previous_time, Some(1000));
    }

    #[test]
    fn optimized_mode_suppresses_same_hour_duplicates() {
        let strategy = Strategy::new(ImpressionsMode::Optimized);
        let hour = 1675440000000;

        let first = strategy.process(vec![impression(hour + 1)]);
        assert_eq!(first.for_flush.len(), 1);
        assert!(first.for_counter.is_empty());

        // Second and third sightings within the hour: suppressed, counted.
        let second = strategy.process(vec![impression(hour + 2)]);
        assert!(second.for_flush.is_empty());
        assert_eq!(second.for_counter.len(), 1);

        let third = strategy.process(vec![impression(hour + 3)]);
        assert!(third.for_flush.is_empty());
        assert_eq!(third.for_counter.len(), 1);

        // Next hour: flushed again, previous time points at the last
        // emission.
        let next_hour = strategy.process(vec![impression(hour + super::super::COUNTING_WINDOW_MS)]);
        assert_eq!(next_hour.for_flush.len(), 1);
        assert_eq!(next_hour.for_flush[0].previous_time, Some(hour + 3));
    }

    #[test]
    fn none_mode_only_counts_and_tracks_keys() {
        let strategy = Strategy::new(ImpressionsMode::None);
        let processed = strategy.process(vec![impression(1000), impression(2000)]);
        assert!(processed.for_flush.is_empty());
        assert_eq!(processed.for_counter.len(), 2);
        assert_eq!(
            processed.unique_keys,
            vec![
                ("alice".to_owned(), "f".to_owned()),
                ("alice".to_owned(), "f".to_owned())
            ]
        );
    }
}
