//! The client: treatment evaluation and event tracking against the
//! factory's shared storage.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use splitio_core::evaluator::{labels, Evaluation, Evaluator, CONTROL};
use splitio_core::events::Event;
use splitio_core::impressions::Impression;
use splitio_core::telemetry::Method;
use splitio_core::{Attributes, Key};

use crate::factory::FactoryInner;
use crate::validation;

/// A treatment plus its optional configuration payload.
pub type TreatmentWithConfig = (String, Option<String>);

/// Client handle for evaluating feature flags and tracking events.
///
/// Obtained from [`crate::SplitFactory::client`]. Evaluation never blocks on
/// I/O and never panics across the public surface: invalid input, a
/// not-ready factory, or a destroyed factory all degrade to the `"control"`
/// treatment.
#[derive(Clone)]
pub struct SplitClient {
    inner: Arc<FactoryInner>,
}

impl SplitClient {
    pub(crate) fn new(inner: Arc<FactoryInner>) -> SplitClient {
        SplitClient { inner }
    }

    /// Evaluate one feature flag for the given key.
    ///
    /// # Examples
    /// ```no_run
    /// # fn test(client: &splitio::SplitClient) {
    /// let treatment = client.get_treatment("user-123", "new_ui", None);
    /// if treatment == "on" {
    ///     // show the new UI
    /// }
    /// # }
    /// ```
    pub fn get_treatment(
        &self,
        key: impl Into<Key>,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> String {
        if !validation::validate_feature_name(feature, "get_treatment") {
            return CONTROL.to_owned();
        }
        let mut result = self.evaluate_many(
            Method::Treatment,
            key.into(),
            vec![feature.trim().to_owned()],
            attributes,
        );
        result
            .remove(feature.trim())
            .map(|evaluation| evaluation.treatment)
            .unwrap_or_else(|| CONTROL.to_owned())
    }

    /// Like [`SplitClient::get_treatment`], also returning the treatment's
    /// configuration payload if one is defined.
    pub fn get_treatment_with_config(
        &self,
        key: impl Into<Key>,
        feature: &str,
        attributes: Option<&Attributes>,
    ) -> TreatmentWithConfig {
        if !validation::validate_feature_name(feature, "get_treatment_with_config") {
            return (CONTROL.to_owned(), None);
        }
        let mut result = self.evaluate_many(
            Method::TreatmentWithConfig,
            key.into(),
            vec![feature.trim().to_owned()],
            attributes,
        );
        result
            .remove(feature.trim())
            .map(|evaluation| (evaluation.treatment, evaluation.configuration))
            .unwrap_or_else(|| (CONTROL.to_owned(), None))
    }

    /// Evaluate several feature flags against one storage snapshot.
    pub fn get_treatments(
        &self,
        key: impl Into<Key>,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        self.evaluate_many(
            Method::Treatments,
            key.into(),
            clean_features(features, "get_treatments"),
            attributes,
        )
        .into_iter()
        .map(|(feature, evaluation)| (feature, evaluation.treatment))
        .collect()
    }

    pub fn get_treatments_with_config(
        &self,
        key: impl Into<Key>,
        features: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        self.evaluate_many(
            Method::TreatmentsWithConfig,
            key.into(),
            clean_features(features, "get_treatments_with_config"),
            attributes,
        )
        .into_iter()
        .map(|(feature, evaluation)| {
            (feature, (evaluation.treatment, evaluation.configuration))
        })
        .collect()
    }

    /// Evaluate every flag tagged with the given flag set.
    pub fn get_treatments_by_flag_set(
        &self,
        key: impl Into<Key>,
        flag_set: &str,
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        let features = self.features_in_sets(&[flag_set], "get_treatments_by_flag_set");
        self.evaluate_many(Method::TreatmentsByFlagSet, key.into(), features, attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, evaluation.treatment))
            .collect()
    }

    /// Evaluate every flag tagged with any of the given flag sets.
    pub fn get_treatments_by_flag_sets(
        &self,
        key: impl Into<Key>,
        flag_sets: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, String> {
        let features = self.features_in_sets(flag_sets, "get_treatments_by_flag_sets");
        self.evaluate_many(Method::TreatmentsByFlagSets, key.into(), features, attributes)
            .into_iter()
            .map(|(feature, evaluation)| (feature, evaluation.treatment))
            .collect()
    }

    pub fn get_treatments_with_config_by_flag_set(
        &self,
        key: impl Into<Key>,
        flag_set: &str,
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        let features =
            self.features_in_sets(&[flag_set], "get_treatments_with_config_by_flag_set");
        self.evaluate_many(Method::TreatmentsByFlagSet, key.into(), features, attributes)
            .into_iter()
            .map(|(feature, evaluation)| {
                (feature, (evaluation.treatment, evaluation.configuration))
            })
            .collect()
    }

    pub fn get_treatments_with_config_by_flag_sets(
        &self,
        key: impl Into<Key>,
        flag_sets: &[&str],
        attributes: Option<&Attributes>,
    ) -> HashMap<String, TreatmentWithConfig> {
        let features =
            self.features_in_sets(flag_sets, "get_treatments_with_config_by_flag_sets");
        self.evaluate_many(Method::TreatmentsByFlagSets, key.into(), features, attributes)
            .into_iter()
            .map(|(feature, evaluation)| {
                (feature, (evaluation.treatment, evaluation.configuration))
            })
            .collect()
    }

    /// Track an application event. Returns whether the event was queued.
    ///
    /// # Examples
    /// ```no_run
    /// # fn test(client: &splitio::SplitClient) {
    /// client.track("user-123", "user", "page.view", None, None);
    /// client.track("user-123", "user", "checkout", Some(39.99), None);
    /// # }
    /// ```
    pub fn track(
        &self,
        key: &str,
        traffic_type: &str,
        event_type: &str,
        value: Option<f64>,
        properties: Option<HashMap<String, serde_json::Value>>,
    ) -> bool {
        let started = Instant::now();
        let queued = self.track_inner(key, traffic_type, event_type, value, properties);
        self.inner
            .telemetry
            .record_latency(Method::Track, started.elapsed());
        if !queued {
            self.inner.telemetry.record_exception(Method::Track);
        }
        queued
    }

    fn track_inner(
        &self,
        key: &str,
        traffic_type: &str,
        event_type: &str,
        value: Option<f64>,
        properties: Option<HashMap<String, serde_json::Value>>,
    ) -> bool {
        if self.inner.is_destroyed() {
            log::error!(target: "splitio", "track: the factory has been destroyed");
            return false;
        }
        if !validation::validate_key(&Key::new(key), "track") {
            return false;
        }
        let Some(traffic_type) = validation::validate_traffic_type(traffic_type) else {
            return false;
        };
        if !validation::validate_event_type(event_type) {
            return false;
        }
        if let Some(value) = value {
            if !value.is_finite() {
                log::error!(target: "splitio", "track: value must be a finite number");
                return false;
            }
        }
        let properties = match properties {
            Some(properties) => match validation::validate_properties(properties) {
                Some(properties) => Some(properties),
                None => return false,
            },
            None => None,
        };
        let Some(events) = &self.inner.events else {
            // Localhost mode accepts and discards valid events.
            return true;
        };

        if self.inner.readiness.is_ready() {
            let known = self
                .inner
                .splits
                .snapshot()
                .splits()
                .any(|split| split.traffic_type_name.as_deref() == Some(traffic_type.as_str()));
            if !known {
                log::warn!(
                    target: "splitio",
                    "track: traffic_type {traffic_type} does not have any corresponding feature flags in this environment",
                );
            }
        }

        events.push(Event {
            key: key.to_owned(),
            traffic_type_name: traffic_type,
            event_type_id: event_type.to_owned(),
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
            properties,
        });
        true
    }

    /// The shared multi-flag evaluation path: validate, snapshot once,
    /// evaluate all, emit impressions, record telemetry.
    fn evaluate_many(
        &self,
        method: Method,
        key: Key,
        features: Vec<String>,
        attributes: Option<&Attributes>,
    ) -> HashMap<String, Evaluation> {
        let started = Instant::now();

        if self.inner.is_destroyed() {
            log::error!(target: "splitio", "{}: the factory has been destroyed", method.as_str());
            return control_outcomes(features, labels::SDK_DESTROYED);
        }
        if !validation::validate_key(&key, method.as_str()) {
            self.inner.telemetry.record_exception(method);
            return control_outcomes(features, labels::EXCEPTION);
        }
        if !self.inner.readiness.is_ready() {
            log::warn!(
                target: "splitio",
                "{}: the SDK is not ready, results may be incorrect; make sure to wait for SDK readiness before using this method",
                method.as_str(),
            );
            return control_outcomes(features, labels::NOT_READY);
        }

        let snapshot = self.inner.splits.snapshot();
        let evaluator = Evaluator::new(
            &snapshot,
            self.inner.segments.as_ref(),
            self.inner.large_segments.as_ref(),
        );

        let now = chrono::Utc::now().timestamp_millis();
        let mut outcomes: HashMap<String, Evaluation> = HashMap::new();
        let mut impressions: Vec<Impression> = Vec::new();
        for feature in features {
            let evaluation = evaluator.evaluate(&feature, &key, attributes);
            if evaluation.track {
                impressions.push(Impression {
                    feature_name: feature.clone(),
                    matching_key: key.matching_key().to_owned(),
                    bucketing_key: key.explicit_bucketing_key().map(str::to_owned),
                    treatment: evaluation.treatment.clone(),
                    label: evaluation.label.clone(),
                    change_number: evaluation.change_number,
                    time: now,
                    previous_time: None,
                });
            }
            outcomes.insert(feature, evaluation);
        }

        if let Some(manager) = &self.inner.impressions {
            if !impressions.is_empty() {
                manager.track(impressions);
            }
        }
        self.inner.telemetry.record_latency(method, started.elapsed());

        outcomes
    }

    fn features_in_sets(&self, flag_sets: &[&str], method: &str) -> Vec<String> {
        let owned: Vec<String> = flag_sets.iter().map(|s| s.to_string()).collect();
        let sanitized = validation::sanitize_flag_sets(&owned, method);
        if sanitized.is_empty() {
            log::error!(target: "splitio", "{method}: you passed no valid flag sets");
            return Vec::new();
        }
        let snapshot = self.inner.splits.snapshot();
        let mut features: Vec<String> = sanitized
            .iter()
            .flat_map(|set| snapshot.flag_set(set))
            .collect();
        features.sort();
        features.dedup();
        features
    }
}

fn control_outcomes(features: Vec<String>, label: &str) -> HashMap<String, Evaluation> {
    features
        .into_iter()
        .map(|feature| (feature, Evaluation::control(label)))
        .collect()
}

fn clean_features(features: &[&str], method: &str) -> Vec<String> {
    let mut cleaned: Vec<String> = features
        .iter()
        .filter(|feature| validation::validate_feature_name(feature, method))
        .map(|feature| feature.trim().to_owned())
        .collect();
    cleaned.dedup();
    cleaned
}
