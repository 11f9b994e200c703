//! The treatment evaluator: a deterministic interpreter over flag
//! definitions stored in a [`SplitsSnapshot`].
use crate::hashing::{self, HashAlgorithm};
use crate::splits::matchers::{EvalContext, MatcherScope, MAX_DEPENDENCY_DEPTH};
use crate::splits::{splitter, ChangeNumber, ConditionType, Split};
use crate::storage::{SegmentStorage, SplitsSnapshot};
use crate::{Attributes, Key};

/// The sentinel treatment returned when no evaluation can be performed.
pub const CONTROL: &str = "control";

/// Labels attached to impressions, describing why a treatment was returned.
pub mod labels {
    pub const KILLED: &str = "killed";
    pub const DEFAULT_RULE: &str = "default rule";
    pub const DEFINITION_NOT_FOUND: &str = "definition not found";
    pub const NOT_IN_SPLIT: &str = "not in split";
    pub const EXCEPTION: &str = "exception";
    pub const UNSUPPORTED_MATCHER: &str = "targeting rule type unsupported by sdk";
    pub const SDK_DESTROYED: &str = "sdk destroyed";
    pub const NOT_READY: &str = "not ready";
}

/// Outcome of evaluating one flag for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub treatment: String,
    pub label: String,
    pub change_number: ChangeNumber,
    pub configuration: Option<String>,
    /// Whether this outcome should produce an impression. False only for
    /// unknown-definition outcomes.
    pub track: bool,
}

impl Evaluation {
    pub fn control(label: &str) -> Evaluation {
        Evaluation {
            treatment: CONTROL.to_owned(),
            label: label.to_owned(),
            change_number: -1,
            configuration: None,
            track: !matches!(
                label,
                labels::DEFINITION_NOT_FOUND | labels::NOT_READY | labels::SDK_DESTROYED | labels::EXCEPTION
            ),
        }
    }
}

/// Evaluates flags against one storage snapshot. Cheap to construct; build
/// one per public call so a multi-flag evaluation observes a single coherent
/// view of the world.
pub struct Evaluator<'a> {
    splits: &'a SplitsSnapshot,
    segments: &'a dyn SegmentStorage,
    large_segments: &'a dyn SegmentStorage,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        splits: &'a SplitsSnapshot,
        segments: &'a dyn SegmentStorage,
        large_segments: &'a dyn SegmentStorage,
    ) -> Evaluator<'a> {
        Evaluator {
            splits,
            segments,
            large_segments,
        }
    }

    /// Evaluate the named flag for the given key and attributes.
    pub fn evaluate(&self, feature: &str, key: &Key, attributes: Option<&Attributes>) -> Evaluation {
        self.evaluate_with_depth(feature, key, attributes, 0)
    }

    fn evaluate_with_depth(
        &self,
        feature: &str,
        key: &Key,
        attributes: Option<&Attributes>,
        depth: u8,
    ) -> Evaluation {
        let Some(split) = self.splits.get(feature) else {
            log::warn!(target: "splitio", "unknown or invalid feature flag: {feature}");
            return Evaluation::control(labels::DEFINITION_NOT_FOUND);
        };

        if split.uses_unsupported_matcher() {
            return default_outcome(split, labels::UNSUPPORTED_MATCHER);
        }

        if split.killed {
            return default_outcome(split, labels::KILLED);
        }

        let (treatment, label) = self.walk_conditions(split, key, attributes, depth);
        Evaluation {
            configuration: split.configuration_for(&treatment).map(str::to_owned),
            treatment,
            label,
            change_number: split.change_number,
            track: true,
        }
    }

    /// Walk conditions in order; the first whose matchers all succeed picks
    /// the partition. The traffic-allocation gate applies once, at the first
    /// rollout condition, so whitelist conditions always get a chance first.
    fn walk_conditions(
        &self,
        split: &Split,
        key: &Key,
        attributes: Option<&Attributes>,
        depth: u8,
    ) -> (String, String) {
        let mut rollout_started = false;
        let ctx = EvalContext {
            key,
            attributes,
            scope: self,
            depth,
        };

        for condition in &split.conditions {
            if !rollout_started && condition.condition_type == ConditionType::Rollout {
                rollout_started = true;
                let allocation = split.traffic_allocation();
                if allocation < 100 {
                    let seed = split.traffic_allocation_seed.unwrap_or(split.seed);
                    let bucket =
                        hashing::bucket(HashAlgorithm::Murmur3, key.bucketing_key(), seed);
                    if bucket as i64 > allocation {
                        return (
                            split.default_treatment.clone(),
                            labels::NOT_IN_SPLIT.to_owned(),
                        );
                    }
                }
            }

            let matched = condition
                .matcher_group
                .matchers
                .iter()
                .all(|matcher| matcher.evaluate(&ctx));
            if matched {
                let treatment = splitter::get_treatment(
                    key.bucketing_key(),
                    split.seed,
                    split.algo,
                    &condition.partitions,
                );
                return (treatment, condition.label.clone());
            }
        }

        (
            split.default_treatment.clone(),
            labels::DEFAULT_RULE.to_owned(),
        )
    }
}

fn default_outcome(split: &Split, label: &str) -> Evaluation {
    Evaluation {
        treatment: split.default_treatment.clone(),
        label: label.to_owned(),
        change_number: split.change_number,
        configuration: split
            .configuration_for(&split.default_treatment)
            .map(str::to_owned),
        track: true,
    }
}

impl MatcherScope for Evaluator<'_> {
    fn segment_contains(&self, segment: &str, key: &str) -> bool {
        self.segments.contains(segment, key)
    }

    fn large_segment_contains(&self, segment: &str, key: &str) -> bool {
        self.large_segments.contains(segment, key)
    }

    fn dependency_treatment(
        &self,
        split: &str,
        key: &Key,
        attributes: Option<&Attributes>,
        depth: u8,
    ) -> Option<String> {
        if depth >= MAX_DEPENDENCY_DEPTH {
            log::warn!(target: "splitio", "dependency matcher recursion limit reached at flag {split}");
            return None;
        }
        Some(
            self.evaluate_with_depth(split, key, attributes, depth + 1)
                .treatment,
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::storage::{InMemorySegmentStorage, InMemorySplitStorage, SplitStorage};

    fn storage_with(splits: Vec<serde_json::Value>) -> InMemorySplitStorage {
        let storage = InMemorySplitStorage::new();
        let parsed = splits
            .into_iter()
            .map(|value| serde_json::from_value(value).unwrap())
            .collect();
        storage.apply(parsed, &[], 1675443537882);
        storage
    }

    fn whitelist_flag(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "seed": 1234,
            "defaultTreatment": "off",
            "changeNumber": 1675443537882i64,
            "algo": 2,
            "conditions": [
                {
                    "conditionType": "WHITELIST",
                    "label": "whitelisted alice",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{
                            "matcherType": "WHITELIST",
                            "negate": false,
                            "whitelistMatcherData": {"whitelist": ["alice"]}
                        }]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                },
                {
                    "conditionType": "ROLLOUT",
                    "label": "default rule",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]
                    },
                    "partitions": [{"treatment": "off", "size": 100}]
                }
            ]
        })
    }

    fn evaluate(storage: &InMemorySplitStorage, feature: &str, key: &str) -> Evaluation {
        let segments = InMemorySegmentStorage::new();
        let large_segments = InMemorySegmentStorage::new();
        let snapshot = storage.snapshot();
        Evaluator::new(&snapshot, &segments, &large_segments).evaluate(
            feature,
            &Key::new(key),
            None,
        )
    }

    #[test]
    fn whitelist_wins_over_percentage() {
        let _ = env_logger::builder().is_test(true).try_init();
        let storage = storage_with(vec![whitelist_flag("F")]);

        let alice = evaluate(&storage, "F", "alice");
        assert_eq!(alice.treatment, "on");
        assert_eq!(alice.label, "whitelisted alice");
        assert!(alice.track);

        let bob = evaluate(&storage, "F", "bob");
        assert_eq!(bob.treatment, "off");
        assert_eq!(bob.label, "default rule");
    }

    #[test]
    fn unknown_feature_returns_control_without_impression() {
        let storage = storage_with(vec![]);
        let result = evaluate(&storage, "missing", "alice");
        assert_eq!(result.treatment, CONTROL);
        assert_eq!(result.label, labels::DEFINITION_NOT_FOUND);
        assert_eq!(result.change_number, -1);
        assert!(!result.track);
    }

    #[test]
    fn killed_flag_returns_default_treatment() {
        let mut flag = whitelist_flag("F");
        flag["killed"] = json!(true);
        let storage = storage_with(vec![flag]);

        let result = evaluate(&storage, "F", "alice");
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::KILLED);
        assert_eq!(result.change_number, 1675443537882);
    }

    #[test]
    fn traffic_allocation_gates_rollout_conditions() {
        let flag = json!({
            "name": "F",
            "seed": 1234,
            "defaultTreatment": "off",
            "changeNumber": 10,
            "algo": 2,
            "trafficAllocation": 1,
            "trafficAllocationSeed": -1667452163,
            "conditions": [{
                "conditionType": "ROLLOUT",
                "label": "in segment all",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]
                },
                "partitions": [{"treatment": "on", "size": 100}]
            }]
        });
        let storage = storage_with(vec![flag]);

        // "aaaaa" lands in bucket 30 for this seed: outside a 1% allocation.
        let excluded = evaluate(&storage, "F", "aaaaa");
        assert_eq!(excluded.treatment, "off");
        assert_eq!(excluded.label, labels::NOT_IN_SPLIT);

        // "bob" lands in bucket 1: inside the allocation.
        let included = evaluate(&storage, "F", "bob");
        assert_eq!(included.treatment, "on");
        assert_eq!(included.label, "in segment all");
    }

    #[test]
    fn whitelist_conditions_bypass_traffic_allocation() {
        let mut flag = whitelist_flag("F");
        flag["trafficAllocation"] = json!(0);
        flag["trafficAllocationSeed"] = json!(-1667452163);
        let storage = storage_with(vec![flag]);

        // Whitelisted key matches even with zero allocation.
        let alice = evaluate(&storage, "F", "alice");
        assert_eq!(alice.treatment, "on");

        // Everyone else hits the allocation gate at the rollout condition.
        let bob = evaluate(&storage, "F", "bob");
        assert_eq!(bob.treatment, "off");
        assert_eq!(bob.label, labels::NOT_IN_SPLIT);
    }

    #[test]
    fn dependency_matcher_follows_parent_evaluation() {
        let parent = whitelist_flag("F1");
        let child = json!({
            "name": "F2",
            "seed": 99,
            "defaultTreatment": "red",
            "changeNumber": 11,
            "algo": 2,
            "conditions": [{
                "conditionType": "WHITELIST",
                "label": "parent is on",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "IN_SPLIT_TREATMENT",
                        "negate": false,
                        "dependencyMatcherData": {"split": "F1", "treatments": ["on"]}
                    }]
                },
                "partitions": [{"treatment": "blue", "size": 100}]
            }]
        });
        let storage = storage_with(vec![parent, child]);

        let alice = evaluate(&storage, "F2", "alice");
        assert_eq!(alice.treatment, "blue");
        assert_eq!(alice.label, "parent is on");

        let bob = evaluate(&storage, "F2", "bob");
        assert_eq!(bob.treatment, "red");
        assert_eq!(bob.label, labels::DEFAULT_RULE);
    }

    #[test]
    fn dependency_cycles_are_cut_by_the_recursion_bound() {
        let looping = |name: &str, other: &str| {
            json!({
                "name": name,
                "seed": 1,
                "defaultTreatment": "off",
                "changeNumber": 1,
                "algo": 2,
                "conditions": [{
                    "conditionType": "WHITELIST",
                    "label": "depends",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{
                            "matcherType": "IN_SPLIT_TREATMENT",
                            "negate": false,
                            "dependencyMatcherData": {"split": other, "treatments": ["on"]}
                        }]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }]
            })
        };
        let storage = storage_with(vec![looping("A", "B"), looping("B", "A")]);

        // Must terminate; the exceeded bound fails the matcher so the
        // default rule applies.
        let result = evaluate(&storage, "A", "alice");
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::DEFAULT_RULE);
    }

    #[test]
    fn unsupported_matcher_degrades_whole_flag() {
        let flag = json!({
            "name": "F",
            "seed": 1,
            "defaultTreatment": "off",
            "changeNumber": 5,
            "algo": 2,
            "conditions": [
                {
                    "conditionType": "WHITELIST",
                    "label": "future",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "BRAND_NEW_MATCHER", "negate": false}]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                },
                {
                    "conditionType": "ROLLOUT",
                    "label": "default rule",
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]
                    },
                    "partitions": [{"treatment": "on", "size": 100}]
                }
            ]
        });
        let storage = storage_with(vec![flag]);

        let result = evaluate(&storage, "F", "alice");
        assert_eq!(result.treatment, "off");
        assert_eq!(result.label, labels::UNSUPPORTED_MATCHER);
    }

    #[test]
    fn configuration_payload_follows_the_returned_treatment() {
        let mut flag = whitelist_flag("F");
        flag["configurations"] = json!({"on": "{\"color\":\"blue\"}"});
        let storage = storage_with(vec![flag]);

        let alice = evaluate(&storage, "F", "alice");
        assert_eq!(alice.configuration.as_deref(), Some("{\"color\":\"blue\"}"));

        let bob = evaluate(&storage, "F", "bob");
        assert_eq!(bob.configuration, None);
    }

    #[test]
    fn in_segment_matcher_reads_segment_storage() {
        let flag = json!({
            "name": "F",
            "seed": 1,
            "defaultTreatment": "off",
            "changeNumber": 5,
            "algo": 2,
            "conditions": [{
                "conditionType": "ROLLOUT",
                "label": "in segment employees",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{
                        "matcherType": "IN_SEGMENT",
                        "negate": false,
                        "userDefinedSegmentMatcherData": {"segmentName": "employees"}
                    }]
                },
                "partitions": [{"treatment": "on", "size": 100}]
            }]
        });
        let storage = storage_with(vec![flag]);
        let segments = InMemorySegmentStorage::new();
        segments.update("employees", &["alice".to_owned()], &[], 3);
        let large_segments = InMemorySegmentStorage::new();
        let snapshot = storage.snapshot();
        let evaluator = Evaluator::new(&snapshot, &segments, &large_segments);

        let alice = evaluator.evaluate("F", &Key::new("alice"), None);
        assert_eq!(alice.treatment, "on");
        assert_eq!(alice.label, "in segment employees");

        let bob = evaluator.evaluate("F", &Key::new("bob"), None);
        assert_eq!(bob.treatment, "off");
    }

    #[test]
    fn bucketing_key_drives_hashing_but_not_matching() {
        let flag = whitelist_flag("F");
        let storage = storage_with(vec![flag]);
        let segments = InMemorySegmentStorage::new();
        let large = InMemorySegmentStorage::new();
        let snapshot = storage.snapshot();
        let evaluator = Evaluator::new(&snapshot, &segments, &large);

        // Whitelist matching uses the matching key, regardless of the
        // bucketing key.
        let result = evaluator.evaluate(
            "F",
            &Key::with_bucketing_key("alice", "some-other-bucket"),
            None,
        );
        assert_eq!(result.treatment, "on");
    }
}
