use std::collections::{HashMap, HashSet};

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::hashing::HashAlgorithm;

/// Monotonic 64-bit version of a feed (the flag feed or one segment).
pub type ChangeNumber = i64;

/// `TryParse` allows a subfield to fail parsing without failing the parsing
/// of the whole structure.
///
/// If one flag in a `splitChanges` payload uses a format this SDK doesn't
/// understand, the rest of the flags are still usable.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Response of the `splitChanges` endpoint.
///
/// The backend has served two envelopes over time: the current one nests the
/// flag feed under `ff`, the legacy one is flat. Both are accepted and
/// normalized into [`SplitChanges`].
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum SplitChangesResponse {
    Envelope { ff: FeatureFlagChanges },
    Legacy(SplitChanges),
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeatureFlagChanges {
    #[serde(default)]
    pub d: Vec<TryParse<Split>>,
    pub s: ChangeNumber,
    pub t: ChangeNumber,
}

/// A normalized flag-feed delta: definitions changed since `since`, valid up
/// to `till`.
#[derive(Debug, Deserialize, Clone)]
pub struct SplitChanges {
    #[serde(default)]
    pub splits: Vec<TryParse<Split>>,
    pub since: ChangeNumber,
    pub till: ChangeNumber,
}

impl SplitChangesResponse {
    pub fn into_changes(self) -> SplitChanges {
        match self {
            SplitChangesResponse::Envelope { ff } => SplitChanges {
                splits: ff.d,
                since: ff.s,
                till: ff.t,
            },
            SplitChangesResponse::Legacy(changes) => changes,
        }
    }
}

/// Status of a flag definition. Anything the SDK doesn't recognize is
/// treated as archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Active,
    Archived,
    #[serde(other)]
    Unknown,
}

impl Default for Status {
    fn default() -> Status {
        Status::Active
    }
}

/// A feature flag definition as served by the `splitChanges` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub killed: bool,
    pub default_treatment: String,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    #[serde(default)]
    pub status: Status,
    pub change_number: ChangeNumber,
    #[serde(default)]
    pub algo: HashAlgorithm,
    #[serde(default)]
    pub traffic_allocation: Option<i64>,
    #[serde(default)]
    pub traffic_allocation_seed: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub configurations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub sets: Vec<String>,
}

impl Split {
    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    /// Traffic-allocation percentage normalized to 0..=100. Absent or
    /// out-of-range values mean the whole traffic is allocated.
    pub fn traffic_allocation(&self) -> i64 {
        match self.traffic_allocation {
            Some(v) if (0..=100).contains(&v) => v,
            _ => 100,
        }
    }

    pub fn configuration_for(&self, treatment: &str) -> Option<&str> {
        self.configurations
            .as_ref()
            .and_then(|configs| configs.get(treatment))
            .map(String::as_str)
    }

    /// Names of all segments referenced by this flag's matchers.
    pub fn segment_names(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .flat_map(|condition| condition.matcher_group.matchers.iter())
            .filter_map(|matcher| match &matcher.kind {
                MatcherKind::InSegment(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether any condition carries a matcher this SDK cannot evaluate.
    pub fn uses_unsupported_matcher(&self) -> bool {
        self.conditions
            .iter()
            .flat_map(|condition| condition.matcher_group.matchers.iter())
            .any(|matcher| matches!(matcher.kind, MatcherKind::Unsupported(_)))
    }

    /// The set of treatments reachable through this flag's partitions.
    pub fn treatments(&self) -> HashSet<&str> {
        let mut treatments: HashSet<&str> = self
            .conditions
            .iter()
            .flat_map(|condition| condition.partitions.iter())
            .map(|partition| partition.treatment.as_str())
            .collect();
        treatments.insert(self.default_treatment.as_str());
        treatments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    Whitelist,
    Rollout,
}

impl Default for ConditionType {
    fn default() -> ConditionType {
        ConditionType::Whitelist
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub condition_type: ConditionType,
    pub matcher_group: MatcherGroup,
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub label: String,
}

/// The only combiner the backend emits is AND; it is still carried on the
/// wire so it is parsed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Combiner {
    And,
}

impl Default for Combiner {
    fn default() -> Combiner {
        Combiner::And
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: Combiner,
    pub matchers: Vec<Matcher>,
}

/// A (treatment, weight) pair. Weights in a condition sum to 100.
#[derive(Debug, Clone, Deserialize)]
pub struct Partition {
    pub treatment: String,
    pub size: i64,
}

/// A single predicate inside a condition, compiled from its wire form at
/// parse time so regexes and semvers are built once.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawMatcher")]
pub struct Matcher {
    pub negate: bool,
    /// Attribute the matcher reads. `None` means the matching key itself.
    pub attribute: Option<String>,
    pub kind: MatcherKind,
}

/// Numeric matchers carry a data type that decides how values are compared:
/// plain numbers, or datetimes truncated to minute boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Number,
    Datetime,
}

impl DataType {
    /// Normalize a raw value for comparison. Datetimes are epoch millis
    /// truncated to the minute.
    pub fn normalize(&self, value: i64) -> i64 {
        match self {
            DataType::Number => value,
            DataType::Datetime => value - value.rem_euclid(60_000),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MatcherKind {
    AllKeys,
    InSegment(String),
    InLargeSegment(String),
    Whitelist(HashSet<String>),
    EqualTo { data_type: DataType, value: i64 },
    GreaterThanOrEqualTo { data_type: DataType, value: i64 },
    LessThanOrEqualTo { data_type: DataType, value: i64 },
    Between { data_type: DataType, start: i64, end: i64 },
    EqualToSet(HashSet<String>),
    PartOfSet(HashSet<String>),
    ContainsAllOfSet(HashSet<String>),
    ContainsAnyOfSet(HashSet<String>),
    StartsWith(Vec<String>),
    EndsWith(Vec<String>),
    ContainsString(Vec<String>),
    /// `None` when the pattern failed to compile; such a matcher never
    /// matches.
    MatchesString(Option<Regex>),
    EqualToBoolean(bool),
    InSplitTreatment { split: String, treatments: Vec<String> },
    EqualToSemver(Option<Version>),
    GreaterThanOrEqualToSemver(Option<Version>),
    LessThanOrEqualToSemver(Option<Version>),
    BetweenSemver(Option<(Version, Version)>),
    InListSemver(Vec<Version>),
    /// A matcher type this SDK doesn't know. Flags carrying one degrade to
    /// their default treatment.
    Unsupported(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMatcher {
    matcher_type: String,
    #[serde(default)]
    negate: bool,
    #[serde(default)]
    key_selector: Option<KeySelector>,
    #[serde(default)]
    user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(default)]
    user_defined_large_segment_matcher_data: Option<LargeSegmentMatcherData>,
    #[serde(default)]
    whitelist_matcher_data: Option<WhitelistMatcherData>,
    #[serde(default)]
    unary_numeric_matcher_data: Option<UnaryNumericMatcherData>,
    #[serde(default)]
    between_matcher_data: Option<BetweenMatcherData>,
    #[serde(default)]
    between_string_matcher_data: Option<BetweenStringMatcherData>,
    #[serde(default)]
    string_matcher_data: Option<String>,
    #[serde(default)]
    boolean_matcher_data: Option<bool>,
    #[serde(default)]
    dependency_matcher_data: Option<DependencyMatcherData>,
}

#[derive(Debug, Deserialize)]
struct KeySelector {
    #[serde(default)]
    attribute: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentMatcherData {
    segment_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LargeSegmentMatcherData {
    large_segment_name: String,
}

#[derive(Debug, Deserialize)]
struct WhitelistMatcherData {
    #[serde(default)]
    whitelist: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnaryNumericMatcherData {
    data_type: DataType,
    value: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetweenMatcherData {
    data_type: DataType,
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct BetweenStringMatcherData {
    start: String,
    end: String,
}

#[derive(Debug, Deserialize)]
struct DependencyMatcherData {
    split: String,
    #[serde(default)]
    treatments: Vec<String>,
}

impl From<RawMatcher> for Matcher {
    fn from(raw: RawMatcher) -> Matcher {
        let attribute = raw.key_selector.as_ref().and_then(|ks| ks.attribute.clone());
        let kind = build_kind(&raw);
        Matcher {
            negate: raw.negate,
            attribute,
            kind,
        }
    }
}

fn build_kind(raw: &RawMatcher) -> MatcherKind {
    let unsupported = || MatcherKind::Unsupported(raw.matcher_type.clone());
    let whitelist = |raw: &RawMatcher| {
        raw.whitelist_matcher_data
            .as_ref()
            .map(|data| data.whitelist.clone())
    };
    let whitelist_set = |raw: &RawMatcher| {
        whitelist(raw).map(|list| list.into_iter().collect::<HashSet<_>>())
    };

    match raw.matcher_type.as_str() {
        "ALL_KEYS" => MatcherKind::AllKeys,
        "IN_SEGMENT" => match &raw.user_defined_segment_matcher_data {
            Some(data) => MatcherKind::InSegment(data.segment_name.clone()),
            None => unsupported(),
        },
        "IN_LARGE_SEGMENT" => match &raw.user_defined_large_segment_matcher_data {
            Some(data) => MatcherKind::InLargeSegment(data.large_segment_name.clone()),
            None => unsupported(),
        },
        "WHITELIST" => match whitelist_set(raw) {
            Some(set) => MatcherKind::Whitelist(set),
            None => unsupported(),
        },
        "EQUAL_TO" => match &raw.unary_numeric_matcher_data {
            Some(data) => MatcherKind::EqualTo {
                data_type: data.data_type,
                value: data.data_type.normalize(data.value),
            },
            None => unsupported(),
        },
        "GREATER_THAN_OR_EQUAL_TO" => match &raw.unary_numeric_matcher_data {
            Some(data) => MatcherKind::GreaterThanOrEqualTo {
                data_type: data.data_type,
                value: data.data_type.normalize(data.value),
            },
            None => unsupported(),
        },
        "LESS_THAN_OR_EQUAL_TO" => match &raw.unary_numeric_matcher_data {
            Some(data) => MatcherKind::LessThanOrEqualTo {
                data_type: data.data_type,
                value: data.data_type.normalize(data.value),
            },
            None => unsupported(),
        },
        "BETWEEN" => match &raw.between_matcher_data {
            Some(data) => MatcherKind::Between {
                data_type: data.data_type,
                start: data.data_type.normalize(data.start),
                end: data.data_type.normalize(data.end),
            },
            None => unsupported(),
        },
        "EQUAL_TO_SET" => match whitelist_set(raw) {
            Some(set) => MatcherKind::EqualToSet(set),
            None => unsupported(),
        },
        "PART_OF_SET" => match whitelist_set(raw) {
            Some(set) => MatcherKind::PartOfSet(set),
            None => unsupported(),
        },
        "CONTAINS_ALL_OF_SET" => match whitelist_set(raw) {
            Some(set) => MatcherKind::ContainsAllOfSet(set),
            None => unsupported(),
        },
        "CONTAINS_ANY_OF_SET" => match whitelist_set(raw) {
            Some(set) => MatcherKind::ContainsAnyOfSet(set),
            None => unsupported(),
        },
        "STARTS_WITH" => match whitelist(raw) {
            Some(list) => MatcherKind::StartsWith(list),
            None => unsupported(),
        },
        "ENDS_WITH" => match whitelist(raw) {
            Some(list) => MatcherKind::EndsWith(list),
            None => unsupported(),
        },
        "CONTAINS_STRING" => match whitelist(raw) {
            Some(list) => MatcherKind::ContainsString(list),
            None => unsupported(),
        },
        "MATCHES_STRING" => match &raw.string_matcher_data {
            Some(pattern) => {
                let regex = Regex::new(pattern);
                if regex.is_err() {
                    log::warn!(target: "splitio", "invalid regex in MATCHES_STRING matcher: {pattern:?}");
                }
                MatcherKind::MatchesString(regex.ok())
            }
            None => unsupported(),
        },
        "EQUAL_TO_BOOLEAN" => match raw.boolean_matcher_data {
            Some(value) => MatcherKind::EqualToBoolean(value),
            None => unsupported(),
        },
        "IN_SPLIT_TREATMENT" => match &raw.dependency_matcher_data {
            Some(data) => MatcherKind::InSplitTreatment {
                split: data.split.clone(),
                treatments: data.treatments.clone(),
            },
            None => unsupported(),
        },
        "EQUAL_TO_SEMVER" => match &raw.string_matcher_data {
            Some(version) => MatcherKind::EqualToSemver(parse_semver(version)),
            None => unsupported(),
        },
        "GREATER_THAN_OR_EQUAL_TO_SEMVER" => match &raw.string_matcher_data {
            Some(version) => MatcherKind::GreaterThanOrEqualToSemver(parse_semver(version)),
            None => unsupported(),
        },
        "LESS_THAN_OR_EQUAL_TO_SEMVER" => match &raw.string_matcher_data {
            Some(version) => MatcherKind::LessThanOrEqualToSemver(parse_semver(version)),
            None => unsupported(),
        },
        "BETWEEN_SEMVER" => match &raw.between_string_matcher_data {
            Some(data) => MatcherKind::BetweenSemver(
                parse_semver(&data.start).zip(parse_semver(&data.end)),
            ),
            None => unsupported(),
        },
        "IN_LIST_SEMVER" => match whitelist(raw) {
            Some(list) => MatcherKind::InListSemver(
                list.iter().filter_map(|v| parse_semver(v)).collect(),
            ),
            None => unsupported(),
        },
        _ => unsupported(),
    }
}

pub(crate) fn parse_semver(version: &str) -> Option<Version> {
    match Version::parse(version.trim()) {
        Ok(version) => Some(version),
        Err(_) => {
            log::warn!(target: "splitio", "unable to parse semver literal: {version:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_and_legacy_formats() {
        let envelope: SplitChangesResponse = serde_json::from_str(
            r#"{"ff": {"d": [], "s": -1, "t": 1675443537882}}"#,
        )
        .unwrap();
        let changes = envelope.into_changes();
        assert_eq!(changes.since, -1);
        assert_eq!(changes.till, 1675443537882);

        let legacy: SplitChangesResponse = serde_json::from_str(
            r#"{"splits": [], "since": 5, "till": 10}"#,
        )
        .unwrap();
        let changes = legacy.into_changes();
        assert_eq!(changes.since, 5);
        assert_eq!(changes.till, 10);
    }

    #[test]
    fn parses_full_split_definition() {
        let split: Split = serde_json::from_str(
            r#"{
                "name": "new_ui",
                "seed": -1222652054,
                "killed": false,
                "defaultTreatment": "off",
                "trafficTypeName": "user",
                "status": "ACTIVE",
                "changeNumber": 1675443537882,
                "algo": 2,
                "trafficAllocation": 100,
                "trafficAllocationSeed": -1667452163,
                "sets": ["frontend"],
                "configurations": {"on": "{\"color\": \"blue\"}"},
                "conditions": [
                    {
                        "conditionType": "WHITELIST",
                        "label": "whitelisted",
                        "matcherGroup": {
                            "combiner": "AND",
                            "matchers": [
                                {
                                    "matcherType": "WHITELIST",
                                    "negate": false,
                                    "whitelistMatcherData": {"whitelist": ["alice"]}
                                }
                            ]
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
                        "partitions": [
                            {"treatment": "on", "size": 50},
                            {"treatment": "off", "size": 50}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(split.name, "new_ui");
        assert_eq!(split.algo, HashAlgorithm::Murmur3);
        assert_eq!(split.traffic_allocation(), 100);
        assert_eq!(split.conditions.len(), 2);
        assert_eq!(split.configuration_for("on"), Some("{\"color\": \"blue\"}"));
        assert!(matches!(
            split.conditions[0].matcher_group.matchers[0].kind,
            MatcherKind::Whitelist(_)
        ));
        assert!(split.treatments().contains("on"));
        assert!(!split.uses_unsupported_matcher());
    }

    #[test]
    fn unknown_matcher_type_parses_as_unsupported() {
        let split: Split = serde_json::from_str(
            r#"{
                "name": "f",
                "defaultTreatment": "off",
                "changeNumber": 1,
                "conditions": [{
                    "matcherGroup": {
                        "combiner": "AND",
                        "matchers": [{"matcherType": "SOME_FUTURE_MATCHER", "negate": false}]
                    },
                    "partitions": [{"treatment": "on", "size": 100}],
                    "label": "future"
                }]
            }"#,
        )
        .unwrap();
        assert!(split.uses_unsupported_matcher());
    }

    #[test]
    fn malformed_split_is_isolated_by_try_parse() {
        let changes: SplitChangesResponse = serde_json::from_str(
            r#"{
                "splits": [
                    {"name": "ok", "defaultTreatment": "off", "changeNumber": 2},
                    {"name": "broken", "changeNumber": "not-a-number"}
                ],
                "since": -1,
                "till": 2
            }"#,
        )
        .unwrap();
        let changes = changes.into_changes();
        assert!(matches!(changes.splits[0], TryParse::Parsed(_)));
        assert!(matches!(changes.splits[1], TryParse::ParseFailed(_)));
    }

    #[test]
    fn unknown_status_is_not_active() {
        let split: Split = serde_json::from_str(
            r#"{"name": "f", "defaultTreatment": "off", "changeNumber": 1, "status": "FROZEN"}"#,
        )
        .unwrap();
        assert!(!split.is_active());
    }

    #[test]
    fn datetime_literals_truncate_to_minute() {
        assert_eq!(DataType::Datetime.normalize(1675443537882), 1675443480000);
        assert_eq!(DataType::Number.normalize(1675443537882), 1675443537882);
    }

    #[test]
    fn out_of_range_traffic_allocation_is_clamped() {
        let split: Split = serde_json::from_str(
            r#"{"name": "f", "defaultTreatment": "off", "changeNumber": 1, "trafficAllocation": 250}"#,
        )
        .unwrap();
        assert_eq!(split.traffic_allocation(), 100);
    }
}
