//! Input validation for the public API. Invalid inputs never throw; they
//! degrade to `control` outcomes (or a `false` return from `track`) with a
//! log line explaining what was wrong.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use splitio_core::Key;

pub const MAX_KEY_LENGTH: usize = 250;
pub const MAX_PROPERTIES: usize = 300;
pub const MAX_PROPERTIES_BYTES: usize = 32 * 1024;

static EVENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][-_.:a-zA-Z0-9]{0,79}$")
        .expect("the event-type pattern is a valid regex")
});

static FLAG_SET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9][_a-z0-9]{0,49}$").expect("the flag-set pattern is a valid regex")
});

pub fn validate_key(key: &Key, method: &str) -> bool {
    if key.matching_key().is_empty() {
        log::error!(target: "splitio", "{method}: you passed an empty key, key must be a non-empty string");
        return false;
    }
    if key.matching_key().len() > MAX_KEY_LENGTH {
        log::error!(target: "splitio", "{method}: key too long - must be {MAX_KEY_LENGTH} characters or less");
        return false;
    }
    if let Some(bucketing) = key.explicit_bucketing_key() {
        if bucketing.is_empty() || bucketing.len() > MAX_KEY_LENGTH {
            log::error!(target: "splitio", "{method}: bucketing key must be a non-empty string of at most {MAX_KEY_LENGTH} characters");
            return false;
        }
    }
    true
}

pub fn validate_feature_name(feature: &str, method: &str) -> bool {
    if feature.trim().is_empty() {
        log::error!(target: "splitio", "{method}: you passed an empty feature flag name, flag name must be a non-empty string");
        return false;
    }
    if feature.trim() != feature {
        log::warn!(target: "splitio", "{method}: feature flag name {feature:?} has extra whitespace, trimming");
    }
    true
}

/// Lowercase, trim, and drop flag-set names that don't fit the backend's
/// naming rules. Returns a sorted, deduplicated list.
pub fn sanitize_flag_sets(sets: &[String], method: &str) -> Vec<String> {
    let mut sanitized: Vec<String> = sets
        .iter()
        .filter_map(|set| {
            let candidate = set.trim().to_lowercase();
            if FLAG_SET_RE.is_match(&candidate) {
                Some(candidate)
            } else {
                log::warn!(target: "splitio", "{method}: you passed {set:?}, flag set must adhere to the regular expression {}", FLAG_SET_RE.as_str());
                None
            }
        })
        .collect();
    sanitized.sort();
    sanitized.dedup();
    sanitized
}

pub fn validate_event_type(event_type: &str) -> bool {
    if EVENT_TYPE_RE.is_match(event_type) {
        return true;
    }
    log::error!(
        target: "splitio",
        "track: you passed {event_type:?}, event_type must adhere to the regular expression {}",
        EVENT_TYPE_RE.as_str(),
    );
    false
}

pub fn validate_traffic_type(traffic_type: &str) -> Option<String> {
    if traffic_type.trim().is_empty() {
        log::error!(target: "splitio", "track: you passed an empty traffic_type, traffic_type must be a non-empty string");
        return None;
    }
    let lowercase = traffic_type.to_lowercase();
    if lowercase != traffic_type {
        log::warn!(target: "splitio", "track: {traffic_type} should be all lowercase - converting to lowercase");
    }
    Some(lowercase)
}

/// Validate event properties: entry count, serialized size, and value
/// types. Properties with unsupported value types are dropped; an oversized
/// map rejects the whole call.
pub fn validate_properties(
    properties: HashMap<String, serde_json::Value>,
) -> Option<HashMap<String, serde_json::Value>> {
    if properties.len() > MAX_PROPERTIES {
        log::error!(
            target: "splitio",
            "track: event cannot have more than {MAX_PROPERTIES} properties",
        );
        return None;
    }

    let filtered: HashMap<String, serde_json::Value> = properties
        .into_iter()
        .filter(|(name, value)| {
            let allowed = matches!(
                value,
                serde_json::Value::String(_)
                    | serde_json::Value::Number(_)
                    | serde_json::Value::Bool(_)
                    | serde_json::Value::Null
            );
            if !allowed {
                log::warn!(target: "splitio", "track: property {name:?} is of an unsupported type, dropping");
            }
            allowed
        })
        .collect();

    let size: usize = filtered
        .iter()
        .map(|(name, value)| name.len() + value.to_string().len())
        .sum();
    if size > MAX_PROPERTIES_BYTES {
        log::error!(
            target: "splitio",
            "track: the maximum size allowed for the properties is 32768 bytes, event not queued",
        );
        return None;
    }

    Some(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_must_be_non_empty_and_bounded() {
        assert!(validate_key(&Key::new("alice"), "get_treatment"));
        assert!(!validate_key(&Key::new(""), "get_treatment"));
        assert!(!validate_key(&Key::new("a".repeat(251)), "get_treatment"));
        assert!(!validate_key(
            &Key::with_bucketing_key("alice", ""),
            "get_treatment"
        ));
        assert!(validate_key(
            &Key::with_bucketing_key("alice", "bucket"),
            "get_treatment"
        ));
    }

    #[test]
    fn event_types_follow_the_pattern() {
        assert!(validate_event_type("page.view"));
        assert!(validate_event_type("checkout:completed-1"));
        assert!(!validate_event_type(""));
        assert!(!validate_event_type(".starts-with-dot"));
        assert!(!validate_event_type(&"x".repeat(81)));
        assert!(!validate_event_type("has spaces"));
    }

    #[test]
    fn traffic_types_are_lowercased() {
        assert_eq!(validate_traffic_type("User"), Some("user".to_owned()));
        assert_eq!(validate_traffic_type("account"), Some("account".to_owned()));
        assert_eq!(validate_traffic_type("  "), None);
    }

    #[test]
    fn flag_sets_are_sanitized() {
        let sets = vec![
            " Backend ".to_owned(),
            "backend".to_owned(),
            "front end!".to_owned(),
            "ops_1".to_owned(),
        ];
        assert_eq!(
            sanitize_flag_sets(&sets, "get_treatments_by_flag_sets"),
            vec!["backend".to_owned(), "ops_1".to_owned()]
        );
    }

    #[test]
    fn properties_drop_bad_types_and_bound_total_size() {
        let properties = HashMap::from([
            ("plan".to_owned(), json!("gold")),
            ("visits".to_owned(), json!(7)),
            ("nested".to_owned(), json!({"not": "allowed"})),
        ]);
        let validated = validate_properties(properties).unwrap();
        assert_eq!(validated.len(), 2);
        assert!(!validated.contains_key("nested"));

        let oversized =
            HashMap::from([("blob".to_owned(), json!("x".repeat(MAX_PROPERTIES_BYTES)))]);
        assert!(validate_properties(oversized).is_none());

        let too_many: HashMap<String, serde_json::Value> = (0..=MAX_PROPERTIES)
            .map(|i| (format!("p{i}"), json!(1)))
            .collect();
        assert!(validate_properties(too_many).is_none());
    }
}
