//! Segment definitions: named sets of keys with a change-number, plus the
//! `segmentChanges` wire shape.
use std::collections::HashSet;

use serde::Deserialize;

use crate::splits::ChangeNumber;

/// A segment: a named set of member keys. Membership lookup is O(1).
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub name: String,
    pub keys: HashSet<String>,
    pub change_number: ChangeNumber,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Segment {
        Segment {
            name: name.into(),
            keys: HashSet::new(),
            change_number: -1,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Apply a delta. Removals win over additions carrying the same key,
    /// matching the backend's ordering.
    pub fn update(&mut self, added: &[String], removed: &[String], change_number: ChangeNumber) {
        for key in added {
            self.keys.insert(key.clone());
        }
        for key in removed {
            self.keys.remove(key);
        }
        if change_number > self.change_number {
            self.change_number = change_number;
        }
    }
}

/// Response of the `segmentChanges/{name}` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: ChangeNumber,
    pub till: ChangeNumber,
}
