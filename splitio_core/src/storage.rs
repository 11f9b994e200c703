//! Thread-safe in-memory storage for flags and segments.
//!
//! Flag definitions live in an immutable snapshot behind an `RwLock`; readers
//! grab an `Arc` to the current snapshot (one lock acquisition per
//! evaluation, shared across a whole multi-flag call) and writers replace the
//! snapshot wholesale. Segments are mutated in place under their own lock
//! since member sets can be large.
//!
//! The [`SplitStorage`] / [`SegmentStorage`] traits document the storage
//! seam: an external adapter (e.g. Redis-backed, populated by a standalone
//! synchronizer) implements the same surface with reads going to the
//! external store under a configurable key prefix.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::segments::Segment;
use crate::splits::{ChangeNumber, Split};

/// Read surface the evaluator and manager need from a flag store.
pub trait SplitStorage: Send + Sync {
    /// A coherent view of all flag definitions, valid for one evaluation.
    fn snapshot(&self) -> Arc<SplitsSnapshot>;

    fn change_number(&self) -> ChangeNumber;
}

/// Read surface matchers need from a segment store.
pub trait SegmentStorage: Send + Sync {
    fn contains(&self, segment: &str, key: &str) -> bool;

    fn change_number(&self, segment: &str) -> Option<ChangeNumber>;
}

/// An immutable view of the flag feed at one change-number.
#[derive(Debug, Clone)]
pub struct SplitsSnapshot {
    splits: HashMap<String, Arc<Split>>,
    flag_sets: HashMap<String, HashSet<String>>,
    change_number: ChangeNumber,
}

impl Default for SplitsSnapshot {
    fn default() -> SplitsSnapshot {
        SplitsSnapshot {
            splits: HashMap::new(),
            flag_sets: HashMap::new(),
            // -1 is the "never synced" change-number the backend expects as
            // the first `since` value.
            change_number: -1,
        }
    }
}

impl SplitsSnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<Split>> {
        self.splits.get(name)
    }

    pub fn change_number(&self) -> ChangeNumber {
        self.change_number
    }

    pub fn split_names(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }

    pub fn splits(&self) -> impl Iterator<Item = &Arc<Split>> {
        self.splits.values()
    }

    /// Flag names tagged with the given flag set.
    pub fn flag_set(&self, set: &str) -> Vec<String> {
        self.flag_sets
            .get(set)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}

/// In-memory authoritative cache for flag definitions.
#[derive(Default)]
pub struct InMemorySplitStorage {
    snapshot: RwLock<Arc<SplitsSnapshot>>,
}

impl InMemorySplitStorage {
    pub fn new() -> InMemorySplitStorage {
        InMemorySplitStorage::default()
    }

    /// A coherent view of all flag definitions, valid for one evaluation.
    pub fn snapshot(&self) -> Arc<SplitsSnapshot> {
        Arc::clone(
            &self
                .snapshot
                .read()
                .expect("thread holding splits lock should not panic"),
        )
    }

    pub fn change_number(&self) -> ChangeNumber {
        self.snapshot().change_number
    }

    /// Apply one feed delta transactionally: archived definitions are
    /// removed, active ones upserted, the flag-set index kept symmetric, and
    /// the feed change-number advanced. A delta older than the stored
    /// change-number is ignored, which makes replayed applies idempotent.
    pub fn apply(&self, upserts: Vec<Split>, removals: &[String], till: ChangeNumber) {
        let mut guard = self
            .snapshot
            .write()
            .expect("thread holding splits lock should not panic");

        if till < guard.change_number {
            return;
        }

        let mut next = (**guard).clone();
        for name in removals {
            if next.splits.remove(name).is_some() {
                detach_from_sets(&mut next.flag_sets, name);
            }
        }
        for split in upserts {
            detach_from_sets(&mut next.flag_sets, &split.name);
            for set in &split.sets {
                next.flag_sets
                    .entry(set.clone())
                    .or_default()
                    .insert(split.name.clone());
            }
            next.splits.insert(split.name.clone(), Arc::new(split));
        }
        next.change_number = till;

        *guard = Arc::new(next);
    }

    /// Mark a flag killed locally, as instructed by a kill notification.
    /// No-op when the flag is unknown or the notification is stale.
    pub fn kill_locally(
        &self,
        name: &str,
        default_treatment: &str,
        change_number: ChangeNumber,
    ) {
        let mut guard = self
            .snapshot
            .write()
            .expect("thread holding splits lock should not panic");

        let Some(existing) = guard.splits.get(name) else {
            return;
        };
        if change_number <= existing.change_number {
            return;
        }

        let mut split = (**existing).clone();
        split.killed = true;
        split.default_treatment = default_treatment.to_owned();
        split.change_number = change_number;

        let mut next = (**guard).clone();
        next.splits.insert(name.to_owned(), Arc::new(split));
        *guard = Arc::new(next);
    }
}

impl SplitStorage for InMemorySplitStorage {
    fn snapshot(&self) -> Arc<SplitsSnapshot> {
        InMemorySplitStorage::snapshot(self)
    }

    fn change_number(&self) -> ChangeNumber {
        InMemorySplitStorage::change_number(self)
    }
}

fn detach_from_sets(flag_sets: &mut HashMap<String, HashSet<String>>, name: &str) {
    flag_sets.retain(|_, names| {
        names.remove(name);
        !names.is_empty()
    });
}

/// In-memory segment cache. Large segments use a second instance of the same
/// storage, as membership is the only operation they support.
#[derive(Default)]
pub struct InMemorySegmentStorage {
    segments: RwLock<HashMap<String, Segment>>,
}

impl InMemorySegmentStorage {
    pub fn new() -> InMemorySegmentStorage {
        InMemorySegmentStorage::default()
    }

    pub fn contains(&self, segment: &str, key: &str) -> bool {
        self.segments
            .read()
            .expect("thread holding segments lock should not panic")
            .get(segment)
            .map(|s| s.contains(key))
            .unwrap_or(false)
    }

    pub fn change_number(&self, segment: &str) -> Option<ChangeNumber> {
        self.segments
            .read()
            .expect("thread holding segments lock should not panic")
            .get(segment)
            .map(|s| s.change_number)
    }

    pub fn update(
        &self,
        name: &str,
        added: &[String],
        removed: &[String],
        till: ChangeNumber,
    ) {
        let mut guard = self
            .segments
            .write()
            .expect("thread holding segments lock should not panic");
        guard
            .entry(name.to_owned())
            .or_insert_with(|| Segment::new(name))
            .update(added, removed, till);
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.segments
            .read()
            .expect("thread holding segments lock should not panic")
            .keys()
            .cloned()
            .collect()
    }
}

impl SegmentStorage for InMemorySegmentStorage {
    fn contains(&self, segment: &str, key: &str) -> bool {
        InMemorySegmentStorage::contains(self, segment, key)
    }

    fn change_number(&self, segment: &str) -> Option<ChangeNumber> {
        InMemorySegmentStorage::change_number(self, segment)
    }
}

/// A portion of a flag definition useful for inspection through the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitView {
    pub name: String,
    pub traffic_type: Option<String>,
    pub killed: bool,
    pub treatments: Vec<String>,
    pub change_number: ChangeNumber,
    pub configs: HashMap<String, String>,
    pub default_treatment: String,
    pub sets: Vec<String>,
}

impl From<&Split> for SplitView {
    fn from(split: &Split) -> SplitView {
        let mut treatments: Vec<String> =
            split.treatments().into_iter().map(str::to_owned).collect();
        treatments.sort();
        SplitView {
            name: split.name.clone(),
            traffic_type: split.traffic_type_name.clone(),
            killed: split.killed,
            treatments,
            change_number: split.change_number,
            configs: split.configurations.clone().unwrap_or_default(),
            default_treatment: split.default_treatment.clone(),
            sets: split.sets.clone(),
        }
    }
}
