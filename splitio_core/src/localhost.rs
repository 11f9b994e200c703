//! Localhost mode: flags come from a local file instead of the backend.
//!
//! Three formats are understood: the legacy `.split` line format
//! (`feature treatment` with `#` comments), and YAML/JSON files carrying
//! richer definitions (per-treatment keys and configurations).
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

use crate::splits::models::{
    Combiner, Condition, ConditionType, Matcher, MatcherGroup, MatcherKind, Partition, Split,
    SplitChanges, SplitChangesResponse, Status, TryParse,
};
use crate::storage::InMemorySplitStorage;
use crate::sync::ReadinessGate;
use crate::tasks::Shutdown;
use crate::{Error, Result};

/// A YAML flag file is a sequence of single-entry maps:
///
/// ```yaml
/// - my_feature:
///     treatment: "on"
///     keys: ["alice", "bob"]
///     config: "{\"size\": 10}"
/// - my_feature:
///     treatment: "off"
/// ```
#[derive(Debug, Deserialize)]
struct YamlRule {
    treatment: String,
    #[serde(default)]
    keys: Option<Vec<String>>,
    #[serde(default)]
    config: Option<String>,
}

/// Load flag definitions from a localhost file, dispatching on extension.
pub fn load_file(path: &Path) -> Result<Vec<Split>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| Error::LocalhostFile(format!("{}: {err}", path.display())))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => parse_yaml(&contents),
        Some("json") => parse_json(&contents),
        _ => Ok(parse_legacy(&contents)),
    }
}

/// The original one-flag-per-line format: `feature treatment`.
fn parse_legacy(contents: &str) -> Vec<Split> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(feature), Some(treatment), None) => {
                    Some(build_split(feature, vec![all_keys_condition(treatment)], None))
                }
                _ => {
                    log::warn!(target: "splitio", "skipping malformed localhost line: {line:?}");
                    None
                }
            }
        })
        .collect()
}

fn parse_yaml(contents: &str) -> Result<Vec<Split>> {
    let entries: Vec<HashMap<String, YamlRule>> = serde_yaml::from_str(contents)
        .map_err(|err| Error::LocalhostFile(format!("invalid YAML flag file: {err}")))?;

    // Rules for the same flag accumulate: whitelists first, then the
    // catch-all treatment.
    let mut order: Vec<String> = Vec::new();
    let mut conditions: HashMap<String, Vec<Condition>> = HashMap::new();
    let mut configs: HashMap<String, HashMap<String, String>> = HashMap::new();

    for entry in entries {
        for (feature, rule) in entry {
            if !conditions.contains_key(&feature) {
                order.push(feature.clone());
            }
            let slot = conditions.entry(feature.clone()).or_default();
            match &rule.keys {
                Some(keys) => slot.insert(
                    0,
                    whitelist_condition(keys, &rule.treatment),
                ),
                None => slot.push(all_keys_condition(&rule.treatment)),
            }
            if let Some(config) = rule.config {
                configs
                    .entry(feature)
                    .or_default()
                    .insert(rule.treatment, config);
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|feature| {
            let conditions = conditions.remove(&feature).unwrap_or_default();
            let configs = configs.remove(&feature);
            build_split(&feature, conditions, configs)
        })
        .collect())
}

/// JSON files carry real flag definitions: either a `splitChanges`-shaped
/// envelope or a plain array of definitions.
fn parse_json(contents: &str) -> Result<Vec<Split>> {
    let changes: Result<SplitChangesResponse> = serde_json::from_str(contents).map_err(Error::from);
    let parsed: Vec<TryParse<Split>> = match changes {
        Ok(response) => {
            let SplitChanges { splits, .. } = response.into_changes();
            splits
        }
        Err(_) => serde_json::from_str(contents)
            .map_err(|err| Error::LocalhostFile(format!("invalid JSON flag file: {err}")))?,
    };
    Ok(parsed.into_iter().filter_map(Option::from).collect())
}

fn build_split(
    name: &str,
    conditions: Vec<Condition>,
    configurations: Option<HashMap<String, String>>,
) -> Split {
    Split {
        name: name.to_owned(),
        seed: 0,
        killed: false,
        default_treatment: "control".to_owned(),
        traffic_type_name: Some("localhost".to_owned()),
        status: Status::Active,
        change_number: 0,
        algo: Default::default(),
        traffic_allocation: None,
        traffic_allocation_seed: None,
        conditions,
        configurations,
        sets: Vec::new(),
    }
}

fn all_keys_condition(treatment: &str) -> Condition {
    Condition {
        condition_type: ConditionType::Rollout,
        matcher_group: MatcherGroup {
            combiner: Combiner::And,
            matchers: vec![Matcher {
                negate: false,
                attribute: None,
                kind: MatcherKind::AllKeys,
            }],
        },
        partitions: vec![Partition {
            treatment: treatment.to_owned(),
            size: 100,
        }],
        label: "default rule".to_owned(),
    }
}

fn whitelist_condition(keys: &[String], treatment: &str) -> Condition {
    Condition {
        condition_type: ConditionType::Whitelist,
        matcher_group: MatcherGroup {
            combiner: Combiner::And,
            matchers: vec![Matcher {
                negate: false,
                attribute: None,
                kind: MatcherKind::Whitelist(keys.iter().cloned().collect()),
            }],
        },
        partitions: vec![Partition {
            treatment: treatment.to_owned(),
            size: 100,
        }],
        label: format!("whitelisted {treatment}"),
    }
}

/// Replace storage contents with the file's definitions.
fn apply_definitions(storage: &InMemorySplitStorage, splits: Vec<Split>) {
    let till = storage.change_number() + 1;
    let incoming: Vec<String> = splits.iter().map(|s| s.name.clone()).collect();
    let removals: Vec<String> = storage
        .snapshot()
        .split_names()
        .into_iter()
        .filter(|name| !incoming.contains(name))
        .collect();
    let splits = splits
        .into_iter()
        .map(|mut split| {
            split.change_number = till;
            split
        })
        .collect();
    storage.apply(splits, &removals, till);
}

/// Watch the flag file, reloading when its mtime changes. The first load
/// happens immediately and releases the readiness gate.
pub fn spawn_file_watcher(
    path: PathBuf,
    storage: Arc<InMemorySplitStorage>,
    interval: Duration,
    readiness: Arc<ReadinessGate>,
    mut shutdown: Shutdown,
) {
    tokio::spawn(async move {
        let mut last_mtime: Option<SystemTime> = None;
        loop {
            let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            if mtime != last_mtime || last_mtime.is_none() {
                match load_file(&path) {
                    Ok(splits) => {
                        log::debug!(target: "splitio", "loaded {} flags from {}", splits.len(), path.display());
                        apply_definitions(&storage, splits);
                        last_mtime = mtime;
                    }
                    Err(err) => {
                        log::warn!(target: "splitio", "unable to load localhost flags: {err}");
                    }
                }
            }
            readiness.set(Ok(()));

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.signalled() => return,
            }
        }
    });
}
