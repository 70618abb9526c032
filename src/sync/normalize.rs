//! Structural Normalizer
//!
//! Turns any JSON value into a document that satisfies the shape rules:
//! every keyed collection is a map, every sequence is an array, the five
//! career page lists exist, the active list names one of them, the
//! subscription carries a plan and at least one CV exists.
//!
//! `normalize` never fails and never mutates its input. It is idempotent,
//! so it can run after every load, merge and server response.

use super::models::{
    default_cv, default_document, default_settings, Plan, PreferenceDocument,
    CAREER_LIST_NAMES, DEFAULT_CV_KEY, KEYED_COLLECTIONS, KEY_CAREER_PAGE_LISTS,
    KEY_CURRENT_ACTIVE_LIST, KEY_CVS, KEY_LAST_SYNCED_AT, KEY_PLAN, KEY_SETTINGS,
    KEY_SUBSCRIPTION, KEY_USAGE, SEQUENCE_FIELDS,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Return a copy of `doc` repaired to the full document shape.
pub fn normalize(doc: &Value) -> PreferenceDocument {
    let Some(source) = doc.as_object() else {
        if !doc.is_null() {
            log::warn!("Preference document is a {}, replacing with defaults", kind(doc));
        }
        return default_document();
    };

    let mut out = source.clone();

    for key in KEYED_COLLECTIONS {
        let repaired = keyed_collection(out.remove(key));
        out.insert(key.to_string(), Value::Object(repaired));
    }

    for key in SEQUENCE_FIELDS {
        let repaired = sequence(out.remove(key));
        out.insert(key.to_string(), Value::Array(repaired));
    }

    let lists = career_page_lists(out.remove(KEY_CAREER_PAGE_LISTS));
    out.insert(KEY_CAREER_PAGE_LISTS.to_string(), Value::Object(lists));

    let active = match out.get(KEY_CURRENT_ACTIVE_LIST).and_then(Value::as_str) {
        Some(name) if CAREER_LIST_NAMES.contains(&name) => name.to_string(),
        _ => CAREER_LIST_NAMES[0].to_string(),
    };
    out.insert(KEY_CURRENT_ACTIVE_LIST.to_string(), Value::String(active));

    let settings = settings(out.remove(KEY_SETTINGS));
    out.insert(KEY_SETTINGS.to_string(), Value::Object(settings));

    let subscription = subscription(out.remove(KEY_SUBSCRIPTION));
    out.insert(KEY_SUBSCRIPTION.to_string(), Value::Object(subscription));

    if !out.get(KEY_USAGE).map_or(false, Value::is_object) {
        out.insert(KEY_USAGE.to_string(), Value::Object(Map::new()));
    }

    if let Some(Value::Object(cvs)) = out.get_mut(KEY_CVS) {
        if cvs.is_empty() {
            cvs.insert(DEFAULT_CV_KEY.to_string(), default_cv());
        }
    }

    Value::Object(out)
}

/// Record a successful sync cycle on the document.
pub fn stamp_synced(doc: &mut Value, now: DateTime<Utc>) {
    if let Some(map) = doc.as_object_mut() {
        map.insert(
            KEY_LAST_SYNCED_AT.to_string(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
}

/// List every shape rule `doc` breaks. Empty means the document is complete.
pub fn violations(doc: &Value) -> Vec<String> {
    let Some(map) = doc.as_object() else {
        return vec![format!("document is a {}, expected object", kind(doc))];
    };

    let mut problems = Vec::new();

    for key in KEYED_COLLECTIONS {
        if !map.get(key).map_or(false, Value::is_object) {
            problems.push(format!("{} is not a keyed collection", key));
        }
    }

    for key in SEQUENCE_FIELDS {
        if !map.get(key).map_or(false, Value::is_array) {
            problems.push(format!("{} is not a sequence", key));
        }
    }

    match map.get(KEY_CAREER_PAGE_LISTS).and_then(Value::as_object) {
        Some(lists) => {
            for name in CAREER_LIST_NAMES {
                if !lists.get(name).map_or(false, Value::is_array) {
                    problems.push(format!("{}.{} is not a sequence", KEY_CAREER_PAGE_LISTS, name));
                }
            }
            if lists.len() != CAREER_LIST_NAMES.len() {
                problems.push(format!("{} has {} slots", KEY_CAREER_PAGE_LISTS, lists.len()));
            }
        }
        None => problems.push(format!("{} is missing", KEY_CAREER_PAGE_LISTS)),
    }

    match map.get(KEY_CURRENT_ACTIVE_LIST).and_then(Value::as_str) {
        Some(name) if CAREER_LIST_NAMES.contains(&name) => {}
        _ => problems.push(format!("{} is not a list name", KEY_CURRENT_ACTIVE_LIST)),
    }

    let has_plan = map
        .get(KEY_SUBSCRIPTION)
        .and_then(|s| s.get(KEY_PLAN))
        .and_then(Value::as_str)
        .map_or(false, |p| !p.is_empty());
    if !has_plan {
        problems.push(format!("{}.{} is missing", KEY_SUBSCRIPTION, KEY_PLAN));
    }

    if !map.get(KEY_SETTINGS).map_or(false, Value::is_object) {
        problems.push(format!("{} is missing", KEY_SETTINGS));
    }

    if !map.get(KEY_USAGE).map_or(false, Value::is_object) {
        problems.push(format!("{} is missing", KEY_USAGE));
    }

    if map.get(KEY_CVS).and_then(Value::as_object).map_or(true, Map::is_empty) {
        problems.push(format!("{} has no entry", KEY_CVS));
    }

    problems
}

// ============================================================================
// Repairs
// ============================================================================

/// Keyed collections that arrive as arrays are re-keyed by each entry's
/// `id`, falling back to the entry's position. Colliding keys get a
/// `-2`, `-3`, ... suffix so no entry is lost.
fn keyed_collection(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        Some(Value::Array(items)) => {
            let mut map = Map::new();
            for (index, item) in items.into_iter().enumerate() {
                let key = match item.get("id") {
                    Some(Value::String(id)) if !id.is_empty() => id.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => index.to_string(),
                };
                let key = unique_key(&map, key);
                map.insert(key, item);
            }
            map
        }
        _ => Map::new(),
    }
}

fn unique_key(map: &Map<String, Value>, key: String) -> String {
    if !map.contains_key(&key) {
        return key;
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{}-{}", key, suffix);
        if !map.contains_key(&candidate) {
            log::warn!("Duplicate collection key {:?}, stored entry as {:?}", key, candidate);
            return candidate;
        }
        suffix += 1;
    }
}

fn sequence(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => map.into_iter().map(|(_, v)| v).collect(),
        _ => Vec::new(),
    }
}

fn career_page_lists(value: Option<Value>) -> Map<String, Value> {
    let mut source = match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut lists = Map::new();
    for name in CAREER_LIST_NAMES {
        let slot = match source.remove(name) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        lists.insert(name.to_string(), Value::Array(slot));
    }

    if !source.is_empty() {
        log::debug!("Dropping {} unknown career page list slot(s)", source.len());
    }

    lists
}

fn settings(value: Option<Value>) -> Map<String, Value> {
    let mut settings = match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (key, default) in default_settings() {
        settings.entry(key).or_insert(default);
    }
    settings
}

fn subscription(value: Option<Value>) -> Map<String, Value> {
    let mut subscription = match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let has_plan = subscription
        .get(KEY_PLAN)
        .and_then(Value::as_str)
        .map_or(false, |p| !p.is_empty());
    if !has_plan {
        subscription.insert(
            KEY_PLAN.to_string(),
            Value::String(Plan::lowest().as_str().to_string()),
        );
    }

    subscription
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Tests
// ============================================================================
