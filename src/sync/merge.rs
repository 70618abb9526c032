//! Merge Resolver - Field-Ownership Merge of Server and Local Documents
//!
//! Starts from the server document and overlays every local path:
//! - server-authoritative paths are skipped, the server value always wins
//! - paths only present locally are copied in
//! - nested maps present on both sides are merged recursively
//! - anything else takes the local value (client wins on its own data)
//!
//! The result always goes through the structural normalizer.

use super::models::{default_document, is_server_authoritative, PreferenceDocument, SERVER_AUTHORITATIVE_FIELDS};
use super::normalize::normalize;
use serde_json::{Map, Value};

/// Merge `local` onto `server`. Neither input is modified.
///
/// A missing or non-object server document yields the normalized defaults;
/// a missing or non-object local document yields the normalized server copy.
pub fn merge(server: Option<&Value>, local: Option<&Value>) -> PreferenceDocument {
    let server = server.and_then(Value::as_object);
    let local = local.and_then(Value::as_object);

    match (server, local) {
        (None, _) => normalize(&default_document()),
        (Some(server), None) => normalize(&Value::Object(server.clone())),
        (Some(server), Some(local)) => {
            let mut merged = server.clone();
            let mut path = Vec::new();
            overlay(&mut merged, local, &mut path);

            let mut merged = Value::Object(merged);
            let server = Value::Object(server.clone());
            restore_server_fields(&mut merged, &server);
            normalize(&merged)
        }
    }
}

/// Take `local` as-is, except that every server-authoritative field comes
/// from `authority`. Unlike [`merge`], a key missing from `local` stays
/// missing, so deletions survive.
pub fn with_server_fields(local: &Value, authority: &Value) -> PreferenceDocument {
    if !local.is_object() {
        return merge(Some(authority), None);
    }
    let mut adopted = local.clone();
    restore_server_fields(&mut adopted, authority);
    normalize(&adopted)
}

/// A local value may replace a whole parent of a server-owned field
/// (`subscription: 7`); put the server's values back afterwards.
fn restore_server_fields(merged: &mut Value, server: &Value) {
    for field in SERVER_AUTHORITATIVE_FIELDS.iter() {
        match field.get(server) {
            Some(value) => {
                if field.get(merged) != Some(value) {
                    field.set(merged, value.clone());
                }
            }
            None => {
                field.remove(merged);
            }
        }
    }
}

fn overlay<'a>(target: &mut Map<String, Value>, local: &'a Map<String, Value>, path: &mut Vec<&'a str>) {
    for (key, local_value) in local {
        path.push(key.as_str());

        if is_server_authoritative(path) {
            path.pop();
            continue;
        }

        if let Some(existing) = target.get_mut(key) {
            match (existing, local_value) {
                (Value::Object(existing), Value::Object(nested)) => overlay(existing, nested, path),
                (existing, _) => *existing = client_owned(local_value, path),
            }
        } else {
            target.insert(key.clone(), client_owned(local_value, path));
        }

        path.pop();
    }
}

/// Copy of a local value with any server-authoritative descendants removed.
fn client_owned<'a>(value: &'a Value, path: &mut Vec<&'a str>) -> Value {
    match value {
        Value::Object(nested) => {
            let mut owned = Map::new();
            overlay(&mut owned, nested, path);
            Value::Object(owned)
        }
        other => other.clone(),
    }
}

/// The document as it should leave the client: server-authoritative paths removed.
pub fn outgoing_payload(doc: &Value) -> Value {
    let mut payload = doc.clone();
    for field in SERVER_AUTHORITATIVE_FIELDS.iter() {
        if field.remove(&mut payload).is_some() {
            log::debug!("Stripped server-owned field {} from save payload", field.dotted());
        }
    }
    payload
}

// ============================================================================
// Tests
// ============================================================================
