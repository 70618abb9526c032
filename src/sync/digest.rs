//! Change Detection - Canonical Digests of the Editable Projection
//!
//! A digest is the SHA-256 of the document's canonical JSON (object keys
//! sorted, compact separators) after ignored paths are removed. By default
//! the ignore-list is every server-authoritative field plus the local
//! "last synced at" stamp, so server-only churn never triggers a resend.

use super::models::{FieldPath, KEY_LAST_SYNCED_AT, SERVER_AUTHORITATIVE_FIELDS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 over canonical JSON
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigestToken(String);

impl DigestToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DigestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

// ============================================================================
// Canonical Serialization
// ============================================================================

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Canonical JSON text: sorted keys, no whitespace
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Digest of `value` exactly as given, with no paths removed
pub fn digest_raw(value: &Value) -> DigestToken {
    let hash = Sha256::digest(to_canonical_string(value).as_bytes());
    DigestToken(hex::encode(hash))
}

// ============================================================================
// Change Detector
// ============================================================================

/// Tracks the digest of the last document known to match the server.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    ignored: Vec<FieldPath>,
    last_synced: Option<DigestToken>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    /// Detector ignoring server-authoritative fields and the sync stamp
    pub fn new() -> Self {
        let mut ignored = SERVER_AUTHORITATIVE_FIELDS.to_vec();
        ignored.push(FieldPath(&[KEY_LAST_SYNCED_AT]));
        Self::with_ignored(ignored)
    }

    /// Detector with a custom ignore-list
    pub fn with_ignored(ignored: Vec<FieldPath>) -> Self {
        Self {
            ignored,
            last_synced: None,
        }
    }

    /// The caller-editable projection of `doc`
    pub fn project(&self, doc: &Value) -> Value {
        let mut projection = doc.clone();
        for path in &self.ignored {
            path.remove(&mut projection);
        }
        projection
    }

    /// Deterministic digest of the editable projection
    pub fn digest(&self, doc: &Value) -> DigestToken {
        digest_raw(&self.project(doc))
    }

    pub fn has_changed_since(&self, doc: &Value, token: &DigestToken) -> bool {
        &self.digest(doc) != token
    }

    /// True unless `doc` matches the last synced digest
    pub fn is_dirty(&self, doc: &Value) -> bool {
        match &self.last_synced {
            Some(token) => self.has_changed_since(doc, token),
            None => true,
        }
    }

    pub fn last_synced(&self) -> Option<&DigestToken> {
        self.last_synced.as_ref()
    }

    /// Record `doc` as confirmed in sync (after a successful save or load)
    pub fn mark_synced(&mut self, doc: &Value) -> DigestToken {
        let token = self.digest(doc);
        log::debug!("Synced digest updated to {}", token);
        self.last_synced = Some(token.clone());
        token
    }

    pub fn reset(&mut self) {
        self.last_synced = None;
    }
}

// ============================================================================
// Tests
// ============================================================================
