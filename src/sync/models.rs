//! Preference Document Models - Shape, Defaults & Field Ownership
//!
//! The preference document is a single deeply nested JSON tree holding all
//! user state. It is kept as a `serde_json::Value` because documents arrive
//! partially populated (older clients, first use) and may carry fields this
//! crate does not know about; those must survive a round trip untouched.
//!
//! Document Categories:
//! - Scalars: current active list, last-used and last-synced timestamps
//! - Sequences: job titles, applications, resources
//! - Keyed collections: companies, cover letters, links, link-trees, CVs
//! - Fixed-shape sub-trees: settings, subscription, usage, career page lists

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Alias used throughout the engine for the whole user document.
pub type PreferenceDocument = Value;

// ============================================================================
// Document Keys
// ============================================================================

pub const KEY_CURRENT_ACTIVE_LIST: &str = "currentActiveList";
pub const KEY_LAST_USED: &str = "lastUsed";
pub const KEY_LAST_SYNCED_AT: &str = "lastSyncedAt";
pub const KEY_JOB_TITLES: &str = "jobTitles";
pub const KEY_APPLICATIONS: &str = "applications";
pub const KEY_RESOURCES: &str = "resources";
pub const KEY_COMPANIES: &str = "companies";
pub const KEY_COVER_LETTERS: &str = "coverLetters";
pub const KEY_LINKS: &str = "links";
pub const KEY_LINKTREES: &str = "linktrees";
pub const KEY_CVS: &str = "cvs";
pub const KEY_SETTINGS: &str = "settings";
pub const KEY_SUBSCRIPTION: &str = "subscription";
pub const KEY_USAGE: &str = "usage";
pub const KEY_CAREER_PAGE_LISTS: &str = "careerPageLists";
pub const KEY_USER_ID: &str = "userId";
pub const KEY_EMAIL: &str = "email";
pub const KEY_PLAN: &str = "plan";

/// Keyed collections, each a map from generated identifier to entry.
pub const KEYED_COLLECTIONS: [&str; 5] = [
    KEY_COMPANIES,
    KEY_COVER_LETTERS,
    KEY_LINKS,
    KEY_LINKTREES,
    KEY_CVS,
];

/// Ordered sequences.
pub const SEQUENCE_FIELDS: [&str; 3] = [KEY_JOB_TITLES, KEY_APPLICATIONS, KEY_RESOURCES];

/// The five career page list slots, in order. The first is the fallback
/// for an invalid `currentActiveList`.
pub const CAREER_LIST_NAMES: [&str; 5] = ["listA", "listB", "listC", "listD", "listE"];

/// Key of the CV entry created when the CV collection is empty.
pub const DEFAULT_CV_KEY: &str = "default";

// ============================================================================
// Subscription Plans
// ============================================================================

/// Subscription tiers, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Premium => "premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Plan::Free),
            "pro" => Some(Plan::Pro),
            "premium" => Some(Plan::Premium),
            _ => None,
        }
    }

    /// Lowest tier, used when a document carries no plan
    pub fn lowest() -> Self {
        Plan::Free
    }
}

// ============================================================================
// Field Paths
// ============================================================================

/// A path into the document, one segment per object key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldPath(pub &'static [&'static str]);

impl FieldPath {
    pub fn segments(&self) -> &'static [&'static str] {
        self.0
    }

    /// True when `path` (a walk from the root) equals this field path.
    pub fn matches(&self, path: &[&str]) -> bool {
        self.0.len() == path.len() && self.0.iter().zip(path).all(|(a, b)| a == b)
    }

    /// Dotted form for logging (`subscription.plan`)
    pub fn dotted(&self) -> String {
        self.0.join(".")
    }

    /// Read the value at this path, if every segment resolves.
    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(doc, |node, key| node.as_object()?.get(*key))
    }

    /// Write `value` at this path, replacing any non-object parent on the way.
    pub fn set(&self, doc: &mut Value, value: Value) {
        let Some((last, parents)) = self.0.split_last() else {
            return;
        };
        let mut node = doc;
        for key in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), value);
        }
    }

    /// Remove the value at this path. Missing intermediate nodes are a no-op.
    pub fn remove(&self, doc: &mut Value) -> Option<Value> {
        let (last, parents) = self.0.split_last()?;
        let mut node = doc;
        for key in parents {
            node = node.as_object_mut()?.get_mut(*key)?;
        }
        node.as_object_mut()?.remove(*last)
    }
}

/// Paths only the server may set. Local values at these paths are stripped
/// from outgoing payloads and always replaced by the server's during merge.
pub const SERVER_AUTHORITATIVE_FIELDS: [FieldPath; 9] = [
    FieldPath(&[KEY_SUBSCRIPTION, KEY_PLAN]),
    FieldPath(&[KEY_SUBSCRIPTION, "status"]),
    FieldPath(&[KEY_SUBSCRIPTION, "startDate"]),
    FieldPath(&[KEY_SUBSCRIPTION, "endDate"]),
    FieldPath(&[KEY_SUBSCRIPTION, "features"]),
    FieldPath(&[KEY_USAGE]),
    FieldPath(&[KEY_LAST_USED]),
    FieldPath(&[KEY_USER_ID]),
    FieldPath(&[KEY_EMAIL]),
];

/// True when `path` is one of the server-authoritative fields
pub fn is_server_authoritative(path: &[&str]) -> bool {
    SERVER_AUTHORITATIVE_FIELDS.iter().any(|f| f.matches(path))
}

// ============================================================================
// Defaults
// ============================================================================

/// Default settings sub-tree. Missing keys in a stored document are filled
/// from here; existing values are never overwritten.
pub fn default_settings() -> Map<String, Value> {
    let settings = json!({
        "theme": "light",
        "language": "en",
        "notificationsEnabled": true,
        "autoSave": true,
        "defaultExportFormat": "pdf",
    });
    match settings {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The CV entry created when the CV collection is empty
pub fn default_cv() -> Value {
    json!({
        "id": DEFAULT_CV_KEY,
        "name": "My CV",
        "template": "classic",
        "sections": [],
    })
}

/// A complete document with every container present and empty.
pub fn default_document() -> PreferenceDocument {
    let mut lists = Map::new();
    for name in CAREER_LIST_NAMES {
        lists.insert(name.to_string(), Value::Array(Vec::new()));
    }

    let mut cvs = Map::new();
    cvs.insert(DEFAULT_CV_KEY.to_string(), default_cv());

    json!({
        KEY_CURRENT_ACTIVE_LIST: CAREER_LIST_NAMES[0],
        KEY_JOB_TITLES: [],
        KEY_APPLICATIONS: [],
        KEY_RESOURCES: [],
        KEY_COMPANIES: {},
        KEY_COVER_LETTERS: {},
        KEY_LINKS: {},
        KEY_LINKTREES: {},
        KEY_CVS: Value::Object(cvs),
        KEY_SETTINGS: Value::Object(default_settings()),
        KEY_SUBSCRIPTION: { KEY_PLAN: Plan::lowest().as_str() },
        KEY_USAGE: {},
        KEY_CAREER_PAGE_LISTS: Value::Object(lists),
    })
}

// ============================================================================
// Save Outcomes
// ============================================================================

/// Why a save was resolved without the server applying anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Digest matched the last synced digest; no request was sent
    Unchanged,
    /// Server answered 204: it already holds this payload
    ServerUnchanged,
}

/// Outcome shared by every caller whose save was coalesced into one batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    pub skipped: bool,
    pub reason: Option<SkipReason>,
    /// Local document after the server's response was merged in
    pub document: Option<PreferenceDocument>,
    /// Number of queued saves resolved by this outcome
    pub batch_size: usize,
}

impl SaveOutcome {
    pub fn saved(document: Option<PreferenceDocument>, batch_size: usize) -> Self {
        Self {
            skipped: false,
            reason: None,
            document,
            batch_size,
        }
    }

    pub fn skipped(reason: SkipReason, batch_size: usize) -> Self {
        Self {
            skipped: true,
            reason: Some(reason),
            document: None,
            batch_size,
        }
    }
}

/// Engine sync state, as shown to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Loading,
    Saving,
    /// Last load fell back to local defaults
    Offline,
    /// Last save exhausted its retries
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Saving => "saving",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
