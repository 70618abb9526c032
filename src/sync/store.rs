//! Preference Store - The engine's public face
//!
//! Owns the live preference document and wires the pieces together:
//! - `load` fetches, normalizes and seeds the change detector (defaults on failure)
//! - `update` edits in memory; server-owned fields cannot be changed locally
//! - `save` goes through the debounced save queue
//! - `refresh` pulls the server copy without clobbering unsaved edits
//! - subscribers hear about every committed document
//!
//! The document is only handed out as a snapshot or edited inside a closure,
//! never shared by reference.

use super::api::{PreferenceTransport, SyncApiClient};
use super::clock::{Clock, SystemClock};
use super::digest::{ChangeDetector, DigestToken};
use super::error::SyncError;
use super::history::{HistoryEntry, HistoryStats, HistoryStatus, SyncHistory, SyncOperation};
use super::merge::{merge, with_server_fields};
use super::models::{default_document, PreferenceDocument, SaveOutcome, SyncState};
use super::normalize::{normalize, stamp_synced, violations};
use super::queue::{BatchSink, QueueConfig, QueueStats, SaveHandle, SaveQueue};
use crate::config::EngineConfig;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

// ============================================================================
// Events & Subscriptions
// ============================================================================

/// Something subscribers should know about
#[derive(Debug, Clone, PartialEq)]
pub enum PreferenceEvent {
    /// `fallback` is set when the server could not be reached and defaults are in use
    Loaded { document: PreferenceDocument, fallback: bool },
    Updated { document: PreferenceDocument },
    Saved { document: PreferenceDocument },
    SaveFailed { error: SyncError },
    Refreshed { document: PreferenceDocument },
}

impl PreferenceEvent {
    pub fn document(&self) -> Option<&PreferenceDocument> {
        match self {
            PreferenceEvent::Loaded { document, .. }
            | PreferenceEvent::Updated { document }
            | PreferenceEvent::Saved { document }
            | PreferenceEvent::Refreshed { document } => Some(document),
            PreferenceEvent::SaveFailed { .. } => None,
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&PreferenceEvent) + Send + Sync>;

type SubscriberMap = Mutex<BTreeMap<u64, Subscriber>>;

/// Returned by [`PreferenceStore::subscribe`]; dropping it keeps the callback registered.
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberMap>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Shared State
// ============================================================================

/// State reachable from both the store handle and the save queue.
/// Lock order: `document` before `detector`.
struct StoreShared {
    document: Mutex<PreferenceDocument>,
    detector: Arc<Mutex<ChangeDetector>>,
    state: Mutex<SyncState>,
    history: Mutex<SyncHistory>,
    subscribers: Arc<SubscriberMap>,
    next_subscriber: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl StoreShared {
    fn set_state(&self, state: SyncState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::debug!("Sync state: {} -> {}", current.as_str(), state.as_str());
            *current = state;
        }
    }

    fn record(&self, operation: SyncOperation, status: HistoryStatus, digest: Option<&DigestToken>, detail: Option<String>) {
        let mut entry = HistoryEntry::new(operation, status, self.clock.now());
        if let Some(digest) = digest {
            entry = entry.with_digest(digest.as_str());
        }
        if let Some(detail) = detail {
            entry = entry.with_detail(detail);
        }
        lock(&self.history).record(entry);
    }

    /// Call every subscriber outside the registry lock, so callbacks may
    /// subscribe, unsubscribe or read the store.
    fn broadcast(&self, event: PreferenceEvent) {
        let listeners: Vec<Subscriber> = lock(&self.subscribers).values().cloned().collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn warn_if_repaired(&self, server_doc: &PreferenceDocument) {
        let problems = violations(server_doc);
        if !problems.is_empty() {
            log::warn!("Server preferences repaired on receipt: {}", problems.join("; "));
        }
    }
}

impl BatchSink for StoreShared {
    fn batch_started(&self, _batch_size: usize) {
        self.set_state(SyncState::Saving);
    }

    fn apply_server_document(&self, server_doc: PreferenceDocument, sent: &PreferenceDocument) -> PreferenceDocument {
        let mut document = lock(&self.document);
        if !server_doc.is_object() {
            log::warn!("Save response carried a non-object document, keeping local copy");
            return document.clone();
        }
        self.warn_if_repaired(&server_doc);

        let edited_in_flight = {
            let detector = lock(&self.detector);
            detector.digest(&document) != detector.digest(sent)
        };

        // Edits made while the request was out must survive, deletions included
        let mut merged = if edited_in_flight {
            log::debug!("Local edits arrived during save, adopting only server-owned fields");
            with_server_fields(&document, &server_doc)
        } else {
            merge(Some(&server_doc), Some(&document))
        };
        stamp_synced(&mut merged, self.clock.now());

        // Fields the server added are synced too, otherwise the next save resends them
        if !edited_in_flight {
            lock(&self.detector).mark_synced(&merged);
        }
        *document = merged.clone();
        merged
    }

    fn batch_settled(&self, result: &Result<SaveOutcome, SyncError>, synced: Option<&DigestToken>) {
        match result {
            Ok(outcome) if outcome.skipped => {
                self.set_state(SyncState::Idle);
                let reason = outcome.reason.map(|r| format!("{:?}", r));
                self.record(SyncOperation::Save, HistoryStatus::Skipped, synced, reason);
            }
            Ok(outcome) => {
                self.set_state(SyncState::Idle);
                let document = match &outcome.document {
                    Some(document) => document.clone(),
                    None => {
                        let mut document = lock(&self.document);
                        stamp_synced(&mut document, self.clock.now());
                        document.clone()
                    }
                };
                self.record(
                    SyncOperation::Save,
                    HistoryStatus::Success,
                    synced,
                    Some(format!("batch of {}", outcome.batch_size)),
                );
                self.broadcast(PreferenceEvent::Saved { document });
            }
            Err(error) => {
                self.set_state(SyncState::Error);
                self.record(SyncOperation::Save, HistoryStatus::Failed, None, Some(error.to_string()));
                self.broadcast(PreferenceEvent::SaveFailed { error: error.clone() });
            }
        }
    }
}

// ============================================================================
// Preference Store
// ============================================================================

/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct PreferenceStore {
    shared: Arc<StoreShared>,
    transport: Arc<dyn PreferenceTransport>,
    queue: SaveQueue,
}

impl PreferenceStore {
    /// Store over the HTTP backend named in `config`
    pub fn connect(config: &EngineConfig) -> Result<Self, SyncError> {
        let client = SyncApiClient::new(&config.base_url, config.request_timeout())?;
        Ok(Self::new(Arc::new(client), config))
    }

    pub fn new(transport: Arc<dyn PreferenceTransport>, config: &EngineConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    /// Must be called from within a tokio runtime.
    pub fn with_clock(transport: Arc<dyn PreferenceTransport>, config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let detector = Arc::new(Mutex::new(ChangeDetector::new()));

        let shared = Arc::new(StoreShared {
            document: Mutex::new(normalize(&default_document())),
            detector: detector.clone(),
            state: Mutex::new(SyncState::Idle),
            history: Mutex::new(SyncHistory::new(config.history_capacity)),
            subscribers: Arc::new(Mutex::new(BTreeMap::new())),
            next_subscriber: AtomicU64::new(1),
            clock,
        });

        let queue = SaveQueue::new(
            transport.clone(),
            detector,
            shared.clone(),
            QueueConfig {
                debounce: config.debounce(),
                retry: config.retry_policy(),
                max_payload_bytes: config.max_payload_bytes,
            },
        );

        Self {
            shared,
            transport,
            queue,
        }
    }

    /// Snapshot of the live document
    pub fn document(&self) -> PreferenceDocument {
        lock(&self.shared.document).clone()
    }

    pub fn state(&self) -> SyncState {
        *lock(&self.shared.state)
    }

    /// True when the live document differs from the last confirmed sync
    pub fn is_dirty(&self) -> bool {
        let document = lock(&self.shared.document);
        let detector = lock(&self.shared.detector);
        detector.is_dirty(&document)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.shared.history).entries()
    }

    pub fn history_stats(&self) -> HistoryStats {
        lock(&self.shared.history).stats()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Fetch the server document and make it the live one. Never fails:
    /// when the server is unreachable the defaults are used instead.
    pub async fn load(&self) -> PreferenceDocument {
        self.shared.set_state(SyncState::Loading);
        let result = self.transport.load().await;
        let now = self.shared.clock.now();

        let (document, fallback) = match result {
            Ok(Some(server_doc)) => {
                self.shared.warn_if_repaired(&server_doc);
                let mut document = normalize(&server_doc);
                stamp_synced(&mut document, now);

                let token = {
                    let mut current = lock(&self.shared.document);
                    let token = lock(&self.shared.detector).mark_synced(&document);
                    *current = document.clone();
                    token
                };

                log::info!("Preferences loaded (digest {})", token);
                self.shared.set_state(SyncState::Idle);
                self.shared.record(SyncOperation::Load, HistoryStatus::Success, Some(&token), None);
                (document, false)
            }
            Ok(None) => {
                let mut document = normalize(&default_document());
                stamp_synced(&mut document, now);
                self.install_unsynced(&document);

                log::info!("No stored preferences on server, starting from defaults");
                self.shared.set_state(SyncState::Idle);
                self.shared.record(
                    SyncOperation::Load,
                    HistoryStatus::Success,
                    None,
                    Some("server had no document".to_string()),
                );
                (document, false)
            }
            Err(e) => {
                let document = normalize(&default_document());
                self.install_unsynced(&document);

                log::warn!("Failed to load preferences, using local defaults: {}", e);
                self.shared.set_state(SyncState::Offline);
                self.shared.record(SyncOperation::Load, HistoryStatus::Fallback, None, Some(e.to_string()));
                (document, true)
            }
        };

        self.shared.broadcast(PreferenceEvent::Loaded {
            document: document.clone(),
            fallback,
        });
        document
    }

    /// Replace the live document with one the server has not confirmed
    fn install_unsynced(&self, document: &PreferenceDocument) {
        let mut current = lock(&self.shared.document);
        lock(&self.shared.detector).reset();
        *current = document.clone();
    }

    /// Edit the live document in memory. Server-owned fields keep their
    /// current values whatever the closure does, and the result is
    /// normalized. The closure runs under the document lock and must not
    /// call back into the store.
    pub fn update<F>(&self, mutator: F) -> PreferenceDocument
    where
        F: FnOnce(&mut PreferenceDocument),
    {
        let updated = {
            let mut document = lock(&self.shared.document);
            let mut edited = document.clone();
            mutator(&mut edited);
            let updated = with_server_fields(&edited, &document);
            *document = updated.clone();
            updated
        };

        self.shared.broadcast(PreferenceEvent::Updated {
            document: updated.clone(),
        });
        updated
    }

    /// [`update`](Self::update) followed by a debounced save
    pub fn update_and_save<F>(&self, mutator: F) -> Result<SaveHandle, SyncError>
    where
        F: FnOnce(&mut PreferenceDocument),
    {
        self.update(mutator);
        self.schedule_save()
    }

    /// Queue a save of the current document; resolves after the debounce
    /// window and the transmission of its batch.
    pub fn schedule_save(&self) -> Result<SaveHandle, SyncError> {
        self.queue.enqueue(self.document())
    }

    /// Save the current document and wait for the outcome. `immediate`
    /// skips the debounce window.
    pub async fn save(&self, immediate: bool) -> Result<SaveOutcome, SyncError> {
        let payload = self.document();
        if immediate {
            self.queue.save_now(payload).await
        } else {
            self.queue.enqueue(payload)?.await
        }
    }

    /// Send anything still waiting in the debounce window
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Pull the server copy. A document with no unsaved edits is replaced
    /// outright; otherwise only server-owned fields are taken from the server.
    pub async fn refresh(&self) -> Result<PreferenceDocument, SyncError> {
        let server_doc = match self.transport.load().await {
            Ok(Some(server_doc)) => server_doc,
            Ok(None) => {
                log::debug!("Server has no preferences to refresh from");
                return Ok(self.document());
            }
            Err(e) => {
                log::warn!("Preferences refresh failed: {}", e);
                let error = SyncError::from(e);
                self.shared
                    .record(SyncOperation::Refresh, HistoryStatus::Failed, None, Some(error.to_string()));
                return Err(error);
            }
        };

        self.shared.warn_if_repaired(&server_doc);
        let now = self.shared.clock.now();

        let (refreshed, token, kept_edits) = {
            let mut document = lock(&self.shared.document);
            let mut detector = lock(&self.shared.detector);

            let kept_edits = detector.is_dirty(&document);
            let mut refreshed = if kept_edits {
                with_server_fields(&document, &server_doc)
            } else {
                normalize(&server_doc)
            };
            stamp_synced(&mut refreshed, now);

            let token = if kept_edits {
                None
            } else {
                Some(detector.mark_synced(&refreshed))
            };
            *document = refreshed.clone();
            (refreshed, token, kept_edits)
        };

        log::info!(
            "Preferences refreshed from server{}",
            if kept_edits { " (unsaved local edits kept)" } else { "" }
        );
        self.shared
            .record(SyncOperation::Refresh, HistoryStatus::Success, token.as_ref(), None);
        self.shared.broadcast(PreferenceEvent::Refreshed {
            document: refreshed.clone(),
        });
        Ok(refreshed)
    }

    /// Register `callback` for every subsequent event
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PreferenceEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).insert(id, Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.shared.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::FixedClock;
    use crate::sync::models::SkipReason;
    use crate::sync::test_support::{FakeLoad, FakeReply, FakeTransport};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    const STAMP: &str = "2026-01-01T12:00:00.000Z";

    fn config() -> EngineConfig {
        EngineConfig {
            base_delay_ms: 10,
            jitter_fraction: 0.0,
            ..EngineConfig::default()
        }
    }

    fn store(transport: FakeTransport) -> (PreferenceStore, Arc<FakeTransport>) {
        store_with(transport, config())
    }

    fn store_with(transport: FakeTransport, config: EngineConfig) -> (PreferenceStore, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()));
        let store = PreferenceStore::with_clock(transport.clone(), &config, clock);
        (store, transport)
    }

    fn server_doc() -> PreferenceDocument {
        json!({
            "jobTitles": ["Designer"],
            "companies": { "c1": { "name": "Acme" } },
            "subscription": { "plan": "free" },
            "usage": { "exports": 1 },
            "email": "user@example.com"
        })
    }

    fn record_events(store: &PreferenceStore) -> Arc<Mutex<Vec<PreferenceEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[tokio::test]
    async fn test_load_normalizes_and_seeds_detector() {
        let (store, _) = store(FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc()))));

        let doc = store.load().await;

        assert_eq!(doc["jobTitles"], json!(["Designer"]));
        assert_eq!(doc["careerPageLists"].as_object().unwrap().len(), 5);
        assert_eq!(doc["lastSyncedAt"], STAMP);
        assert_eq!(store.state(), SyncState::Idle);
        assert!(!store.is_dirty());
        assert_eq!(store.history()[0].status, HistoryStatus::Success);
    }

    #[tokio::test]
    async fn test_load_repairs_malformed_server_document() {
        let broken = json!({ "companies": [{ "id": "c9", "name": "Initech" }], "jobTitles": "oops" });
        let (store, _) = store(FakeTransport::new().with_load(FakeLoad::Document(Some(broken))));

        let doc = store.load().await;

        assert_eq!(doc["companies"]["c9"]["name"], "Initech");
        assert_eq!(doc["jobTitles"], json!([]));
    }

    #[tokio::test]
    async fn test_load_failure_falls_back_to_defaults() {
        let (store, transport) = store(FakeTransport::new().with_load(FakeLoad::Status(500)));
        let events = record_events(&store);

        let doc = store.load().await;

        assert_eq!(doc, normalize(&default_document()));
        assert_eq!(store.state(), SyncState::Offline);
        assert_eq!(store.history_stats().fallbacks, 1);
        assert!(matches!(events.lock().unwrap()[0], PreferenceEvent::Loaded { fallback: true, .. }));

        // Nothing was confirmed, so the first save goes out
        let outcome = store.save(true).await.unwrap();
        assert!(!outcome.skipped);
        assert_eq!(transport.save_count(), 1);
    }

    #[tokio::test]
    async fn test_update_cannot_touch_server_fields() {
        let (store, _) = store(FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc()))));
        store.load().await;

        let doc = store.update(|doc| {
            doc["subscription"]["plan"] = json!("premium");
            doc["usage"] = json!({ "exports": 0 });
            doc["jobTitles"] = json!(["Animator"]);
        });

        assert_eq!(doc["subscription"]["plan"], "free");
        assert_eq!(doc["usage"]["exports"], 1);
        assert_eq!(doc["jobTitles"], json!(["Animator"]));
        assert!(store.is_dirty());
    }

    #[tokio::test]
    async fn test_update_keeps_deletions() {
        let (store, _) = store(FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc()))));
        store.load().await;

        let doc = store.update(|doc| {
            doc["companies"].as_object_mut().unwrap().remove("c1");
        });

        assert_eq!(doc["companies"], json!({}));
    }

    #[tokio::test]
    async fn test_save_merges_server_response() {
        let response = json!({
            "jobTitles": ["Animator"],
            "subscription": { "plan": "free" },
            "usage": { "exports": 5 }
        });
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .with_default_reply(FakeReply::Saved(Some(response)));
        let (store, transport) = store(transport);
        store.load().await;
        let events = record_events(&store);

        store.update(|doc| doc["jobTitles"] = json!(["Animator"]));
        let outcome = store.save(true).await.unwrap();

        let sent = &transport.saves()[0].payload;
        assert!(sent.get("email").is_none());
        assert!(sent["subscription"].get("plan").is_none());

        let doc = store.document();
        assert_eq!(outcome.document.as_ref(), Some(&doc));
        assert_eq!(doc["jobTitles"], json!(["Animator"]));
        assert_eq!(doc["usage"]["exports"], 5);
        assert_eq!(doc["subscription"]["plan"], "free");
        assert!(!store.is_dirty());

        let events = events.lock().unwrap();
        assert!(matches!(events.last(), Some(PreferenceEvent::Saved { .. })));
    }

    #[tokio::test]
    async fn test_non_object_server_document_keeps_local_copy() {
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .with_default_reply(FakeReply::Saved(Some(json!([]))));
        let (store, transport) = store(transport);
        store.load().await;

        store.update(|doc| doc["jobTitles"] = json!(["Animator"]));
        let outcome = store.save(true).await.unwrap();

        let doc = store.document();
        assert!(!outcome.skipped);
        assert_eq!(doc["jobTitles"], json!(["Animator"]));
        assert_eq!(doc["companies"]["c1"]["name"], "Acme");
        assert_eq!(doc["subscription"]["plan"], "free");
        assert!(!store.is_dirty());

        // Nothing was replaced with defaults, so there is nothing to resend
        let again = store.save(true).await.unwrap();
        assert_eq!(again.reason, Some(SkipReason::Unchanged));
        assert_eq!(transport.save_count(), 1);
    }

    #[tokio::test]
    async fn test_server_added_fields_count_as_synced() {
        let mut response = server_doc();
        response["jobTitles"] = json!(["Animator"]);
        response["settings"] = json!({ "updatedAt": "2026-01-01T11:59:59.000Z" });
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .with_default_reply(FakeReply::Saved(Some(response)));
        let (store, transport) = store(transport);
        store.load().await;

        store.update(|doc| doc["jobTitles"] = json!(["Animator"]));
        store.save(true).await.unwrap();

        let doc = store.document();
        assert_eq!(doc["settings"]["updatedAt"], "2026-01-01T11:59:59.000Z");
        assert_eq!(doc["settings"]["theme"], "light");
        assert!(!store.is_dirty());

        let again = store.save(true).await.unwrap();
        assert!(again.skipped);
        assert_eq!(again.reason, Some(SkipReason::Unchanged));
        assert_eq!(transport.save_count(), 1);
    }

    #[tokio::test]
    async fn test_no_content_leaves_document_alone() {
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .with_default_reply(FakeReply::Unchanged);
        let (store, _) = store(transport);
        store.load().await;

        store.update(|doc| doc["jobTitles"] = json!(["Writer"]));
        let before = store.document();
        let outcome = store.save(true).await.unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.reason, Some(SkipReason::ServerUnchanged));
        assert_eq!(store.document(), before);
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn test_unchanged_document_skips_network() {
        let (store, transport) = store(FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc()))));
        store.load().await;

        let outcome = store.save(true).await.unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.reason, Some(SkipReason::Unchanged));
        assert_eq!(transport.save_count(), 0);
        assert_eq!(store.history_stats().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_edits_coalesce() {
        let (store, transport) = store(FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc()))));
        store.load().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(
                store
                    .update_and_save(|doc| doc["jobTitles"] = json!([format!("Title {}", i)]))
                    .unwrap(),
            );
        }
        let outcomes = futures::future::join_all(handles).await;

        assert_eq!(transport.save_count(), 1);
        assert_eq!(transport.saves()[0].payload["jobTitles"], json!(["Title 4"]));
        assert!(outcomes.iter().all(|o| o.as_ref().map(|o| o.batch_size) == Ok(5)));
        assert_eq!(store.queue_stats().batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_during_flight_survive() {
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .gated();
        let gate = transport.gate();
        let (store, transport) = store(transport);
        store.load().await;

        store.update(|doc| doc["jobTitles"] = json!(["First"]));
        let pending = store.schedule_save().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.state(), SyncState::Saving);

        // Edit while the first save is blocked in the transport
        store.update(|doc| {
            doc["companies"].as_object_mut().unwrap().remove("c1");
        });
        gate.add_permits(1);
        pending.await.unwrap();

        let doc = store.document();
        assert_eq!(doc["jobTitles"], json!(["First"]));
        assert_eq!(doc["companies"], json!({}));
        assert!(store.is_dirty());

        gate.add_permits(1);
        store.save(true).await.unwrap();
        assert_eq!(transport.save_count(), 2);
        assert_eq!(transport.saves()[1].payload["companies"], json!({}));
        assert!(!store.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_response_during_flight_keeps_local_deletion() {
        let echo = json!({
            "jobTitles": ["First"],
            "companies": { "c1": { "name": "Acme" } },
            "subscription": { "plan": "pro" }
        });
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .with_default_reply(FakeReply::Saved(Some(echo)))
            .gated();
        let gate = transport.gate();
        let (store, _) = store(transport);
        store.load().await;

        store.update(|doc| doc["jobTitles"] = json!(["First"]));
        let pending = store.schedule_save().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        store.update(|doc| {
            doc["companies"].as_object_mut().unwrap().remove("c1");
        });
        gate.add_permits(1);
        pending.await.unwrap();

        let doc = store.document();
        assert_eq!(doc["companies"], json!({}));
        assert_eq!(doc["subscription"]["plan"], "pro");
        assert!(store.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failure_reported() {
        let transport = FakeTransport::new()
            .with_load(FakeLoad::Document(Some(server_doc())))
            .with_default_reply(FakeReply::Status(502));
        let (store, transport) = store(transport);
        store.load().await;
        let events = record_events(&store);

        store.update(|doc| doc["jobTitles"] = json!(["Lost?"]));
        let result = store.save(true).await;

        assert!(matches!(result, Err(SyncError::Transport { status: Some(502), .. })));
        assert_eq!(transport.save_count(), 3);
        assert_eq!(store.state(), SyncState::Error);
        assert!(store.is_dirty());
        assert_eq!(store.document()["jobTitles"], json!(["Lost?"]));
        assert!(matches!(events.lock().unwrap().last(), Some(PreferenceEvent::SaveFailed { .. })));
    }

    #[tokio::test]
    async fn test_oversized_document_rejected() {
        let config = EngineConfig {
            max_payload_bytes: 512,
            ..config()
        };
        let (store, transport) = store_with(FakeTransport::new(), config);

        store.update(|doc| doc["notes"] = json!("x".repeat(1024)));
        let result = store.save(true).await;

        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(transport.save_count(), 0);
        assert_eq!(store.queue_stats().pending, 0);
    }

    #[tokio::test]
    async fn test_refresh_adopts_server_when_clean() {
        let transport = FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc())));
        let (store, transport) = store(transport);
        store.load().await;

        let mut elsewhere = server_doc();
        elsewhere["jobTitles"] = json!(["Edited on another device"]);
        elsewhere["subscription"]["plan"] = json!("premium");
        transport.set_load(FakeLoad::Document(Some(elsewhere)));

        let doc = store.refresh().await.unwrap();

        assert_eq!(doc["jobTitles"], json!(["Edited on another device"]));
        assert_eq!(doc["subscription"]["plan"], "premium");
        assert!(!store.is_dirty());
        assert_eq!(transport.load_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_keeps_unsaved_edits() {
        let transport = FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc())));
        let (store, transport) = store(transport);
        store.load().await;
        store.update(|doc| doc["jobTitles"] = json!(["Local draft"]));

        let mut elsewhere = server_doc();
        elsewhere["jobTitles"] = json!(["Remote"]);
        elsewhere["subscription"]["plan"] = json!("pro");
        transport.set_load(FakeLoad::Document(Some(elsewhere)));

        let doc = store.refresh().await.unwrap();

        assert_eq!(doc["jobTitles"], json!(["Local draft"]));
        assert_eq!(doc["subscription"]["plan"], "pro");
        assert!(store.is_dirty());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_document() {
        let transport = FakeTransport::new().with_load(FakeLoad::Document(Some(server_doc())));
        let (store, transport) = store(transport);
        let loaded = store.load().await;

        transport.set_load(FakeLoad::Status(503));
        assert!(store.refresh().await.is_err());
        assert_eq!(store.document(), loaded);
        assert_eq!(store.history_stats().failures, 1);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (store, _) = store(FakeTransport::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = store.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        assert_eq!(store.subscriber_count(), 1);

        store.update(|doc| doc["jobTitles"] = json!(["One"]));
        subscription.unsubscribe();
        store.update(|doc| doc["jobTitles"] = json!(["Two"]));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].document().unwrap()["jobTitles"], json!(["One"]));
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_may_read_store() {
        let (store, _) = store(FakeTransport::new());
        let seen = Arc::new(Mutex::new(None));
        let reader = store.clone();
        let slot = seen.clone();
        store.subscribe(move |_| *slot.lock().unwrap() = Some(reader.document()));

        store.update(|doc| doc["jobTitles"] = json!(["Visible"]));

        let seen = seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen["jobTitles"], json!(["Visible"]));
    }
}
