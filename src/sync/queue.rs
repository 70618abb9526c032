//! Save Queue - Debounced, coalescing, one-batch-at-a-time writes
//!
//! Every save request lands here. Requests arriving within the debounce
//! window are absorbed into one batch; only the newest payload of a batch
//! is transmitted and its outcome resolves every request in the batch.
//!
//! Features:
//! - Debounce timer re-armed on each enqueue
//! - Latest-wins coalescing with shared outcome
//! - At most one batch in flight (async mutex, released on every exit path)
//! - Change detection before transmission (no-op saves never hit the network)
//! - Bounded exponential backoff via `RetryPolicy`
//! - Queue status reporting (pending, in-flight, batch counters)

use super::api::{PreferenceTransport, SaveResponse};
use super::digest::{ChangeDetector, DigestToken};
use super::error::SyncError;
use super::merge::outgoing_payload;
use super::models::{PreferenceDocument, SaveOutcome, SkipReason};
use super::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_DEBOUNCE_MS: u64 = 350;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

// ============================================================================
// Data Types
// ============================================================================

type BatchResult = Result<SaveOutcome, SyncError>;

/// A queued save request. Lives only until its batch settles.
struct SaveQueueEntry {
    id: u64,
    payload: PreferenceDocument,
    responder: oneshot::Sender<BatchResult>,
    enqueued_at: Instant,
    retry_count: u32,
}

/// Resolves once the batch containing the request settles.
#[derive(Debug)]
pub struct SaveHandle {
    id: u64,
    receiver: oneshot::Receiver<BatchResult>,
}

impl SaveHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for SaveHandle {
    type Output = BatchResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SyncError::QueueClosed)))
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: bool,
    pub batches_sent: u64,
    pub batches_skipped: u64,
    pub batches_failed: u64,
    pub entries_resolved: u64,
    pub last_batch_size: usize,
    /// Retries the most recent batch needed before it settled
    pub last_batch_retries: u32,
}

/// Queue tuning
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub debounce: Duration,
    pub retry: RetryPolicy,
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            retry: RetryPolicy::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Receives batch lifecycle callbacks; implemented by the preference store.
pub trait BatchSink: Send + Sync {
    /// A batch of `batch_size` requests is about to be checked and sent
    fn batch_started(&self, _batch_size: usize) {}

    /// Merge the server's copy into the live document and return the result.
    /// `sent` is the payload the server just accepted.
    fn apply_server_document(&self, server_doc: PreferenceDocument, sent: &PreferenceDocument) -> PreferenceDocument;

    /// The batch settled; `synced` is the digest now known to match the server
    fn batch_settled(&self, _result: &BatchResult, _synced: Option<&DigestToken>) {}
}

// ============================================================================
// Save Queue
// ============================================================================

/// Debounced single-flight save queue
#[derive(Clone)]
pub struct SaveQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pending: Mutex<VecDeque<SaveQueueEntry>>,
    /// Held for the whole time a batch is being drained
    drain_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    detector: Arc<Mutex<ChangeDetector>>,
    transport: Arc<dyn PreferenceTransport>,
    sink: Arc<dyn BatchSink>,
    config: QueueConfig,
    next_id: AtomicU64,
    stats: Mutex<QueueStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reject payloads that cannot be sent: not a document, or over the size ceiling.
pub fn validate_payload(payload: &Value, max_bytes: usize) -> Result<(), SyncError> {
    if !payload.is_object() {
        return Err(SyncError::Validation("payload must be a JSON object".to_string()));
    }

    let size = serde_json::to_vec(payload)
        .map_err(|e| SyncError::Validation(format!("payload not serializable: {}", e)))?
        .len();

    if size > max_bytes {
        return Err(SyncError::Validation(format!(
            "payload is {} bytes, limit is {}",
            size, max_bytes
        )));
    }

    Ok(())
}

impl SaveQueue {
    /// Create new save queue. Must be used from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn PreferenceTransport>,
        detector: Arc<Mutex<ChangeDetector>>,
        sink: Arc<dyn BatchSink>,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
                detector,
                transport,
                sink,
                config,
                next_id: AtomicU64::new(1),
                stats: Mutex::new(QueueStats::default()),
            }),
        }
    }

    /// Queue `payload` and (re)start the debounce window.
    pub fn enqueue(&self, payload: PreferenceDocument) -> Result<SaveHandle, SyncError> {
        let handle = self.push(payload)?;
        self.arm_timer();
        Ok(handle)
    }

    /// Queue `payload` and drain right away, skipping the debounce window.
    /// A batch already in flight still finishes first.
    pub async fn save_now(&self, payload: PreferenceDocument) -> BatchResult {
        let handle = self.push(payload)?;
        self.cancel_timer();
        tokio::spawn(QueueInner::drain(self.inner.clone()));
        handle.await
    }

    /// Drain whatever is pending without waiting for the debounce window.
    pub async fn flush(&self) {
        self.cancel_timer();
        let drain = tokio::spawn(QueueInner::drain(self.inner.clone()));
        if let Err(e) = drain.await {
            log::error!("Save queue drain task failed: {}", e);
        }
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = lock(&self.inner.stats).clone();
        stats.pending = lock(&self.inner.pending).len();
        stats
    }

    pub fn debounce_window(&self) -> Duration {
        self.inner.config.debounce
    }

    fn push(&self, payload: PreferenceDocument) -> Result<SaveHandle, SyncError> {
        validate_payload(&payload, self.inner.config.max_payload_bytes)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();

        lock(&self.inner.pending).push_back(SaveQueueEntry {
            id,
            payload,
            responder,
            enqueued_at: Instant::now(),
            retry_count: 0,
        });

        log::debug!("Queued save request {}", id);
        Ok(SaveHandle { id, receiver })
    }

    fn arm_timer(&self) {
        let mut timer = lock(&self.inner.timer);
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let inner = self.inner.clone();
        let window = inner.config.debounce;
        // The timer task only sleeps; the drain runs in its own task so a
        // later re-arm can never cancel a batch mid-flight.
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tokio::spawn(QueueInner::drain(inner));
        }));
    }

    fn cancel_timer(&self) {
        if let Some(previous) = lock(&self.inner.timer).take() {
            previous.abort();
        }
    }
}

impl QueueInner {
    /// Drain batches until the pending list is empty. Returns at once if
    /// another drain holds the lock; that drain picks up new entries.
    async fn drain(inner: Arc<QueueInner>) {
        loop {
            {
                let Ok(_guard) = inner.drain_lock.try_lock() else {
                    log::debug!("Save batch already in flight, new entries will follow it");
                    return;
                };

                lock(&inner.stats).in_flight = true;
                loop {
                    let batch: Vec<SaveQueueEntry> = lock(&inner.pending).drain(..).collect();
                    if batch.is_empty() {
                        break;
                    }
                    inner.process_batch(batch).await;
                }
                lock(&inner.stats).in_flight = false;
            }

            // An entry may have been queued between the last check and the
            // release; drain again unless someone else took over.
            if lock(&inner.pending).is_empty() {
                return;
            }
        }
    }

    async fn process_batch(&self, mut batch: Vec<SaveQueueEntry>) {
        let batch_size = batch.len();
        let Some(latest) = batch.last() else {
            return;
        };
        let payload = latest.payload.clone();
        let oldest_wait = batch
            .first()
            .map(|entry| entry.enqueued_at.elapsed())
            .unwrap_or_default();

        log::debug!(
            "Draining save batch of {} (latest request {}, oldest waited {}ms)",
            batch_size,
            latest.id,
            oldest_wait.as_millis()
        );

        self.sink.batch_started(batch_size);

        let attempts = AtomicU32::new(0);
        let (result, synced) = self.transmit(&payload, batch_size, &attempts).await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        for entry in batch.iter_mut() {
            entry.retry_count = retries;
        }
        if retries > 0 {
            log::debug!("Save batch settled after {} retries", retries);
        }

        {
            let mut stats = lock(&self.stats);
            match &result {
                Ok(outcome) if outcome.skipped => stats.batches_skipped += 1,
                Ok(_) => stats.batches_sent += 1,
                Err(_) => stats.batches_failed += 1,
            }
            stats.entries_resolved += batch_size as u64;
            stats.last_batch_size = batch_size;
            stats.last_batch_retries = batch.iter().map(|entry| entry.retry_count).max().unwrap_or(0);
        }

        self.sink.batch_settled(&result, synced.as_ref());

        for entry in batch {
            if entry.responder.send(result.clone()).is_err() {
                log::debug!("Save request {} was abandoned by its caller", entry.id);
            }
        }
    }

    async fn transmit(
        &self,
        payload: &PreferenceDocument,
        batch_size: usize,
        attempts: &AtomicU32,
    ) -> (BatchResult, Option<DigestToken>) {
        let dirty = lock(&self.detector).is_dirty(payload);
        if !dirty {
            log::debug!("Preferences unchanged since last sync, skipping save");
            return (Ok(SaveOutcome::skipped(SkipReason::Unchanged, batch_size)), None);
        }

        let outgoing = outgoing_payload(payload);
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let transport = &self.transport;

        let response = self
            .config
            .retry
            .execute("Preferences save", |_| {
                attempts.fetch_add(1, Ordering::Relaxed);
                transport.save(&outgoing, &idempotency_key)
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                log::error!("Preferences save failed: {}", e);
                return (Err(SyncError::from(e)), None);
            }
        };

        let mut synced = lock(&self.detector).mark_synced(payload);

        let outcome = match response {
            SaveResponse::Unchanged => {
                log::info!("Server already holds these preferences");
                SaveOutcome::skipped(SkipReason::ServerUnchanged, batch_size)
            }
            SaveResponse::Saved { document: Some(server_doc) } => {
                let merged = self.sink.apply_server_document(server_doc, payload);
                // The sink may have advanced the synced digest past the payload
                if let Some(token) = lock(&self.detector).last_synced().cloned() {
                    synced = token;
                }
                log::info!("Preferences saved, server copy merged (batch of {})", batch_size);
                SaveOutcome::saved(Some(merged), batch_size)
            }
            SaveResponse::Saved { document: None } => {
                log::info!("Preferences saved (batch of {})", batch_size);
                SaveOutcome::saved(None, batch_size)
            }
        };

        (Ok(outcome), Some(synced))
    }
}

// ============================================================================
// Tests
// ============================================================================
