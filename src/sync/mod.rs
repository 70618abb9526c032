//! Sync Module - Preference document synchronization
//!
//! Keeps one JSON preference document in step with the backend:
//! - Normalization: every document is repaired to the full shape
//! - Ownership: server-authoritative fields are never taken from the client
//! - Change detection: digests of the editable projection skip no-op saves
//! - Save queue: debounced, coalesced, single-flight writes with backoff
//!
//! `PreferenceStore` is the entry point; the rest is exposed for reuse and tests.

pub mod api;
pub mod clock;
pub mod digest;
pub mod error;
pub mod history;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test_support;


// Re-export commonly used types
pub use api::{PreferenceTransport, SaveResponse, SyncApiClient, SyncApiError};
pub use clock::{Clock, FixedClock, SystemClock};
pub use digest::{ChangeDetector, DigestToken};
pub use error::SyncError;
pub use history::{HistoryEntry, HistoryStats, HistoryStatus, SyncHistory, SyncOperation};
pub use merge::{merge, outgoing_payload, with_server_fields};
pub use models::{FieldPath, Plan, PreferenceDocument, SaveOutcome, SkipReason, SyncState};
pub use normalize::{normalize, stamp_synced, violations};
pub use queue::{QueueConfig, QueueStats, SaveHandle, SaveQueue};
pub use retry::{RetryPolicy, Retryable};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use store::{PreferenceEvent, PreferenceStore, Subscription};
