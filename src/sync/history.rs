//! Sync History - Bounded in-memory record of sync operations
//!
//! Keeps the most recent loads, saves and refreshes with their outcome and
//! the digest that was in sync afterwards. Used for diagnostics only; the
//! history is never persisted and is lost when the store is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ============================================================================
// Types & Structures
// ============================================================================

/// Sync operation type for history tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Load,
    Save,
    Refresh,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Load => "load",
            SyncOperation::Save => "save",
            SyncOperation::Refresh => "refresh",
        }
    }
}

/// Outcome of a recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    /// Save resolved without the server applying anything
    Skipped,
    Failed,
    /// Load failed and local defaults were used
    Fallback,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Success => "success",
            HistoryStatus::Skipped => "skipped",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Fallback => "fallback",
        }
    }
}

/// A single history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub operation: SyncOperation,
    pub status: HistoryStatus,
    /// Synced digest after the operation, when one was recorded
    pub digest: Option<String>,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl HistoryEntry {
    pub fn new(operation: SyncOperation, status: HistoryStatus, at: DateTime<Utc>) -> Self {
        Self {
            operation,
            status,
            digest: None,
            at,
            detail: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// History statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: usize,
    pub successes: usize,
    pub skipped: usize,
    pub failures: usize,
    pub fallbacks: usize,
    pub last_success_at: Option<DateTime<Utc>>,
}

// ============================================================================
// History Ring
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest once full
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        log::debug!(
            "History: {} {}{}",
            entry.operation.as_str(),
            entry.status.as_str(),
            entry.detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default()
        );
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries, oldest first
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            total: self.entries.len(),
            ..HistoryStats::default()
        };
        for entry in &self.entries {
            match entry.status {
                HistoryStatus::Success => {
                    stats.successes += 1;
                    stats.last_success_at = Some(entry.at);
                }
                HistoryStatus::Skipped => stats.skipped += 1,
                HistoryStatus::Failed => stats.failures += 1,
                HistoryStatus::Fallback => stats.fallbacks += 1,
            }
        }
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
