#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-dlq** – Dead-Letter Queue (spec §4.8).
//!
//! Holds event payloads that exhausted retry, or failed permanently inside a
//! batch where sibling events succeeded. Exposes a small status-lifecycle
//! state machine plus admin list/get/retry/discard operations, following the
//! same small-trait-plus-in-memory-store shape as the revocation list.
//!
//! Re-invoking the ingestion pipeline on retry (with a fresh sequence-id
//! allocation, per spec §4.8) is the caller's job — this crate only owns the
//! entry's lifecycle and storage.

use chrono::{DateTime, Utc};
use eld_types::DeviceId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifies a DLQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DlqEntryId(pub Uuid);

/// Status lifecycle (spec §4.8): `pending -> retrying -> (resolved | pending)`
/// on admin retry; `pending -> discarded` on admin discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Awaiting admin action.
    Pending,
    /// An admin-triggered retry is currently in flight.
    Retrying,
    /// Terminal: the retry succeeded.
    Resolved,
    /// Terminal: an admin discarded the entry without resolving it.
    Discarded,
}

impl DlqStatus {
    /// `resolved` and `discarded` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DlqStatus::Resolved | DlqStatus::Discarded)
    }
}

/// A full dead-letter entry, including the original payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Unique identifier.
    pub id: DlqEntryId,
    /// The event payload that failed to commit, as received.
    pub original_payload: serde_json::Value,
    /// Device the payload originated from.
    pub source_device_id: DeviceId,
    /// The endpoint/operation that attempted to process it (`/events`, `/sync/events`, ...).
    pub source_endpoint: String,
    /// Index within the originating batch, if the failure occurred mid-batch.
    pub batch_index: Option<usize>,
    /// Human-readable description of the failure.
    pub failure_reason: String,
    /// Number of retry attempts made so far (not counting the original failure).
    pub retry_count: u32,
    /// When the entry first failed.
    pub first_failure_at: DateTime<Utc>,
    /// When the entry most recently failed.
    pub last_failure_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: DlqStatus,
    /// Admin actor who resolved or discarded this entry, if any.
    pub resolved_by: Option<String>,
    /// Admin-supplied notes on discard or resolution.
    pub resolution_notes: Option<String>,
}

/// A DLQ entry without its payload, for bandwidth-conscious listing (spec §4.8 `list`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntrySummary {
    /// Unique identifier.
    pub id: DlqEntryId,
    /// Device the payload originated from.
    pub source_device_id: DeviceId,
    /// The endpoint/operation that attempted to process it.
    pub source_endpoint: String,
    /// Human-readable description of the failure.
    pub failure_reason: String,
    /// Number of retry attempts made so far.
    pub retry_count: u32,
    /// When the entry first failed.
    pub first_failure_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: DlqStatus,
}

impl From<&DlqEntry> for DlqEntrySummary {
    fn from(entry: &DlqEntry) -> Self {
        Self {
            id: entry.id,
            source_device_id: entry.source_device_id,
            source_endpoint: entry.source_endpoint.clone(),
            failure_reason: entry.failure_reason.clone(),
            retry_count: entry.retry_count,
            first_failure_at: entry.first_failure_at,
            status: entry.status,
        }
    }
}

/// Input for enqueuing a new entry.
#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    /// The event payload that failed to commit.
    pub original_payload: serde_json::Value,
    /// Device the payload originated from.
    pub source_device_id: DeviceId,
    /// The endpoint/operation that attempted to process it.
    pub source_endpoint: String,
    /// Index within the originating batch, if applicable.
    pub batch_index: Option<usize>,
    /// Human-readable description of the failure.
    pub failure_reason: String,
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    /// Restrict to entries with this status.
    pub status: Option<DlqStatus>,
    /// Restrict to entries from this device.
    pub device_id: Option<DeviceId>,
    /// Restrict to entries from this endpoint.
    pub endpoint: Option<String>,
}

/// Offset/limit pagination for `list`.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// Number of entries to skip.
    pub offset: usize,
    /// Maximum number of entries to return.
    pub limit: usize,
}

/// Aggregate counts per status (spec §4.8 `stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqStats {
    /// Count of `pending` entries.
    pub pending: usize,
    /// Count of `retrying` entries.
    pub retrying: usize,
    /// Count of `resolved` entries.
    pub resolved: usize,
    /// Count of `discarded` entries.
    pub discarded: usize,
    /// Total entries across all statuses.
    pub total: usize,
    /// `true` if `pending` exceeds the configured alert threshold.
    pub alert_threshold_exceeded: bool,
}

/// Errors from DLQ operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DlqError {
    /// No entry with this id.
    #[error("dlq entry {0:?} not found")]
    NotFound(DlqEntryId),
    /// The entry is not `pending`, so it cannot be retried or discarded.
    #[error("dlq entry {0:?} is not pending")]
    NotPending(DlqEntryId),
    /// The entry is not `retrying`, so a retry outcome cannot be recorded.
    #[error("dlq entry {0:?} is not retrying")]
    NotRetrying(DlqEntryId),
}

/// In-memory dead-letter queue. A production deployment persists this
/// alongside the event store (`toka-store-sqlite`-style), but the lifecycle
/// rules live here regardless of backend.
#[derive(Debug, Default)]
pub struct MemoryDlqStore {
    entries: Mutex<HashMap<DlqEntryId, DlqEntry>>,
}

impl MemoryDlqStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a new `pending` entry.
    pub fn enqueue(&self, new_entry: NewDlqEntry) -> DlqEntryId {
        let id = DlqEntryId(Uuid::new_v4());
        let now = Utc::now();
        let entry = DlqEntry {
            id,
            original_payload: new_entry.original_payload,
            source_device_id: new_entry.source_device_id,
            source_endpoint: new_entry.source_endpoint,
            batch_index: new_entry.batch_index,
            failure_reason: new_entry.failure_reason,
            retry_count: 0,
            first_failure_at: now,
            last_failure_at: now,
            status: DlqStatus::Pending,
            resolved_by: None,
            resolution_notes: None,
        };
        self.entries.lock().insert(id, entry);
        id
    }

    /// List entry summaries matching `filter`, paginated.
    pub fn list(&self, filter: &DlqFilter, pagination: Pagination) -> Vec<DlqEntrySummary> {
        let entries = self.entries.lock();
        let mut matching: Vec<&DlqEntry> = entries
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| filter.device_id.is_none_or(|d| e.source_device_id == d))
            .filter(|e| filter.endpoint.as_ref().is_none_or(|ep| &e.source_endpoint == ep))
            .collect();
        matching.sort_by_key(|e| e.first_failure_at);
        matching
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .map(DlqEntrySummary::from)
            .collect()
    }

    /// Fetch a full entry, including payload.
    pub fn get(&self, id: DlqEntryId) -> Option<DlqEntry> {
        self.entries.lock().get(&id).cloned()
    }

    /// `pending -> retrying`. Returns the full entry so the caller can
    /// re-invoke ingestion with its payload and a fresh sequence-id.
    pub fn begin_retry(&self, id: DlqEntryId) -> Result<DlqEntry, DlqError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if entry.status != DlqStatus::Pending {
            return Err(DlqError::NotPending(id));
        }
        entry.status = DlqStatus::Retrying;
        Ok(entry.clone())
    }

    /// Record that a `retrying` entry's re-ingestion succeeded: `retrying -> resolved`.
    pub fn mark_resolved(&self, id: DlqEntryId, resolved_by: String) -> Result<(), DlqError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if entry.status != DlqStatus::Retrying {
            return Err(DlqError::NotRetrying(id));
        }
        entry.status = DlqStatus::Resolved;
        entry.resolved_by = Some(resolved_by);
        Ok(())
    }

    /// Record that a `retrying` entry's re-ingestion failed again:
    /// `retrying -> pending`, with `retry_count` incremented.
    pub fn mark_retry_failed(&self, id: DlqEntryId, failure_reason: String) -> Result<(), DlqError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if entry.status != DlqStatus::Retrying {
            return Err(DlqError::NotRetrying(id));
        }
        entry.status = DlqStatus::Pending;
        entry.retry_count += 1;
        entry.failure_reason = failure_reason;
        entry.last_failure_at = Utc::now();
        Ok(())
    }

    /// `pending -> discarded`.
    pub fn discard(&self, id: DlqEntryId, notes: String) -> Result<(), DlqError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if entry.status != DlqStatus::Pending {
            return Err(DlqError::NotPending(id));
        }
        entry.status = DlqStatus::Discarded;
        entry.resolution_notes = Some(notes);
        Ok(())
    }

    /// Aggregate counts per status.
    pub fn stats(&self, alert_threshold: usize) -> DlqStats {
        let entries = self.entries.lock();
        let mut stats = DlqStats {
            pending: 0,
            retrying: 0,
            resolved: 0,
            discarded: 0,
            total: entries.len(),
            alert_threshold_exceeded: false,
        };
        for entry in entries.values() {
            match entry.status {
                DlqStatus::Pending => stats.pending += 1,
                DlqStatus::Retrying => stats.retrying += 1,
                DlqStatus::Resolved => stats.resolved += 1,
                DlqStatus::Discarded => stats.discarded += 1,
            }
        }
        stats.alert_threshold_exceeded = stats.pending > alert_threshold;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(device: DeviceId) -> NewDlqEntry {
        NewDlqEntry {
            original_payload: serde_json::json!({"sequenceId": 12}),
            source_device_id: device,
            source_endpoint: "/sync/events".into(),
            batch_index: Some(3),
            failure_reason: "deadlock detected".into(),
        }
    }

    #[test]
    fn enqueue_then_get_returns_full_payload() {
        let store = MemoryDlqStore::new();
        let device = DeviceId(Uuid::new_v4());
        let id = store.enqueue(sample_entry(device));
        let entry = store.get(id).unwrap();
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.original_payload["sequenceId"], 12);
    }

    #[test]
    fn list_omits_payload() {
        let store = MemoryDlqStore::new();
        let device = DeviceId(Uuid::new_v4());
        store.enqueue(sample_entry(device));
        let summaries = store.list(&DlqFilter::default(), Pagination { offset: 0, limit: 10 });
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].source_endpoint, "/sync/events");
    }

    #[test]
    fn retry_then_resolve_full_cycle() {
        let store = MemoryDlqStore::new();
        let device = DeviceId(Uuid::new_v4());
        let id = store.enqueue(sample_entry(device));

        let entry = store.begin_retry(id).unwrap();
        assert_eq!(entry.status, DlqStatus::Retrying);

        store.mark_resolved(id, "admin@example.com".into()).unwrap();
        let resolved = store.get(id).unwrap();
        assert_eq!(resolved.status, DlqStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("admin@example.com"));
    }

    #[test]
    fn failed_retry_returns_to_pending_with_incremented_count() {
        let store = MemoryDlqStore::new();
        let device = DeviceId(Uuid::new_v4());
        let id = store.enqueue(sample_entry(device));

        store.begin_retry(id).unwrap();
        store.mark_retry_failed(id, "still deadlocked".into()).unwrap();

        let entry = store.get(id).unwrap();
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.failure_reason, "still deadlocked");
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let store = MemoryDlqStore::new();
        let device = DeviceId(Uuid::new_v4());
        let id = store.enqueue(sample_entry(device));
        store.discard(id, "not recoverable".into()).unwrap();

        assert_eq!(store.begin_retry(id).unwrap_err(), DlqError::NotPending(id));
        assert_eq!(store.discard(id, "again".into()).unwrap_err(), DlqError::NotPending(id));
    }

    #[test]
    fn stats_counts_by_status_and_flags_alert() {
        let store = MemoryDlqStore::new();
        let device = DeviceId(Uuid::new_v4());
        for _ in 0..3 {
            store.enqueue(sample_entry(device));
        }
        let stats = store.stats(2);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.total, 3);
        assert!(stats.alert_threshold_exceeded);
    }
}
