#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-store-core** – Event Store Adapter trait (spec §4.9).
//!
//! Abstracts the partitioned event table so `eld-ingest`/`eld-sync` never
//! talk to a concrete database. Concrete backends (`eld-store-sqlite`) carry
//! the partitioning/index contract; this crate only states it: every query
//! takes a [`TimeRange`], since the backing table is physically partitioned
//! by event-timestamp month.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eld_events_core::{Event, LogPeriod};
use eld_sequence::{Scope, SequenceIdState};
use eld_types::{CarrierId, DriverId};

/// A mandatory timestamp range predicate (spec §4.9 partitioning contract).
/// Every query against the event table is scoped to a range so the backend
/// can prune partitions instead of scanning the whole table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub from: DateTime<Utc>,
    /// Exclusive upper bound.
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// Construct a range, rejecting an inverted (`to <= from`) bound up front
    /// rather than letting it silently match nothing.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, StorageError> {
        if to <= from {
            return Err(StorageError::InvalidPartitionRange { from, to });
        }
        Ok(Self { from, to })
    }
}

/// Pagination/limit controls for range queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Maximum rows to return. `None` means unbounded (still constrained by
    /// the mandatory [`TimeRange`]).
    pub limit: Option<usize>,
}

/// Expected-vs-actual sequence coverage for a scope (spec §4.9 `detectGaps`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapReport {
    /// Highest sequence id that should exist, per the sequence allocator's
    /// `last_issued_id`.
    pub expected_count: u32,
    /// Sequence ids in `1..=expected_count` with no corresponding committed event.
    pub missing: Vec<u32>,
}

/// Errors from the event store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A query's [`TimeRange`] had `to <= from`.
    #[error("invalid partition range: from={from} to={to}")]
    InvalidPartitionRange {
        /// The rejected lower bound.
        from: DateTime<Utc>,
        /// The rejected upper bound.
        to: DateTime<Utc>,
    },
    /// An active event already occupies this `(device, log_period, sequence_id)`.
    #[error("unique constraint violated for scope {0:?} sequence {1}")]
    DuplicateActiveSequence(Scope, u32),
    /// No event with this id.
    #[error("event not found: {0}")]
    EventNotFound(uuid::Uuid),
    /// The backend failed for a reason outside this adapter's control.
    #[error("storage backend error: {0}")]
    BackendError(String),
}

/// Abstraction over the partitioned event table (spec §4.9).
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Persist `event`. Transactional: atomic with the caller's sequence-state
    /// update, since both must survive or neither does.
    async fn insert(&self, event: &Event) -> Result<(), StorageError>;

    /// Persist `event` and `scope`'s updated sequence-allocator state in one
    /// transaction, so a crash or backend error between the two can never
    /// leave `event` committed with `last_issued_id` unadvanced (which would
    /// let a later `issue()` reallocate the same id).
    async fn insert_with_sequence_state(
        &self,
        event: &Event,
        scope: &Scope,
        state: SequenceIdState,
    ) -> Result<(), StorageError>;

    /// Events in `scope`, ordered by ascending sequence id.
    async fn find_by_scope(
        &self,
        scope: &Scope,
        range: TimeRange,
        opts: FindOptions,
    ) -> Result<Vec<Event>, StorageError>;

    /// The highest-sequence active event in `scope`, for chain linking.
    /// `range` bounds the partition scan the same as every other query.
    async fn find_prior_for_chain(
        &self,
        scope: &Scope,
        range: TimeRange,
    ) -> Result<Option<Event>, StorageError>;

    /// Events for `carrier_id` updated after `after`, within `range` — used
    /// to deliver server-side edits during sync (spec §4.6 step 4).
    async fn find_by_carrier_updated_after(
        &self,
        carrier_id: CarrierId,
        after: DateTime<Utc>,
        range: TimeRange,
    ) -> Result<Vec<Event>, StorageError>;

    /// Gaps between 1 and `last_issued_id` with no committed event, within `range`.
    async fn detect_gaps(
        &self,
        scope: &Scope,
        last_issued_id: u32,
        range: TimeRange,
    ) -> Result<GapReport, StorageError>;
}

/// Persists the `sequence_id_states` table (spec §6): one counter per
/// `(device_id, log_date)` scope. Mutated only under the caller's per-scope
/// lock (spec §5).
#[async_trait]
pub trait SequenceStateStore: Send + Sync + 'static {
    /// Fetch a scope's state, defaulting to a fresh counter if none exists.
    async fn get(&self, scope: &Scope) -> Result<SequenceIdState, StorageError>;

    /// Persist a scope's updated state.
    async fn put(&self, scope: &Scope, state: SequenceIdState) -> Result<(), StorageError>;
}

/// Persists the `log_periods` table (spec §6): one row per
/// `(driver_id, log_date)`.
#[async_trait]
pub trait LogPeriodStore: Send + Sync + 'static {
    /// Return the existing log period for `(driver_id, log_date)`, creating
    /// an `open` one if none exists yet.
    async fn find_or_create(
        &self,
        driver_id: DriverId,
        log_date: &str,
    ) -> Result<LogPeriod, StorageError>;

    /// Update a log period's status/count/certification fields.
    async fn update(&self, log_period: &LogPeriod) -> Result<(), StorageError>;
}
