//! Unidentified-driving bookkeeping (SPEC_FULL §3.1).
//!
//! Engine-on driving with no logged-in driver must be claimed or rejected
//! within 8 days; a `pending` record older than that is a compliance
//! violation. This mirrors the DLQ's "hold for human disposition" shape
//! (spec §4.8) rather than introducing new infrastructure.

use chrono::{DateTime, Utc};
use eld_types::{DriverId, VehicleId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Age threshold past which a pending record is a compliance violation.
pub const STALE_THRESHOLD_DAYS: i64 = 8;

/// Disposition status of an unidentified-driving record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnidentifiedStatus {
    /// Awaiting driver claim or admin rejection.
    Pending,
    /// A driver has claimed this driving segment.
    Claimed,
    /// Rejected as not attributable to any driver.
    Rejected,
}

/// Engine-on driving recorded with no logged-in driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnidentifiedDrivingRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Vehicle that was driven.
    pub vehicle_id: VehicleId,
    /// Start of the unidentified driving segment.
    pub start: DateTime<Utc>,
    /// End of the unidentified driving segment.
    pub end: DateTime<Utc>,
    /// Accumulated miles over the segment.
    pub accumulated_miles: u64,
    /// Disposition status.
    pub status: UnidentifiedStatus,
    /// Driver who claimed the segment, if claimed.
    pub claimed_by: Option<DriverId>,
    /// Admin-supplied reason, if rejected (mirrors `eld-dlq`'s `resolution_notes`).
    pub rejection_reason: Option<String>,
}

/// Errors returned by unidentified-driving disposition operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnidentifiedError {
    /// No record with this id.
    #[error("unidentified driving record {0} not found")]
    NotFound(Uuid),
    /// The record is not in `pending` status and so cannot be claimed or
    /// rejected again.
    #[error("unidentified driving record {0} is not pending")]
    NotPending(Uuid),
}

impl UnidentifiedDrivingRecord {
    /// Record a new pending unidentified-driving segment.
    pub fn new(
        id: Uuid,
        vehicle_id: VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        accumulated_miles: u64,
    ) -> Self {
        Self {
            id,
            vehicle_id,
            start,
            end,
            accumulated_miles,
            status: UnidentifiedStatus::Pending,
            claimed_by: None,
            rejection_reason: None,
        }
    }

    /// Transition `pending -> claimed`, attributing the segment to `driver_id`.
    pub fn claim(&mut self, driver_id: DriverId) -> Result<(), UnidentifiedError> {
        if self.status != UnidentifiedStatus::Pending {
            return Err(UnidentifiedError::NotPending(self.id));
        }
        self.status = UnidentifiedStatus::Claimed;
        self.claimed_by = Some(driver_id);
        Ok(())
    }

    /// Transition `pending -> rejected`, recording why.
    pub fn reject(&mut self, reason: String) -> Result<(), UnidentifiedError> {
        if self.status != UnidentifiedStatus::Pending {
            return Err(UnidentifiedError::NotPending(self.id));
        }
        self.status = UnidentifiedStatus::Rejected;
        self.rejection_reason = Some(reason);
        Ok(())
    }

    /// True if this record is `pending` and older than `older_than_days`.
    pub fn is_stale_violation(&self, now: DateTime<Utc>, older_than_days: i64) -> bool {
        self.status == UnidentifiedStatus::Pending && (now - self.end).num_days() > older_than_days
    }
}

/// In-memory store of unidentified-driving records, following the same
/// small-trait-plus-in-memory-store shape as the dead-letter queue: a
/// `Mutex<HashMap<_, _>>` behind admin-disposition operations.
#[derive(Debug, Default)]
pub struct MemoryUnidentifiedStore {
    records: Mutex<HashMap<Uuid, UnidentifiedDrivingRecord>>,
}

impl MemoryUnidentifiedStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending unidentified-driving segment.
    pub fn record_unidentified_driving(
        &self,
        vehicle_id: VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        accumulated_miles: u64,
    ) -> Uuid {
        let record = UnidentifiedDrivingRecord::new(Uuid::new_v4(), vehicle_id, start, end, accumulated_miles);
        let id = record.id;
        self.records.lock().insert(id, record);
        id
    }

    /// Fetch a record by id.
    pub fn get(&self, id: Uuid) -> Option<UnidentifiedDrivingRecord> {
        self.records.lock().get(&id).cloned()
    }

    /// `pending -> claimed`, attributing the segment to `driver_id`.
    pub fn claim(&self, id: Uuid, driver_id: DriverId) -> Result<(), UnidentifiedError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(UnidentifiedError::NotFound(id))?;
        record.claim(driver_id)
    }

    /// `pending -> rejected`, recording why.
    pub fn reject(&self, id: Uuid, reason: String) -> Result<(), UnidentifiedError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or(UnidentifiedError::NotFound(id))?;
        record.reject(reason)
    }

    /// Compliance-violation report: `pending` records older than
    /// `older_than_days` (spec default: `STALE_THRESHOLD_DAYS`).
    pub fn list_stale(&self, older_than_days: u32) -> Vec<UnidentifiedDrivingRecord> {
        let now = Utc::now();
        let mut stale: Vec<UnidentifiedDrivingRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.is_stale_violation(now, older_than_days as i64))
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.end);
        stale
    }
}
