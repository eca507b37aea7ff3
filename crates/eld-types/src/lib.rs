#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-types** – Shared primitive data structures for the ELD ingestion core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It makes no assumptions about I/O, cryptography, or storage.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Validation constants
//─────────────────────────────

/// Maximum length for the free-text location description field.
pub const MAX_LOCATION_DESCRIPTION_LEN: usize = 60;

/// Minimum valid latitude in decimal degrees.
pub const MIN_LATITUDE: f64 = -90.0;
/// Maximum valid latitude in decimal degrees.
pub const MAX_LATITUDE: f64 = 90.0;
/// Minimum valid longitude in decimal degrees.
pub const MIN_LONGITUDE: f64 = -180.0;
/// Maximum valid longitude in decimal degrees.
pub const MAX_LONGITUDE: f64 = 180.0;

/// Lower bound of the sequence-id value domain (§4.3).
pub const SEQUENCE_ID_MIN: u32 = 1;
/// Upper bound of the sequence-id value domain (§4.3): 16-bit per FMCSA.
pub const SEQUENCE_ID_MAX: u32 = 65_535;

/// A `proposedId > lastIssuedId + GAP_WARNING_THRESHOLD` is a plain gap warning.
pub const GAP_WARNING_THRESHOLD: u32 = 1;
/// A `proposedId > lastIssuedId + LARGE_GAP_THRESHOLD` escalates to `LARGE_GAP`.
pub const LARGE_GAP_THRESHOLD: u32 = 10;

/// `ingestBatch` (§4.1) accepts at most this many events, all from one device.
pub const MAX_EVENT_BATCH_SIZE: usize = 100;
/// `syncBatch` (§4.6) drains at most this many buffered events per request.
pub const MAX_SYNC_BATCH_SIZE: usize = 500;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Identifies a driver within a carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub uuid::Uuid);

/// Identifies a vehicle within a carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub uuid::Uuid);

/// Identifies an in-vehicle ELD device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub uuid::Uuid);

/// Identifies the carrier (motor-carrier entity) an actor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CarrierId(pub uuid::Uuid);

/// Identifies a committed event (128-bit, per spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub uuid::Uuid);

/// Identifies a driver-day log period, unique per `(driver, log_date)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPeriodId(pub uuid::Uuid);

/// Identifies a dead-letter-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DlqEntryId(pub uuid::Uuid);

//─────────────────────────────
//  Actor (pre-authenticated caller context)
//─────────────────────────────

/// The authenticated caller context the ingestion core operates under.
///
/// Token verification and session management are external collaborators
/// (spec §1); by the time an `Actor` reaches this core, authentication has
/// already happened. The core only uses it for carrier-scoping and admin
/// authorization checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Carrier this actor is scoped to; all L3 existence checks are relative
    /// to this carrier.
    pub carrier_id: CarrierId,
    /// Whether this actor is authorized for DLQ admin operations (§4.8).
    pub is_admin: bool,
    /// Human-readable identifier for audit trails (DLQ `resolved_by`, etc.).
    pub label: String,
}

//─────────────────────────────
//  Stable wire error codes (spec §6)
//─────────────────────────────

/// Stable wire-protocol error codes. These values must never be renumbered
/// or renamed once shipped — external clients match on them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// L1/L2/L3 validation failure.
    ValidationError,
    /// Same scope+sequence, differing content hash.
    Duplicate,
    /// `proposedId <= lastIssuedId`.
    NonMonotonic,
    /// Warning (not an error): small sequence gap detected.
    GapDetected,
    /// Warning (not an error): sequence gap larger than 10.
    LargeGap,
    /// Sequence-id value domain exhausted for a scope.
    SequenceExhausted,
    /// Idempotency key already in flight.
    IdempotencyConflict,
    /// Referenced entity does not exist.
    NotFound,
    /// Caller exceeded the rate limit (external collaborator, surfaced here
    /// only so the wire contract has one stable enum).
    RateLimited,
    /// Unclassified internal failure.
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_to_stable_wire_values() {
        let json = serde_json::to_string(&ErrorCode::NonMonotonic).unwrap();
        assert_eq!(json, "\"NON_MONOTONIC\"");
    }

    #[test]
    fn identifiers_roundtrip_through_json() {
        let id = DeviceId(uuid::Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
