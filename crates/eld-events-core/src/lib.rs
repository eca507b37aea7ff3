#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-events-core** – Core event, log-period and sub-record types for the
//! ELD ingestion core.
//!
//! This crate provides the foundational domain types shared across the
//! ingestion, validation, sequencing and storage crates. It intentionally
//! makes no assumptions about hashing (see `eld-hashchain`) or persistence
//! (see `eld-store-core`).

use chrono::{DateTime, Utc};
use eld_types::{CarrierId, DeviceId, DriverId, EventId, LogPeriodId, VehicleId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unidentified-driving bookkeeping (spec §3, supplemented per SPEC_FULL §3.1).
pub mod unidentified;

pub use unidentified::{MemoryUnidentifiedStore, UnidentifiedDrivingRecord, UnidentifiedError, UnidentifiedStatus};

//─────────────────────────────
//  Classification enums
//─────────────────────────────

/// Top-level ELD event classification (spec §3: enum 1..7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// Duty-status change.
    DutyStatusChange = 1,
    /// Intermediate log.
    IntermediateLog = 2,
    /// Personal-use or yard-moves.
    PersonalUseYardMoves = 3,
    /// Certification.
    Certification = 4,
    /// Login/logout.
    LoginLogout = 5,
    /// Engine power on/off.
    EnginePowerOnOff = 6,
    /// Malfunction/diagnostic.
    MalfunctionDiagnostic = 7,
}

/// Who or what originated the event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Automatically generated by the device.
    Auto,
    /// Entered by the driver.
    Driver,
    /// Entered by a co-driver.
    CoDriver,
    /// No driver was logged in at the time of the event.
    Unidentified,
    /// A carrier-side edit applied after the fact (spec §4.6 sync conflict table).
    CarrierEdit,
}

/// Lifecycle status of an event record (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordStatus {
    /// The currently-effective record.
    Active = 1,
    /// Superseded by a later edit.
    InactiveChanged = 2,
    /// An edit has been requested but not yet applied.
    InactiveChangedRequested = 3,
    /// A requested edit was rejected.
    InactiveChangedRejected = 4,
}

impl RecordStatus {
    /// True for statuses that represent a driver-review-worthy edit
    /// (spec §4.6 step 5: `record_status ∈ {2,3,4}`).
    pub fn requires_driver_review(self) -> bool {
        !matches!(self, RecordStatus::Active)
    }
}

/// Event-type-specific sub-fields (spec §4.2 L2: "event-type-specific required
/// sub-fields").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSubType {
    /// Duty-status change: the new duty-status code.
    DutyStatus {
        /// FMCSA duty-status code (e.g. off-duty, sleeper-berth, driving, on-duty).
        code: String,
    },
    /// Certification of a prior log-date.
    Certification {
        /// The log-date (MMDDYY) being certified.
        certified_log_date: String,
    },
    /// Login/logout: the driver's ELD account identifier.
    LoginLogout {
        /// Driver ELD account id used to authenticate on the device.
        driver_eld_account_id: String,
    },
    /// Engine power on/off transition.
    EnginePower {
        /// `true` for power-on, `false` for power-off.
        powering_on: bool,
    },
    /// Event types with no required sub-fields (intermediate log,
    /// personal-use/yard-moves, malfunction/diagnostic).
    None,
}

//─────────────────────────────
//  Event
//─────────────────────────────

/// The fundamental, immutable-after-commit unit of the ELD event stream
/// (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique 128-bit identifier.
    pub id: EventId,
    /// Sequence id allocated within `(device_id, log_date)`, 1..65535.
    pub sequence_id: u32,

    /// Top-level classification.
    pub event_type: EventType,
    /// Type-specific sub-fields.
    pub event_sub_type: EventSubType,
    /// Who/what originated the record.
    pub record_origin: RecordOrigin,
    /// Lifecycle status.
    pub record_status: RecordStatus,

    /// Instant the event occurred, with UTC offset preserved by the caller.
    pub event_timestamp: DateTime<Utc>,
    /// MMDDYY in the driver's home-terminal timezone; defines the scope
    /// boundary for sequence-id and hash-chain purposes.
    pub log_date: String,

    /// Driver this event is attributed to.
    pub driver_id: DriverId,
    /// Vehicle involved.
    pub vehicle_id: VehicleId,
    /// Device that recorded/transmitted the event.
    pub device_id: DeviceId,
    /// Carrier that owns the driver/vehicle/device.
    pub carrier_id: CarrierId,
    /// Log period this event belongs to.
    pub log_period_id: LogPeriodId,

    /// Accumulated vehicle miles, in tenths.
    pub accumulated_vehicle_miles: u64,
    /// Elapsed engine hours, in tenths.
    pub elapsed_engine_hours: u64,
    /// Decimal-degree latitude, if available.
    pub latitude: Option<f64>,
    /// Decimal-degree longitude, if available.
    pub longitude: Option<f64>,
    /// Free-text location description, ≤60 chars.
    pub location_description: Option<String>,
    /// Malfunction indicator.
    pub malfunction_indicator: bool,
    /// Data-diagnostic indicator.
    pub data_diagnostic_indicator: bool,

    /// SHA-256 of the canonical field set (see `eld-hashchain`).
    pub content_hash: [u8; 32],
    /// SHA-256 over `previous_chain_hash ∥ content_hash`.
    pub chain_hash: [u8; 32],
    /// Chain hash of the prior active event in scope; all-zero for genesis.
    pub previous_chain_hash: [u8; 32],
    /// FMCSA check value (derived from content per Appendix A; opaque here).
    pub fmcsa_check_value: String,

    /// Last-modified timestamp, used by the sync protocol to find server-side
    /// edits (spec §4.6 step 4).
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Build the canonical JSON object used as the content-hash input
    /// (spec §4.4): keys sorted lexicographically, null fields omitted.
    ///
    /// `serde_json::Map` preserves insertion order, not lexicographic order,
    /// so we insert in sorted-key order explicitly rather than relying on a
    /// `BTreeMap` re-serialization step.
    pub fn canonical_content_json(&self) -> Value {
        let mut fields: Vec<(&'static str, Value)> = vec![
            ("accumulatedMiles", Value::from(self.accumulated_vehicle_miles)),
            ("deviceId", Value::String(self.device_id.0.to_string())),
            ("driverId", Value::String(self.driver_id.0.to_string())),
            (
                "elapsedEngineHours",
                Value::from(self.elapsed_engine_hours),
            ),
            (
                "eventSubType",
                serde_json::to_value(&self.event_sub_type).expect("EventSubType always serializes"),
            ),
            (
                "eventTimestamp",
                Value::String(self.event_timestamp.to_rfc3339()),
            ),
            (
                "eventType",
                serde_json::to_value(self.event_type).expect("EventType always serializes"),
            ),
            (
                "recordOrigin",
                serde_json::to_value(self.record_origin).expect("RecordOrigin always serializes"),
            ),
            (
                "recordStatus",
                serde_json::to_value(self.record_status).expect("RecordStatus always serializes"),
            ),
            ("sequenceId", Value::from(self.sequence_id)),
            ("vehicleId", Value::String(self.vehicle_id.0.to_string())),
        ];

        if let Some(lat) = self.latitude {
            fields.push(("latitude", Value::from(lat)));
        }
        if let Some(lon) = self.longitude {
            fields.push(("longitude", Value::from(lon)));
        }
        if let Some(desc) = &self.location_description {
            fields.push(("locationDescription", Value::String(desc.clone())));
        }

        fields.sort_by(|a, b| a.0.cmp(b.0));

        let mut map = Map::new();
        for (k, v) in fields {
            map.insert(k.to_string(), v);
        }
        Value::Object(map)
    }
}

//─────────────────────────────
//  LogPeriod
//─────────────────────────────

/// Status of a driver-day log period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPeriodStatus {
    /// Open for further events.
    Open,
    /// Closed pending certification.
    Closed,
    /// Certified by the driver.
    Certified,
    /// Re-certified after a correction.
    Recertified,
    /// Certification rejected.
    Rejected,
}

/// Driver-day envelope, created lazily on the first event for
/// `(driver, log_date)` (spec §3). Invariant: exactly one per
/// `(driver, log_date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPeriod {
    /// Unique identifier.
    pub id: LogPeriodId,
    /// Driver this log period belongs to.
    pub driver_id: DriverId,
    /// MMDDYY, driver's home-terminal timezone.
    pub log_date: String,
    /// Current status.
    pub status: LogPeriodStatus,
    /// Total event count committed against this log period.
    pub total_event_count: u64,
    /// When the driver certified the log, if certified.
    pub certification_timestamp: Option<DateTime<Utc>>,
    /// Reason recorded if the certification was rejected.
    pub rejection_reason: Option<String>,
}

impl LogPeriod {
    /// Create a new, open log period for `(driver_id, log_date)`.
    pub fn open(id: LogPeriodId, driver_id: DriverId, log_date: String) -> Self {
        Self {
            id,
            driver_id,
            log_date,
            status: LogPeriodStatus::Open,
            total_event_count: 0,
            certification_timestamp: None,
            rejection_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            id: EventId(uuid::Uuid::nil()),
            sequence_id: 42,
            event_type: EventType::DutyStatusChange,
            event_sub_type: EventSubType::DutyStatus {
                code: "driving".into(),
            },
            record_origin: RecordOrigin::Driver,
            record_status: RecordStatus::Active,
            event_timestamp: Utc::now(),
            log_date: "021526".into(),
            driver_id: DriverId(uuid::Uuid::nil()),
            vehicle_id: VehicleId(uuid::Uuid::nil()),
            device_id: DeviceId(uuid::Uuid::nil()),
            carrier_id: CarrierId(uuid::Uuid::nil()),
            log_period_id: LogPeriodId(uuid::Uuid::nil()),
            accumulated_vehicle_miles: 12345,
            elapsed_engine_hours: 678,
            latitude: Some(40.0),
            longitude: None,
            location_description: None,
            malfunction_indicator: false,
            data_diagnostic_indicator: false,
            content_hash: [0u8; 32],
            chain_hash: [0u8; 32],
            previous_chain_hash: [0u8; 32],
            fmcsa_check_value: "ABC123".into(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn canonical_json_omits_null_fields() {
        let event = sample_event();
        let json = event.canonical_content_json();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("latitude"));
        assert!(!obj.contains_key("longitude"));
        assert!(!obj.contains_key("locationDescription"));
    }

    #[test]
    fn canonical_json_keys_are_sorted() {
        let event = sample_event();
        let json = event.canonical_content_json();
        let obj = json.as_object().unwrap();
        let keys: Vec<&String> = obj.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn record_status_review_flags() {
        assert!(!RecordStatus::Active.requires_driver_review());
        assert!(RecordStatus::InactiveChanged.requires_driver_review());
        assert!(RecordStatus::InactiveChangedRequested.requires_driver_review());
        assert!(RecordStatus::InactiveChangedRejected.requires_driver_review());
    }

    #[test]
    fn log_period_opens_in_open_status() {
        let lp = LogPeriod::open(
            LogPeriodId(uuid::Uuid::nil()),
            DriverId(uuid::Uuid::nil()),
            "021526".into(),
        );
        assert_eq!(lp.status, LogPeriodStatus::Open);
        assert_eq!(lp.total_event_count, 0);
    }
}
