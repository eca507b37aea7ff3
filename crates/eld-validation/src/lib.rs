#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-validation** – Validation Pipeline (spec §4.2).
//!
//! Three layers applied in strict order, each gating the next:
//! L1 shape, L2 FMCSA business rules, L3 cross-reference existence. L3 is
//! fail-open: a lookup-service error is logged and treated as "allow
//! through" rather than a validation failure, per spec §4.2/§7.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use eld_events_core::{Event, EventSubType, EventType};
use eld_types::{CarrierId, DeviceId, DriverId, VehicleId, MAX_LOCATION_DESCRIPTION_LEN};
use tracing::warn;

/// Which layer produced a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Layer {
    /// Shape validation: required fields, ranges, formats.
    L1,
    /// FMCSA business-rule validation, dispatched by event type.
    L2,
    /// Cross-reference existence checks against driver/vehicle/device records.
    L3,
}

/// A single structured validation failure (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    /// The event field the error concerns.
    pub field: String,
    /// The offending value, rendered as a string for the wire response.
    pub value: String,
    /// Human-readable description of the failure.
    pub message: String,
    /// The layer that produced this error.
    pub layer: Layer,
}

impl ValidationError {
    fn new(field: &str, value: impl ToString, message: impl Into<String>, layer: Layer) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
            layer,
        }
    }
}

/// Cross-reference lookups for L3. Implementations talk to whatever
/// directory service owns driver/vehicle/device records.
#[async_trait]
pub trait CrossReferenceChecker: Send + Sync + 'static {
    /// `true` if the driver exists, belongs to `carrier_id`, and is not suspended.
    async fn driver_is_active_for_carrier(
        &self,
        driver_id: DriverId,
        carrier_id: CarrierId,
    ) -> anyhow::Result<bool>;

    /// `true` if the vehicle exists and is owned by `carrier_id`.
    async fn vehicle_is_owned_by_carrier(
        &self,
        vehicle_id: VehicleId,
        carrier_id: CarrierId,
    ) -> anyhow::Result<bool>;

    /// `true` if the device exists, is commissioned, and belongs to `carrier_id`.
    async fn device_is_commissioned_for_carrier(
        &self,
        device_id: DeviceId,
        carrier_id: CarrierId,
    ) -> anyhow::Result<bool>;
}

/// Validate an event's shape: required ranges, lengths, and date-code format
/// (spec §4.2 L1).
pub fn validate_l1(event: &Event) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(lat) = event.latitude {
        if !(eld_types::MIN_LATITUDE..=eld_types::MAX_LATITUDE).contains(&lat) {
            errors.push(ValidationError::new("latitude", lat, "latitude must be within [-90, 90]", Layer::L1));
        }
    }
    if let Some(lon) = event.longitude {
        if !(eld_types::MIN_LONGITUDE..=eld_types::MAX_LONGITUDE).contains(&lon) {
            errors.push(ValidationError::new("longitude", lon, "longitude must be within [-180, 180]", Layer::L1));
        }
    }
    if let Some(description) = &event.location_description {
        if description.chars().count() > MAX_LOCATION_DESCRIPTION_LEN {
            errors.push(ValidationError::new(
                "locationDescription",
                description,
                format!("must be at most {MAX_LOCATION_DESCRIPTION_LEN} characters"),
                Layer::L1,
            ));
        }
    }
    if !is_valid_mmddyy(&event.log_date) {
        errors.push(ValidationError::new(
            "logDate",
            &event.log_date,
            "must be a 6-digit MMDDYY date code",
            Layer::L1,
        ));
    }

    errors
}

fn is_valid_mmddyy(value: &str) -> bool {
    if value.len() != 6 || !value.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let month: u32 = value[0..2].parse().unwrap_or(0);
    let day: u32 = value[2..4].parse().unwrap_or(0);
    (1..=12).contains(&month) && (1..=31).contains(&day)
}

/// Validate an event against FMCSA business rules, dispatched by event type
/// (spec §4.2 L2).
pub fn validate_l2(event: &Event) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let now = Utc::now();
    if event.event_timestamp < now - Duration::days(30) {
        errors.push(ValidationError::new(
            "eventTimestamp",
            event.event_timestamp,
            "event timestamp must not be more than 30 days in the past",
            Layer::L2,
        ));
    } else if event.event_timestamp > now + Duration::minutes(5) {
        errors.push(ValidationError::new(
            "eventTimestamp",
            event.event_timestamp,
            "event timestamp must not be more than 5 minutes in the future",
            Layer::L2,
        ));
    }

    match (event.event_type, &event.event_sub_type) {
        (EventType::DutyStatusChange, EventSubType::DutyStatus { code }) => {
            if code.trim().is_empty() {
                errors.push(ValidationError::new(
                    "eventSubType.code",
                    code,
                    "duty-status change requires a non-empty duty-status code",
                    Layer::L2,
                ));
            }
        }
        (EventType::DutyStatusChange, other) => {
            errors.push(ValidationError::new(
                "eventSubType",
                format!("{other:?}"),
                "duty-status change requires a duty-status sub-type",
                Layer::L2,
            ));
        }
        (EventType::Certification, EventSubType::Certification { certified_log_date }) => {
            match chrono::NaiveDate::parse_from_str(certified_log_date, "%m%d%y") {
                Ok(date) => {
                    let today = Utc::now().date_naive();
                    if date > today {
                        errors.push(ValidationError::new(
                            "eventSubType.certifiedLogDate",
                            certified_log_date,
                            "certified log date must not be in the future",
                            Layer::L2,
                        ));
                    } else if today - date > Duration::days(13) {
                        errors.push(ValidationError::new(
                            "eventSubType.certifiedLogDate",
                            certified_log_date,
                            "certified log date must be within the last 13 days",
                            Layer::L2,
                        ));
                    }
                }
                Err(_) => errors.push(ValidationError::new(
                    "eventSubType.certifiedLogDate",
                    certified_log_date,
                    "must be a 6-digit MMDDYY date code",
                    Layer::L2,
                )),
            }
        }
        (EventType::Certification, other) => {
            errors.push(ValidationError::new(
                "eventSubType",
                format!("{other:?}"),
                "certification requires a certified-log-date sub-type",
                Layer::L2,
            ));
        }
        (EventType::LoginLogout, EventSubType::LoginLogout { driver_eld_account_id }) => {
            if driver_eld_account_id.trim().is_empty() {
                errors.push(ValidationError::new(
                    "eventSubType.driverEldAccountId",
                    driver_eld_account_id,
                    "login/logout requires a driver ELD account id",
                    Layer::L2,
                ));
            }
        }
        (EventType::LoginLogout, other) => {
            errors.push(ValidationError::new(
                "eventSubType",
                format!("{other:?}"),
                "login/logout requires a driver-eld-account-id sub-type",
                Layer::L2,
            ));
        }
        (EventType::EnginePowerOnOff, EventSubType::EnginePower { .. }) => {
            // The paired-off-within-24h rule is verified asynchronously at
            // scope close (spec §4.2), not synchronously here.
        }
        (EventType::EnginePowerOnOff, other) => {
            errors.push(ValidationError::new(
                "eventSubType",
                format!("{other:?}"),
                "engine power on/off requires an engine-power sub-type",
                Layer::L2,
            ));
        }
        _ => {}
    }

    errors
}

/// Check the scope-stateful half of L2 that `validate_l2` cannot express on
/// its own: odometer and engine hours must not decrease relative to the
/// highest-sequence active event already committed in the same
/// `(device, log_date)` scope (spec §4.1 step 2). Called by the ingestion
/// controller once it holds the scope lock and has fetched `prior`; `None`
/// means this is the first event in the scope.
pub fn validate_monotonic_within_scope(event: &Event, prior: Option<&Event>) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let Some(prior) = prior else {
        return errors;
    };

    if event.accumulated_vehicle_miles < prior.accumulated_vehicle_miles {
        errors.push(ValidationError::new(
            "accumulatedVehicleMiles",
            event.accumulated_vehicle_miles,
            "odometer reading must not decrease within a device/log-date scope",
            Layer::L2,
        ));
    }
    if event.elapsed_engine_hours < prior.elapsed_engine_hours {
        errors.push(ValidationError::new(
            "elapsedEngineHours",
            event.elapsed_engine_hours,
            "engine hours must not decrease within a device/log-date scope",
            Layer::L2,
        ));
    }

    errors
}

/// Validate cross-references against driver/vehicle/device directories
/// (spec §4.2 L3). Fail-open: a lookup error is logged and treated as a pass.
pub async fn validate_l3(event: &Event, checker: &dyn CrossReferenceChecker) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    match checker
        .driver_is_active_for_carrier(event.driver_id, event.carrier_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => errors.push(ValidationError::new(
            "driverId",
            event.driver_id.0,
            "driver does not exist, is not active, or does not belong to this carrier",
            Layer::L3,
        )),
        Err(err) => warn!(error = %err, "L3 driver lookup failed; allowing through (fail-open)"),
    }

    match checker
        .vehicle_is_owned_by_carrier(event.vehicle_id, event.carrier_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => errors.push(ValidationError::new(
            "vehicleId",
            event.vehicle_id.0,
            "vehicle does not exist or is not owned by this carrier",
            Layer::L3,
        )),
        Err(err) => warn!(error = %err, "L3 vehicle lookup failed; allowing through (fail-open)"),
    }

    match checker
        .device_is_commissioned_for_carrier(event.device_id, event.carrier_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => errors.push(ValidationError::new(
            "deviceId",
            event.device_id.0,
            "device does not exist, is not commissioned, or does not belong to this carrier",
            Layer::L3,
        )),
        Err(err) => warn!(error = %err, "L3 device lookup failed; allowing through (fail-open)"),
    }

    errors
}

/// Run the full pipeline: L1, then L2 if L1 passed, then L3 if L2 passed.
/// Returns the errors from whichever layer stopped the pipeline (empty if
/// the event passed all three).
pub async fn validate(event: &Event, checker: &dyn CrossReferenceChecker) -> Vec<ValidationError> {
    let l1 = validate_l1(event);
    if !l1.is_empty() {
        return l1;
    }
    let l2 = validate_l2(event);
    if !l2.is_empty() {
        return l2;
    }
    validate_l3(event, checker).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use eld_events_core::{RecordOrigin, RecordStatus};
    use eld_types::{CarrierId, DeviceId, DriverId, EventId, LogPeriodId, VehicleId};
    use uuid::Uuid;

    fn base_event() -> Event {
        Event {
            id: EventId(Uuid::new_v4()),
            sequence_id: 1,
            event_type: EventType::DutyStatusChange,
            event_sub_type: EventSubType::DutyStatus { code: "driving".into() },
            record_origin: RecordOrigin::Driver,
            record_status: RecordStatus::Active,
            event_timestamp: Utc::now(),
            log_date: "021526".into(),
            driver_id: DriverId(Uuid::new_v4()),
            vehicle_id: VehicleId(Uuid::new_v4()),
            device_id: DeviceId(Uuid::new_v4()),
            carrier_id: CarrierId(Uuid::new_v4()),
            log_period_id: LogPeriodId(Uuid::new_v4()),
            accumulated_vehicle_miles: 100,
            elapsed_engine_hours: 10,
            latitude: Some(40.0),
            longitude: Some(-75.0),
            location_description: None,
            malfunction_indicator: false,
            data_diagnostic_indicator: false,
            content_hash: [0u8; 32],
            chain_hash: [0u8; 32],
            previous_chain_hash: [0u8; 32],
            fmcsa_check_value: "X".into(),
            updated_at: Utc::now(),
        }
    }

    struct AllowAll;

    #[async_trait]
    impl CrossReferenceChecker for AllowAll {
        async fn driver_is_active_for_carrier(&self, _: DriverId, _: CarrierId) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn vehicle_is_owned_by_carrier(&self, _: VehicleId, _: CarrierId) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn device_is_commissioned_for_carrier(&self, _: DeviceId, _: CarrierId) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct AlwaysErrors;

    #[async_trait]
    impl CrossReferenceChecker for AlwaysErrors {
        async fn driver_is_active_for_carrier(&self, _: DriverId, _: CarrierId) -> anyhow::Result<bool> {
            anyhow::bail!("lookup service unreachable")
        }
        async fn vehicle_is_owned_by_carrier(&self, _: VehicleId, _: CarrierId) -> anyhow::Result<bool> {
            anyhow::bail!("lookup service unreachable")
        }
        async fn device_is_commissioned_for_carrier(&self, _: DeviceId, _: CarrierId) -> anyhow::Result<bool> {
            anyhow::bail!("lookup service unreachable")
        }
    }

    #[test]
    fn l1_rejects_out_of_range_latitude() {
        let mut event = base_event();
        event.latitude = Some(200.0);
        let errors = validate_l1(&event);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "latitude");
        assert_eq!(errors[0].layer, Layer::L1);
    }

    #[test]
    fn l1_rejects_malformed_log_date() {
        let mut event = base_event();
        event.log_date = "13-99".into();
        let errors = validate_l1(&event);
        assert!(errors.iter().any(|e| e.field == "logDate"));
    }

    #[test]
    fn l2_requires_duty_status_code() {
        let mut event = base_event();
        event.event_sub_type = EventSubType::DutyStatus { code: "  ".into() };
        let errors = validate_l2(&event);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].layer, Layer::L2);
    }

    #[test]
    fn l2_rejects_certification_older_than_13_days() {
        let mut event = base_event();
        event.event_type = EventType::Certification;
        event.event_sub_type = EventSubType::Certification {
            certified_log_date: (Utc::now() - ChronoDuration::days(20)).format("%m%d%y").to_string(),
        };
        let errors = validate_l2(&event);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn pipeline_stops_at_l1_and_skips_l2() {
        let mut event = base_event();
        event.latitude = Some(999.0);
        event.event_sub_type = EventSubType::DutyStatus { code: "".into() };
        let errors = validate(&event, &AllowAll).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].layer, Layer::L1);
    }

    #[tokio::test]
    async fn l3_fail_open_allows_through_on_lookup_error() {
        let event = base_event();
        let errors = validate_l3(&event, &AlwaysErrors).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn clean_event_passes_all_three_layers() {
        let event = base_event();
        let errors = validate(&event, &AllowAll).await;
        assert!(errors.is_empty());
    }

    #[test]
    fn l2_rejects_timestamp_too_far_in_the_past() {
        let mut event = base_event();
        event.event_timestamp = Utc::now() - ChronoDuration::days(31);
        let errors = validate_l2(&event);
        assert!(errors.iter().any(|e| e.field == "eventTimestamp"));
    }

    #[test]
    fn l2_rejects_timestamp_too_far_in_the_future() {
        let mut event = base_event();
        event.event_timestamp = Utc::now() + ChronoDuration::minutes(10);
        let errors = validate_l2(&event);
        assert!(errors.iter().any(|e| e.field == "eventTimestamp"));
    }

    #[test]
    fn monotonic_scope_check_passes_with_no_prior_event() {
        let event = base_event();
        assert!(validate_monotonic_within_scope(&event, None).is_empty());
    }

    #[test]
    fn monotonic_scope_check_rejects_decreasing_odometer() {
        let mut prior = base_event();
        prior.accumulated_vehicle_miles = 500;
        let mut event = base_event();
        event.accumulated_vehicle_miles = 400;
        let errors = validate_monotonic_within_scope(&event, Some(&prior));
        assert!(errors.iter().any(|e| e.field == "accumulatedVehicleMiles"));
    }

    #[test]
    fn monotonic_scope_check_rejects_decreasing_engine_hours() {
        let mut prior = base_event();
        prior.elapsed_engine_hours = 20;
        let mut event = base_event();
        event.elapsed_engine_hours = 10;
        let errors = validate_monotonic_within_scope(&event, Some(&prior));
        assert!(errors.iter().any(|e| e.field == "elapsedEngineHours"));
    }
}
