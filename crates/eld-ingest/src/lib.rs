#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-ingest** – Ingestion Controller (spec §4.1).
//!
//! Orchestrates the full event lifecycle in the order spec §4.1 lays out:
//! validate (L1/L2/L3), acquire the per-scope lock, re-check the
//! scope-stateful half of L2 against the prior event, allocate a
//! sequence id, compute the hash chain, find-or-create the log period,
//! persist, and update the sequence/idempotency state. Mirrors the
//! teacher kernel's `submit()` shape: one orchestration method per public
//! operation, with every sub-step's failure mapped to a typed error.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use eld_dlq::{DlqEntryId, MemoryDlqStore, NewDlqEntry};
use eld_events_core::{Event, EventSubType, EventType, RecordOrigin, RecordStatus};
use eld_hashchain::{self as hashchain};
use eld_idempotency::{CompletedResponse, IdempotencyStore, ScopedKey, SetInFlightOutcome};
use eld_retry::{classify_by_message, retry, ErrorClass, RetryPolicy};
use eld_sequence::{GapWarning, Scope, SequenceError};
use eld_store_core::{EventStore, FindOptions, LogPeriodStore, SequenceStateStore, StorageError, TimeRange};
use eld_types::{CarrierId, DeviceId, DriverId, EventId, LogPeriodId, VehicleId};
use eld_validation::{validate_l1, validate_l2, validate_l3, validate_monotonic_within_scope, CrossReferenceChecker, ValidationError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Everything needed to build one new event, short of what the controller
/// itself assigns: id, sequence id, and the hash-chain fields.
#[derive(Debug, Clone)]
pub struct NewEventRequest {
    /// Classifies the event (spec §3).
    pub event_type: EventType,
    /// Event-type-specific payload.
    pub event_sub_type: EventSubType,
    /// Who originated the record.
    pub record_origin: RecordOrigin,
    /// When the event occurred (device clock).
    pub event_timestamp: DateTime<Utc>,
    /// MMDDYY, driver's home-terminal timezone.
    pub log_date: String,
    /// Driver the event is attributed to.
    pub driver_id: DriverId,
    /// Vehicle the driver was operating.
    pub vehicle_id: VehicleId,
    /// Device that recorded the event.
    pub device_id: DeviceId,
    /// Carrier the device/driver/vehicle belong to.
    pub carrier_id: CarrierId,
    /// Cumulative vehicle odometer reading.
    pub accumulated_vehicle_miles: u64,
    /// Cumulative engine hours.
    pub elapsed_engine_hours: u64,
    /// Latitude at the time of the event, if captured.
    pub latitude: Option<f64>,
    /// Longitude at the time of the event, if captured.
    pub longitude: Option<f64>,
    /// Free-text location description, if latitude/longitude are absent.
    pub location_description: Option<String>,
    /// Device-reported malfunction indicator.
    pub malfunction_indicator: bool,
    /// Device-reported data-diagnostic indicator.
    pub data_diagnostic_indicator: bool,
    /// FMCSA data-check value computed by the originating device.
    pub fmcsa_check_value: String,
    /// Client-proposed sequence id (offline-origin events). `None` lets the
    /// controller assign the next sequential id (online path).
    pub proposed_sequence_id: Option<u32>,
}

fn draft_event(request: &NewEventRequest) -> Event {
    Event {
        id: EventId(Uuid::new_v4()),
        sequence_id: request.proposed_sequence_id.unwrap_or(0),
        event_type: request.event_type,
        event_sub_type: request.event_sub_type.clone(),
        record_origin: request.record_origin,
        record_status: RecordStatus::Active,
        event_timestamp: request.event_timestamp,
        log_date: request.log_date.clone(),
        driver_id: request.driver_id,
        vehicle_id: request.vehicle_id,
        device_id: request.device_id,
        carrier_id: request.carrier_id,
        log_period_id: LogPeriodId(Uuid::nil()),
        accumulated_vehicle_miles: request.accumulated_vehicle_miles,
        elapsed_engine_hours: request.elapsed_engine_hours,
        latitude: request.latitude,
        longitude: request.longitude,
        location_description: request.location_description.clone(),
        malfunction_indicator: request.malfunction_indicator,
        data_diagnostic_indicator: request.data_diagnostic_indicator,
        content_hash: [0u8; 32],
        chain_hash: [0u8; 32],
        previous_chain_hash: [0u8; 32],
        fmcsa_check_value: request.fmcsa_check_value.clone(),
        updated_at: Utc::now(),
    }
}

/// A scope's events all fall on the same log date; a generous window around
/// the new event's timestamp safely covers the whole day regardless of the
/// home-terminal timezone offset.
fn scope_scan_range(event_timestamp: DateTime<Utc>) -> TimeRange {
    TimeRange::new(event_timestamp - Duration::days(2), event_timestamp + Duration::days(2))
        .unwrap_or_else(|_| TimeRange::new(event_timestamp, event_timestamp + Duration::days(4)).expect("non-empty range"))
}

/// Outcome of successfully ingesting one event (spec §4.1 `ingestSingle`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// The committed event's id.
    pub id: EventId,
    /// The sequence id it was assigned.
    pub sequence_id: u32,
    /// Its chain hash.
    pub chain_hash: [u8; 32],
    /// `true` if this outcome is a replay of an already-committed event
    /// (same idempotency key, or same scope+sequence with identical content).
    pub idempotency_replayed: bool,
    /// Gap-tolerance warning, if the sequence id skipped ahead.
    pub warning: Option<GapWarning>,
}

/// Errors from the ingestion pipeline (spec §4.1 "Error mapping").
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// One or more validation layers rejected the event.
    #[error("validation failed: {0:?}")]
    Validation(Vec<ValidationError>),
    /// Same scope+sequence id already holds a *different* event.
    #[error("duplicate event at this scope/sequence with different content")]
    DuplicateConflict,
    /// The proposed sequence id is not greater than the scope's last issued id.
    #[error("non-monotonic sequence id, last issued was {last_issued_id}")]
    NonMonotonic {
        /// The scope's current `last_issued_id`.
        last_issued_id: u32,
    },
    /// The batch was outside the caller's allowed size range (spec §8
    /// boundary cases: "Batch of 101 events", "Empty batch").
    #[error("batch size {size} is outside the allowed range (max {max})")]
    InvalidBatchSize {
        /// The size that was rejected.
        size: usize,
        /// The caller's cap.
        max: usize,
    },
    /// The scope's sequence-id space is exhausted.
    #[error("sequence id space exhausted for this scope")]
    SequenceExhausted,
    /// A concurrent request for the same idempotency key is already in flight.
    #[error("a request with this idempotency key is already in flight")]
    IdempotencyConflict,
    /// Persistence exhausted its retry budget or failed permanently.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    /// Any other internal failure (store backend, serialization, ...).
    #[error("internal error: {0}")]
    Internal(String),
    /// The caller's cancellation token fired at a suspension point (spec §5
    /// "Cancellation"). Safe to retry: if the event had already been
    /// inserted, the idempotency record (if any) is left `in_flight` for
    /// TTL expiry, and a retry with the same key observes the committed
    /// event via the uniqueness check.
    #[error("operation cancelled")]
    Cancelled,
}

fn classify_storage_error(err: &StorageError) -> ErrorClass {
    match err {
        StorageError::BackendError(message) => classify_by_message(message),
        StorageError::DuplicateActiveSequence(_, _) => ErrorClass::Permanent,
        _ => ErrorClass::Permanent,
    }
}

/// Validates, sequences, hash-chains and persists ELD events, serializing
/// writes per `(device, log_date)` scope (spec §5).
pub struct IngestionController {
    event_store: Arc<dyn EventStore>,
    sequence_store: Arc<dyn SequenceStateStore>,
    log_period_store: Arc<dyn LogPeriodStore>,
    cross_reference: Arc<dyn CrossReferenceChecker>,
    idempotency: Arc<dyn IdempotencyStore>,
    dlq: Arc<MemoryDlqStore>,
    retry_policy: RetryPolicy,
    scope_locks: DashMap<Scope, Arc<AsyncMutex<()>>>,
}

impl IngestionController {
    /// Wire a controller from its collaborators and the retry policy
    /// governing persistence retries (spec §4.8 / ambient retry configuration).
    pub fn new(
        event_store: Arc<dyn EventStore>,
        sequence_store: Arc<dyn SequenceStateStore>,
        log_period_store: Arc<dyn LogPeriodStore>,
        cross_reference: Arc<dyn CrossReferenceChecker>,
        idempotency: Arc<dyn IdempotencyStore>,
        dlq: Arc<MemoryDlqStore>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            event_store,
            sequence_store,
            log_period_store,
            cross_reference,
            idempotency,
            dlq,
            retry_policy,
            scope_locks: DashMap::new(),
        }
    }

    fn scope_lock(&self, scope: &Scope) -> Arc<AsyncMutex<()>> {
        self.scope_locks.entry(scope.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Checked before every suspension point (spec §5 "Cancellation"): every
    /// database/store await and the retry engine's backoff delay honor a
    /// caller-supplied deadline/cancellation signal.
    fn check_cancelled(cancellation: Option<&CancellationToken>) -> Result<(), IngestError> {
        match cancellation {
            Some(token) if token.is_cancelled() => Err(IngestError::Cancelled),
            _ => Ok(()),
        }
    }

    /// `ingestSingle` (spec §4.1): fully process one event. Never writes to
    /// the dead-letter queue — a persistence failure here is the caller's
    /// to retry or surface, per spec §7.
    pub async fn ingest_single(
        &self,
        request: NewEventRequest,
        idempotency_key: Option<ScopedKey>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<IngestOutcome, IngestError> {
        if let Some(key) = &idempotency_key {
            match self.idempotency.set_in_flight(key).await {
                Ok(SetInFlightOutcome::ReplayCompleted(completed)) => {
                    return Self::replay_from_completed(completed);
                }
                Ok(SetInFlightOutcome::Conflict) => return Err(IngestError::IdempotencyConflict),
                Ok(SetInFlightOutcome::Started) => {}
                Err(err) => warn!(error = %err, "idempotency store unavailable; proceeding without protection (fail-open)"),
            }
        }

        let outcome = match Self::check_cancelled(cancellation) {
            Ok(()) => self.process_one(request, cancellation).await,
            Err(err) => Err(err),
        };

        if let Some(key) = &idempotency_key {
            match &outcome {
                Ok(result) => {
                    let body = serde_json::to_string(result).unwrap_or_default();
                    if let Err(err) = self.idempotency.set_completed(key, 201, body).await {
                        warn!(error = %err, "failed to record idempotency completion");
                    }
                }
                Err(_) => {
                    if let Err(err) = self.idempotency.clear(key).await {
                        warn!(error = %err, "failed to clear in-flight idempotency record");
                    }
                }
            }
        }

        outcome
    }

    fn replay_from_completed(completed: CompletedResponse) -> Result<IngestOutcome, IngestError> {
        let mut outcome: IngestOutcome = serde_json::from_str(&completed.response_body)
            .map_err(|e| IngestError::Internal(format!("corrupt cached idempotency response: {e}")))?;
        outcome.idempotency_replayed = true;
        Ok(outcome)
    }

    /// `ingestBatch` (spec §4.1): `min_batch_size..=max_batch_size` events
    /// from one device, processed sequentially so the chain stays intact;
    /// partial acceptance allowed. Unlike `ingest_single`, a persistence
    /// failure here is recorded to the dead-letter queue with the event's
    /// batch index instead of aborting the batch. A batch outside the given
    /// size range is rejected wholesale before any event runs.
    ///
    /// Shared with `eld-sync`'s offline-drain, which has its own cap and,
    /// unlike `/events/batch`, tolerates an empty batch (a sync with no
    /// buffered events to drain is still a valid request for server-side
    /// edits) — so callers pass their own `min_batch_size`/`max_batch_size`
    /// rather than this crate assuming the `/events/batch` bounds.
    pub async fn ingest_batch(
        &self,
        requests: Vec<NewEventRequest>,
        source_endpoint: &str,
        min_batch_size: usize,
        max_batch_size: usize,
        cancellation: Option<&CancellationToken>,
    ) -> Result<BatchOutcome, IngestError> {
        if requests.len() < min_batch_size || requests.len() > max_batch_size {
            return Err(IngestError::InvalidBatchSize {
                size: requests.len(),
                max: max_batch_size,
            });
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for (index, request) in requests.into_iter().enumerate() {
            if let Err(err) = Self::check_cancelled(cancellation) {
                rejected.push(RejectedEvent { batch_index: index, error: err, dlq_entry_id: None });
                break;
            }

            let device_id = request.device_id;
            let payload = serde_json::to_value(RequestPayload::from(&request)).unwrap_or(serde_json::Value::Null);

            match self.process_one(request, cancellation).await {
                Ok(outcome) => accepted.push(outcome),
                Err(IngestError::PersistenceFailed(reason)) => {
                    let dlq_entry_id = self.dlq.enqueue(NewDlqEntry {
                        original_payload: payload,
                        source_device_id: device_id,
                        source_endpoint: source_endpoint.to_string(),
                        batch_index: Some(index),
                        failure_reason: reason.clone(),
                    });
                    rejected.push(RejectedEvent {
                        batch_index: index,
                        error: IngestError::PersistenceFailed(reason),
                        dlq_entry_id: Some(dlq_entry_id),
                    });
                }
                Err(other) => rejected.push(RejectedEvent {
                    batch_index: index,
                    error: other,
                    dlq_entry_id: None,
                }),
            }
        }

        Ok(BatchOutcome { accepted, rejected })
    }

    async fn process_one(
        &self,
        request: NewEventRequest,
        cancellation: Option<&CancellationToken>,
    ) -> Result<IngestOutcome, IngestError> {
        let draft = draft_event(&request);

        let l1_errors = validate_l1(&draft);
        if !l1_errors.is_empty() {
            return Err(IngestError::Validation(l1_errors));
        }
        let l2_errors = validate_l2(&draft);
        if !l2_errors.is_empty() {
            return Err(IngestError::Validation(l2_errors));
        }
        let l3_errors = validate_l3(&draft, self.cross_reference.as_ref()).await;
        if !l3_errors.is_empty() {
            return Err(IngestError::Validation(l3_errors));
        }
        Self::check_cancelled(cancellation)?;

        let scope = Scope {
            device_id: request.device_id,
            log_date: request.log_date.clone(),
        };
        let lock = self.scope_lock(&scope);
        let _guard = lock.lock().await;

        let range = scope_scan_range(request.event_timestamp);
        let prior = self
            .event_store
            .find_prior_for_chain(&scope, range)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;

        let monotonic_errors = validate_monotonic_within_scope(&draft, prior.as_ref());
        if !monotonic_errors.is_empty() {
            return Err(IngestError::Validation(monotonic_errors));
        }
        Self::check_cancelled(cancellation)?;

        let mut sequence_state = self
            .sequence_store
            .get(&scope)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;

        let allocation = match request.proposed_sequence_id {
            Some(proposed) => match sequence_state.issue_proposed(proposed) {
                Ok(allocation) => allocation,
                Err(SequenceError::NonMonotonic { last_issued_id }) => {
                    return self.resolve_replay_or_conflict(&scope, &draft, proposed, last_issued_id, range).await;
                }
                Err(SequenceError::SequenceExhausted) => return Err(IngestError::SequenceExhausted),
            },
            None => sequence_state
                .issue()
                .map_err(|_| IngestError::SequenceExhausted)?,
        };

        let mut event = draft;
        event.sequence_id = allocation.sequence_id;

        let log_period = self
            .log_period_store
            .find_or_create(event.driver_id, &event.log_date)
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?;
        event.log_period_id = log_period.id;

        let link = hashchain::link(&event, prior.as_ref().map(|p| p.chain_hash));
        event.content_hash = link.content_hash;
        event.chain_hash = link.chain_hash;
        event.previous_chain_hash = link.previous_chain_hash;

        Self::check_cancelled(cancellation)?;

        let store = Arc::clone(&self.event_store);
        let persisted = {
            let event = event.clone();
            let scope = scope.clone();
            let sequence_state = sequence_state.clone();
            retry(
                || {
                    let store = Arc::clone(&store);
                    let event = event.clone();
                    let scope = scope.clone();
                    let sequence_state = sequence_state.clone();
                    async move { store.insert_with_sequence_state(&event, &scope, sequence_state).await }
                },
                self.retry_policy,
                classify_storage_error,
            )
            .await
        };

        match persisted {
            Ok(()) => {}
            Err(StorageError::DuplicateActiveSequence(_, _)) => return Err(IngestError::DuplicateConflict),
            Err(other) => return Err(IngestError::PersistenceFailed(other.to_string())),
        }

        Ok(IngestOutcome {
            id: event.id,
            sequence_id: event.sequence_id,
            chain_hash: event.chain_hash,
            idempotency_replayed: false,
            warning: allocation.warning,
        })
    }

    /// A client retried with the same proposed sequence id. If the
    /// already-committed event at that sequence id hashes identically,
    /// this is an idempotent replay of the original request, not a new
    /// error; otherwise it's a genuine conflict (spec §4.1 "Error mapping").
    async fn resolve_replay_or_conflict(
        &self,
        scope: &Scope,
        draft: &Event,
        proposed: u32,
        last_issued_id: u32,
        range: TimeRange,
    ) -> Result<IngestOutcome, IngestError> {
        let existing = self
            .event_store
            .find_by_scope(scope, range, FindOptions::default())
            .await
            .map_err(|e| IngestError::Internal(e.to_string()))?
            .into_iter()
            .find(|e| e.sequence_id == proposed);

        let Some(existing) = existing else {
            return Err(IngestError::NonMonotonic { last_issued_id });
        };

        let mut candidate = draft.clone();
        candidate.sequence_id = proposed;
        if hashchain::content_hash(&candidate) == existing.content_hash {
            return Ok(IngestOutcome {
                id: existing.id,
                sequence_id: existing.sequence_id,
                chain_hash: existing.chain_hash,
                idempotency_replayed: true,
                warning: None,
            });
        }

        Err(IngestError::DuplicateConflict)
    }
}

/// A JSON-friendly, fully round-trippable snapshot of a request: the DLQ's
/// stored payload (spec §4.8 "Entry"). Retrying a DLQ entry deserializes one
/// of these and re-invokes ingestion — so unlike a display-only summary, it
/// must carry every field `NewEventRequest` does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    event_type: EventType,
    event_sub_type: EventSubType,
    record_origin: RecordOrigin,
    event_timestamp: DateTime<Utc>,
    log_date: String,
    driver_id: DriverId,
    vehicle_id: VehicleId,
    device_id: DeviceId,
    carrier_id: CarrierId,
    accumulated_vehicle_miles: u64,
    elapsed_engine_hours: u64,
    latitude: Option<f64>,
    longitude: Option<f64>,
    location_description: Option<String>,
    malfunction_indicator: bool,
    data_diagnostic_indicator: bool,
    fmcsa_check_value: String,
    proposed_sequence_id: Option<u32>,
}

impl From<&NewEventRequest> for RequestPayload {
    fn from(request: &NewEventRequest) -> Self {
        Self {
            event_type: request.event_type,
            event_sub_type: request.event_sub_type.clone(),
            record_origin: request.record_origin,
            event_timestamp: request.event_timestamp,
            log_date: request.log_date.clone(),
            driver_id: request.driver_id,
            vehicle_id: request.vehicle_id,
            device_id: request.device_id,
            carrier_id: request.carrier_id,
            accumulated_vehicle_miles: request.accumulated_vehicle_miles,
            elapsed_engine_hours: request.elapsed_engine_hours,
            latitude: request.latitude,
            longitude: request.longitude,
            location_description: request.location_description.clone(),
            malfunction_indicator: request.malfunction_indicator,
            data_diagnostic_indicator: request.data_diagnostic_indicator,
            fmcsa_check_value: request.fmcsa_check_value.clone(),
            proposed_sequence_id: request.proposed_sequence_id,
        }
    }
}

impl RequestPayload {
    /// Rebuild the original request for re-ingestion, per spec §4.8 `retry`:
    /// always drops the original proposed sequence id so the retry is
    /// allocated a fresh one rather than reusing the one that failed.
    pub fn into_retry_request(self) -> NewEventRequest {
        NewEventRequest {
            event_type: self.event_type,
            event_sub_type: self.event_sub_type,
            record_origin: self.record_origin,
            event_timestamp: self.event_timestamp,
            log_date: self.log_date,
            driver_id: self.driver_id,
            vehicle_id: self.vehicle_id,
            device_id: self.device_id,
            carrier_id: self.carrier_id,
            accumulated_vehicle_miles: self.accumulated_vehicle_miles,
            elapsed_engine_hours: self.elapsed_engine_hours,
            latitude: self.latitude,
            longitude: self.longitude,
            location_description: self.location_description,
            malfunction_indicator: self.malfunction_indicator,
            data_diagnostic_indicator: self.data_diagnostic_indicator,
            fmcsa_check_value: self.fmcsa_check_value,
            proposed_sequence_id: None,
        }
    }
}

/// One rejected event within a batch (spec §4.1 `ingestBatch`).
#[derive(Debug, thiserror::Error)]
#[error("event at batch index {batch_index} rejected: {error}")]
pub struct RejectedEvent {
    /// Index within the submitted batch.
    pub batch_index: usize,
    /// Why it was rejected.
    pub error: IngestError,
    /// The dead-letter entry holding its payload, if persistence failed.
    pub dlq_entry_id: Option<DlqEntryId>,
}

/// Result of `ingestBatch`: the accepted events plus per-event rejections.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Events committed successfully, in submission order.
    pub accepted: Vec<IngestOutcome>,
    /// Events that failed, with their batch index and cause.
    pub rejected: Vec<RejectedEvent>,
}
