#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-runtime** – Runtime wiring for the ingestion/sync stack.
//!
//! Bridges the deterministic pipeline crates (`eld-ingest`, `eld-sync`) with
//! the SQLite store and operational defaults, the way `toka-runtime::Runtime`
//! bridges the kernel to storage/bus backends. Owns configuration loading
//! (serde + the `config` crate) and collaborator assembly; callers drive
//! ingestion through the `IngestionController`/`sync_batch` this crate hands
//! back, same as a `toka-runtime::Runtime` hands back a wired `Kernel`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use eld_dlq::{DlqEntryId, MemoryDlqStore};
use eld_events_core::MemoryUnidentifiedStore;
use eld_idempotency::MemoryIdempotencyStore;
use eld_ingest::{IngestOutcome, IngestionController, RequestPayload};
use eld_retry::RetryPolicy;
use eld_store_core::{EventStore, LogPeriodStore, SequenceStateStore};
use eld_store_sqlite::SqliteEventStore;
use eld_validation::CrossReferenceChecker;
use serde::{Deserialize, Serialize};
use std::sync::Arc as StdArc;
use tracing::{info, warn};

/// Storage backend selection (§6: SQLite today; the shape leaves room for a
/// future Postgres adapter without disturbing callers).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum StorageConfig {
    /// In-memory SQLite database (tests, local dev).
    #[default]
    Memory,
    /// File-backed SQLite database.
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Runtime configuration (spec SPEC_FULL.md §4 "Configuration"). Loadable
/// via the `config` crate from file + environment, with defaults matching
/// the values `spec.md` names inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Storage backend.
    pub storage: StorageConfig,
    /// Idempotency record time-to-live, in hours.
    pub idempotency_ttl_hours: i64,
    /// Retry engine base delay, in milliseconds.
    pub retry_base_ms: u64,
    /// Retry engine max delay, in milliseconds.
    pub retry_max_ms: u64,
    /// Retry engine max attempts.
    pub retry_max_attempts: u32,
    /// DLQ pending-count alert threshold.
    pub dlq_alert_threshold: usize,
    /// Sequence reservation block size for offline devices.
    pub reservation_block_size: u32,
    /// Sequence reservation time-to-live, in seconds.
    pub reservation_ttl_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            idempotency_ttl_hours: eld_idempotency::DEFAULT_TTL_HOURS,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            retry_max_attempts: 3,
            dlq_alert_threshold: 50,
            reservation_block_size: 100,
            reservation_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `path` (if it exists) layered over defaults,
    /// then over `ELD_`-prefixed environment variables, the way
    /// `toka-runtime` callers compose file and env configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("ELD").separator("__"));
        builder
            .build()
            .context("failed to build runtime configuration")?
            .try_deserialize()
            .context("failed to deserialize runtime configuration")
    }
}

/// A fully wired runtime: the SQLite store plus the collaborators
/// `IngestionController`/`sync_batch` need.
pub struct Runtime {
    /// Effective configuration.
    pub config: RuntimeConfig,
    /// The event store, also implementing the sequence-state and log-period
    /// stores (all three are backed by the same SQLite pool).
    pub event_store: Arc<SqliteEventStore>,
    /// Dead-letter queue.
    pub dlq: Arc<MemoryDlqStore>,
    /// Idempotency store.
    pub idempotency: Arc<MemoryIdempotencyStore>,
    /// Unidentified-driving disposition store.
    pub unidentified: Arc<MemoryUnidentifiedStore>,
    /// The ingestion controller, wired from the above plus a caller-supplied
    /// cross-reference checker.
    pub controller: Arc<IngestionController>,
}

impl Runtime {
    /// Assemble a runtime from `config`, opening the configured storage
    /// backend and wiring every collaborator the ingestion pipeline needs.
    pub async fn bootstrap(config: RuntimeConfig, cross_reference: Arc<dyn CrossReferenceChecker>) -> Result<Self> {
        let event_store = Arc::new(match &config.storage {
            StorageConfig::Memory => SqliteEventStore::in_memory().await?,
            StorageConfig::Sqlite { path } => SqliteEventStore::open(path).await?,
        });
        let idempotency = Arc::new(MemoryIdempotencyStore::with_ttl(chrono::Duration::hours(
            config.idempotency_ttl_hours,
        )));
        let dlq = Arc::new(MemoryDlqStore::new());
        let unidentified = Arc::new(MemoryUnidentifiedStore::new());
        let retry_policy = RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_ms: config.retry_base_ms,
            max_ms: config.retry_max_ms,
        };

        let controller = Arc::new(IngestionController::new(
            event_store.clone() as StdArc<dyn EventStore>,
            event_store.clone() as StdArc<dyn SequenceStateStore>,
            event_store.clone() as StdArc<dyn LogPeriodStore>,
            cross_reference,
            idempotency.clone() as StdArc<dyn eld_idempotency::IdempotencyStore>,
            dlq.clone(),
            retry_policy,
        ));

        info!(storage = ?config.storage, "eld runtime bootstrapped");

        Ok(Self {
            config,
            event_store,
            dlq,
            idempotency,
            unidentified,
            controller,
        })
    }

    /// Admin `retry(id)` (spec §4.8): re-invokes the ingestion pipeline on a
    /// `pending` DLQ entry's stored payload with a **fresh** sequence-id
    /// allocation, never the one that originally failed. Success resolves
    /// the entry; failure returns it to `pending` with `retry_count`
    /// incremented and the new failure reason recorded.
    pub async fn retry_dlq_entry(&self, id: DlqEntryId, retried_by: impl Into<String>) -> Result<IngestOutcome> {
        let entry = self.dlq.begin_retry(id)?;
        let payload: RequestPayload = serde_json::from_value(entry.original_payload)
            .context("dlq entry payload is not a valid request snapshot")?;
        let request = payload.into_retry_request();

        match self.controller.ingest_single(request, None, None).await {
            Ok(outcome) => {
                self.dlq.mark_resolved(id, retried_by.into())?;
                info!(id = %id.0, sequence_id = outcome.sequence_id, "dlq entry resolved on retry");
                Ok(outcome)
            }
            Err(err) => {
                self.dlq.mark_retry_failed(id, err.to_string())?;
                warn!(id = %id.0, error = %err, "dlq retry failed; entry returned to pending");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eld_dlq::{DlqStatus, NewDlqEntry};
    use eld_events_core::{EventSubType, EventType, RecordOrigin};
    use eld_ingest::{NewEventRequest, RequestPayload};
    use eld_types::{CarrierId, DeviceId, DriverId, VehicleId};

    struct AllowAll;

    #[async_trait::async_trait]
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

    #[test]
    fn default_config_matches_spec_named_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.retry_base_ms, 1000);
        assert_eq!(config.retry_max_ms, 30_000);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.idempotency_ttl_hours, 24);
    }

    #[test]
    fn load_without_a_config_file_falls_back_to_defaults() {
        let config = RuntimeConfig::load("/nonexistent/eld-runtime-config-test.toml").unwrap();
        assert_eq!(config.retry_base_ms, RuntimeConfig::default().retry_base_ms);
    }

    #[tokio::test]
    async fn bootstrap_wires_an_in_memory_runtime() {
        let runtime = Runtime::bootstrap(RuntimeConfig::default(), Arc::new(AllowAll)).await.unwrap();
        assert_eq!(runtime.event_store.event_count().await.unwrap(), 0);
    }

    fn sample_request(device_id: DeviceId, carrier_id: CarrierId, driver_id: DriverId, vehicle_id: VehicleId) -> NewEventRequest {
        NewEventRequest {
            event_type: EventType::DutyStatusChange,
            event_sub_type: EventSubType::DutyStatus { code: "driving".into() },
            record_origin: RecordOrigin::Driver,
            event_timestamp: chrono::Utc::now(),
            log_date: "021526".into(),
            driver_id,
            vehicle_id,
            device_id,
            carrier_id,
            accumulated_vehicle_miles: 100,
            elapsed_engine_hours: 5,
            latitude: None,
            longitude: None,
            location_description: None,
            malfunction_indicator: false,
            data_diagnostic_indicator: false,
            fmcsa_check_value: "X".into(),
            proposed_sequence_id: None,
        }
    }

    #[tokio::test]
    async fn retry_dlq_entry_resolves_a_pending_entry_with_a_fresh_sequence_id() {
        let runtime = Runtime::bootstrap(RuntimeConfig::default(), Arc::new(AllowAll)).await.unwrap();
        let device_id = DeviceId(uuid::Uuid::new_v4());
        let carrier_id = CarrierId(uuid::Uuid::new_v4());
        let driver_id = DriverId(uuid::Uuid::new_v4());
        let vehicle_id = VehicleId(uuid::Uuid::new_v4());

        let request = sample_request(device_id, carrier_id, driver_id, vehicle_id);
        let payload = serde_json::to_value(RequestPayload::from(&request)).unwrap();
        let entry_id = runtime.dlq.enqueue(NewDlqEntry {
            original_payload: payload,
            source_device_id: device_id,
            source_endpoint: "/events".into(),
            batch_index: None,
            failure_reason: "storage unavailable".into(),
        });

        let outcome = runtime.retry_dlq_entry(entry_id, "admin@example.com").await.unwrap();
        assert_eq!(outcome.sequence_id, 1);

        let entry = runtime.dlq.get(entry_id).unwrap();
        assert_eq!(entry.status, DlqStatus::Resolved);
    }

    #[tokio::test]
    async fn retry_dlq_entry_returns_a_still_failing_entry_to_pending_with_incremented_count() {
        let runtime = Runtime::bootstrap(RuntimeConfig::default(), Arc::new(AllowAll)).await.unwrap();
        let device_id = DeviceId(uuid::Uuid::new_v4());
        let carrier_id = CarrierId(uuid::Uuid::new_v4());
        let driver_id = DriverId(uuid::Uuid::new_v4());
        let vehicle_id = VehicleId(uuid::Uuid::new_v4());

        let mut request = sample_request(device_id, carrier_id, driver_id, vehicle_id);
        request.log_date = "999999".into();
        let payload = serde_json::to_value(RequestPayload::from(&request)).unwrap();
        let entry_id = runtime.dlq.enqueue(NewDlqEntry {
            original_payload: payload,
            source_device_id: device_id,
            source_endpoint: "/events".into(),
            batch_index: None,
            failure_reason: "storage unavailable".into(),
        });

        let result = runtime.retry_dlq_entry(entry_id, "admin@example.com").await;
        assert!(result.is_err());

        let entry = runtime.dlq.get(entry_id).unwrap();
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.retry_count, 1);
    }
}
