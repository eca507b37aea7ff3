#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-sync** – Sync Protocol Handler (spec §4.6).
//!
//! Drives the offline-drain flow: a device that was disconnected replays its
//! buffered events, each running through the same ingestion pipeline as the
//! online path (`eld-ingest`), then the server hands back any edits it made
//! to that carrier's events while the device was gone.

use chrono::{DateTime, Utc};
use eld_events_core::Event;
use eld_ingest::{BatchOutcome, IngestError, IngestionController, NewEventRequest};
use eld_store_core::{EventStore, TimeRange};
use eld_types::{CarrierId, DeviceId, MAX_SYNC_BATCH_SIZE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One offline-drain sync request (spec §4.6).
///
/// `events` must already be sorted by the client: log-date ascending, then
/// sequence-id ascending — the handler processes them in the order given
/// rather than re-sorting.
pub struct SyncRequest {
    /// Device draining its offline buffer.
    pub device_id: DeviceId,
    /// The carrier this device belongs to, used to look up server-side edits.
    pub carrier_id: CarrierId,
    /// The last successful sync's `newSyncedUpToAt`, or the device's
    /// enrollment time if this is its first sync.
    pub synced_up_to_at: DateTime<Utc>,
    /// Buffered events, at most `MAX_SYNC_BATCH_SIZE`; an empty list is
    /// valid (a sync purely to fetch server-side edits).
    pub events: Vec<NewEventRequest>,
}

/// A server-side edit the device hasn't seen yet (spec §4.6 step 4-5).
#[derive(Debug, Clone)]
pub struct ServerEditEvent {
    /// The edited event, as currently recorded.
    pub event: Event,
    /// Always `true`: every server edit must be surfaced to the driver.
    pub requires_driver_review: bool,
}

/// Outcome of a sync (spec §4.6).
#[derive(Debug)]
pub struct SyncOutcome {
    /// Results of running `request.events` through the ingestion pipeline.
    pub batch: BatchOutcome,
    /// Server-side edits made to this carrier's events since `synced_up_to_at`.
    pub server_events: Vec<ServerEditEvent>,
    /// Checkpoint the device should send as `syncedUpToAt` on its next sync.
    pub new_synced_up_to_at: DateTime<Utc>,
}

/// Drains one device's offline buffer through the ingestion pipeline, then
/// reports any server-side edits made to the carrier's log since the last
/// sync (spec §4.6).
pub async fn sync_batch(
    controller: &IngestionController,
    event_store: &Arc<dyn EventStore>,
    request: SyncRequest,
    cancellation: Option<&CancellationToken>,
) -> Result<SyncOutcome, IngestError> {
    let batch = controller
        .ingest_batch(request.events, "/sync/events", 0, MAX_SYNC_BATCH_SIZE, cancellation)
        .await?;

    let now = Utc::now();
    let range = match TimeRange::new(request.synced_up_to_at, now) {
        Ok(range) => range,
        Err(err) => {
            warn!(error = %err, "sync window is empty or inverted; skipping server-edit lookup");
            return Ok(SyncOutcome {
                batch,
                server_events: Vec::new(),
                new_synced_up_to_at: now,
            });
        }
    };

    let server_events = match event_store
        .find_by_carrier_updated_after(request.carrier_id, request.synced_up_to_at, range)
        .await
    {
        Ok(events) => events
            .into_iter()
            .map(|event| ServerEditEvent {
                event,
                requires_driver_review: true,
            })
            .collect(),
        Err(err) => {
            warn!(error = %err, device_id = ?request.device_id, "failed to fetch server-side edits for sync");
            Vec::new()
        }
    };

    Ok(SyncOutcome {
        batch,
        server_events,
        new_synced_up_to_at: now,
    })
}
