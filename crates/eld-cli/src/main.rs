#![forbid(unsafe_code)]

//! **eld-cli** – Admin CLI for the ELD ingestion core.
//!
//! Plays the role an HTTP admin binder would play for the two operator-facing
//! routes §6 calls out: dead-letter-queue disposition and sequence-block
//! reservation for offline devices — the same narrow-surface role
//! `toka-cli` plays for kernel operations.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eld_dlq::{DlqEntryId, DlqFilter, Pagination};
use eld_runtime::{Runtime, RuntimeConfig};
use eld_sequence::Scope;
use eld_store_core::SequenceStateStore;
use eld_types::{CarrierId, DeviceId, DriverId, VehicleId};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "eld-cli")]
#[command(about = "Admin CLI for the ELD event-ingestion core")]
#[command(version)]
struct Cli {
    /// Path to a database file. Omit to use an in-memory store.
    #[arg(long)]
    db_path: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List dead-letter entries.
    DlqList {
        /// Restrict to entries with this status (pending, retrying, resolved, discarded).
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show a dead-letter entry's full payload.
    DlqGet {
        #[arg(long)]
        id: Uuid,
    },
    /// Discard a pending dead-letter entry without retrying it.
    DlqDiscard {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        notes: String,
    },
    /// Re-invoke ingestion on a pending dead-letter entry with a fresh sequence id.
    DlqRetry {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        retried_by: String,
    },
    /// Print aggregate dead-letter-queue counts.
    DlqStats,
    /// Pre-draw a block of sequence ids for an offline device.
    ReserveSequence {
        #[arg(long)]
        device_id: Uuid,
        #[arg(long)]
        log_date: String,
        /// Defaults to the runtime's configured `reservation_block_size`.
        #[arg(long)]
        count: Option<u32>,
        /// Defaults to the runtime's configured `reservation_ttl_secs`.
        #[arg(long)]
        ttl_secs: Option<i64>,
    },
    /// List unidentified-driving records pending disposition past the
    /// compliance-violation threshold.
    UnidentifiedListStale {
        /// Defaults to the 8-day spec threshold.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Attribute an unidentified-driving record to a driver.
    UnidentifiedClaim {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        driver_id: Uuid,
    },
    /// Reject an unidentified-driving record as not attributable.
    UnidentifiedReject {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RuntimeConfig::default();
    if let Some(path) = &cli.db_path {
        config.storage = eld_runtime::StorageConfig::Sqlite { path: path.clone() };
    }

    let runtime = Runtime::bootstrap(config, Arc::new(PermissiveCrossReferenceChecker)).await?;

    match cli.command {
        Commands::DlqList { status, offset, limit } => {
            let status = status.map(|s| parse_status(&s)).transpose()?;
            let entries = runtime.dlq.list(&DlqFilter { status, device_id: None, endpoint: None }, Pagination { offset, limit });
            for entry in entries {
                println!("{} [{:?}] {} (retries={})", entry.id.0, entry.status, entry.failure_reason, entry.retry_count);
            }
        }
        Commands::DlqGet { id } => {
            let entry = runtime.dlq.get(DlqEntryId(id)).context("no such dlq entry")?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::DlqDiscard { id, notes } => {
            runtime.dlq.discard(DlqEntryId(id), notes)?;
            info!(id = %id, "dlq entry discarded");
        }
        Commands::DlqRetry { id, retried_by } => match runtime.retry_dlq_entry(DlqEntryId(id), retried_by).await {
            Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            Err(err) => {
                error!(id = %id, error = %err, "dlq retry failed");
                return Err(err);
            }
        },
        Commands::DlqStats => {
            let stats = runtime.dlq.stats(runtime.config.dlq_alert_threshold);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if stats.alert_threshold_exceeded {
                error!(pending = stats.pending, threshold = runtime.config.dlq_alert_threshold, "dlq pending count exceeds alert threshold");
            }
        }
        Commands::ReserveSequence { device_id, log_date, count, ttl_secs } => {
            let count = count.unwrap_or(runtime.config.reservation_block_size);
            let ttl_secs = ttl_secs.unwrap_or(runtime.config.reservation_ttl_secs);
            let scope = Scope { device_id: DeviceId(device_id), log_date };
            let mut state = runtime.event_store.get(&scope).await?;
            let block = state.reserve(count, unix_now(), ttl_secs)?;
            runtime.event_store.put(&scope, state).await?;
            println!("reserved {}..={} (expires {})", block.start, block.end, block.expires_at_unix);
        }
        Commands::UnidentifiedListStale { older_than_days } => {
            let older_than_days = older_than_days.unwrap_or(eld_events_core::unidentified::STALE_THRESHOLD_DAYS as u32);
            let stale = runtime.unidentified.list_stale(older_than_days);
            println!("{}", serde_json::to_string_pretty(&stale)?);
        }
        Commands::UnidentifiedClaim { id, driver_id } => {
            runtime.unidentified.claim(id, DriverId(driver_id))?;
            info!(id = %id, "unidentified driving record claimed");
        }
        Commands::UnidentifiedReject { id, reason } => {
            runtime.unidentified.reject(id, reason)?;
            info!(id = %id, "unidentified driving record rejected");
        }
    }

    Ok(())
}

fn parse_status(value: &str) -> Result<eld_dlq::DlqStatus> {
    match value {
        "pending" => Ok(eld_dlq::DlqStatus::Pending),
        "retrying" => Ok(eld_dlq::DlqStatus::Retrying),
        "resolved" => Ok(eld_dlq::DlqStatus::Resolved),
        "discarded" => Ok(eld_dlq::DlqStatus::Discarded),
        other => anyhow::bail!("unknown status {other:?}"),
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// Stand-in cross-reference checker for the admin CLI: `DlqRetry` re-ingests
/// a failed payload, but the real directory lookups this would delegate to
/// are out of scope here, so every lookup is allowed.
struct PermissiveCrossReferenceChecker;

#[async_trait::async_trait]
impl eld_validation::CrossReferenceChecker for PermissiveCrossReferenceChecker {
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
