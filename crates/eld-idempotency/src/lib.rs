#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-idempotency** – Idempotency Store (spec §4.5).
//!
//! Deduplicates client retries scoped to `{actor, clientKey}` so a request
//! that was already accepted (or is currently being handled) is never
//! re-executed. Callers are expected to treat every method as **fail-open**:
//! on a store error, log a warning and proceed without idempotency
//! protection rather than blocking ingestion (spec §4.5, §7).
//!
//! Mirrors the `RevocationStore` shape — a small async trait plus a
//! `parking_lot`/concurrent-map in-memory reference implementation, with
//! TTL expiry folded into the read path instead of a background sweep.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default time-to-live for a completed idempotency record (spec §4.5).
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Scopes an idempotency key to the actor that supplied it, so one client's
/// key can never replay another's request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopedKey {
    /// Identifies the submitting actor (carrier/account-level scope).
    pub actor_scope: String,
    /// The client-supplied idempotency key (`X-Idempotency-Key`).
    pub client_key: String,
}

impl ScopedKey {
    /// Build a scoped key from an actor scope and a raw client key.
    pub fn new(actor_scope: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            actor_scope: actor_scope.into(),
            client_key: client_key.into(),
        }
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor_scope, self.client_key)
    }
}

/// The cached outcome of a completed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedResponse {
    /// HTTP-style status code of the original response.
    pub status_code: u16,
    /// The original response body, replayed byte-for-byte.
    pub response_body: String,
    /// When the record was completed (used for TTL expiry).
    pub created_at: DateTime<Utc>,
}

/// The current state of a scoped key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyState {
    /// No record exists (or it expired).
    Absent,
    /// A request is currently executing for this key.
    InFlight,
    /// A request completed; its response is cached.
    Completed(CompletedResponse),
}

/// Outcome of attempting to transition a key into `in_flight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetInFlightOutcome {
    /// The key was `absent`; it is now `in_flight` and the caller should execute.
    Started,
    /// The key was already `completed`; the caller should replay this response
    /// without re-executing.
    ReplayCompleted(CompletedResponse),
    /// The key was already `in_flight`; a concurrent request is executing.
    Conflict,
}

/// Contract for storing and querying idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// O(1) lookup of the current state for `key`.
    async fn check(&self, key: &ScopedKey) -> anyhow::Result<IdempotencyState>;

    /// Attempt `absent -> in_flight`. See [`SetInFlightOutcome`].
    async fn set_in_flight(&self, key: &ScopedKey) -> anyhow::Result<SetInFlightOutcome>;

    /// Transition `in_flight -> completed`, caching `status_code`/`body` for
    /// [`DEFAULT_TTL_HOURS`].
    async fn set_completed(
        &self,
        key: &ScopedKey,
        status_code: u16,
        response_body: String,
    ) -> anyhow::Result<()>;

    /// Revert `in_flight -> absent` so the client may retry (called on a
    /// non-2xx outcome that should not be cached).
    async fn clear(&self, key: &ScopedKey) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
enum Record {
    InFlight,
    Completed(CompletedResponse),
}

/// In-memory reference implementation. Suitable for a single process; a
/// multi-instance deployment needs a shared backend (Redis, Postgres) behind
/// the same trait.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: DashMap<ScopedKey, Record>,
    ttl: chrono::Duration,
}

impl MemoryIdempotencyStore {
    /// Construct a store using the default 24h TTL.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    /// Construct a store with a custom TTL (for tests or tuned deployments).
    pub fn with_ttl(ttl: chrono::Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    fn is_expired(&self, completed: &CompletedResponse) -> bool {
        Utc::now() - completed.created_at > self.ttl
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check(&self, key: &ScopedKey) -> anyhow::Result<IdempotencyState> {
        match self.records.get(key).map(|r| r.clone()) {
            None => Ok(IdempotencyState::Absent),
            Some(Record::InFlight) => Ok(IdempotencyState::InFlight),
            Some(Record::Completed(completed)) => {
                if self.is_expired(&completed) {
                    self.records.remove(key);
                    Ok(IdempotencyState::Absent)
                } else {
                    Ok(IdempotencyState::Completed(completed))
                }
            }
        }
    }

    async fn set_in_flight(&self, key: &ScopedKey) -> anyhow::Result<SetInFlightOutcome> {
        if let Some(existing) = self.records.get(key).map(|r| r.clone()) {
            return match existing {
                Record::InFlight => Ok(SetInFlightOutcome::Conflict),
                Record::Completed(completed) if !self.is_expired(&completed) => {
                    Ok(SetInFlightOutcome::ReplayCompleted(completed))
                }
                Record::Completed(_) => {
                    self.records.insert(key.clone(), Record::InFlight);
                    Ok(SetInFlightOutcome::Started)
                }
            };
        }
        self.records.insert(key.clone(), Record::InFlight);
        Ok(SetInFlightOutcome::Started)
    }

    async fn set_completed(
        &self,
        key: &ScopedKey,
        status_code: u16,
        response_body: String,
    ) -> anyhow::Result<()> {
        self.records.insert(
            key.clone(),
            Record::Completed(CompletedResponse {
                status_code,
                response_body,
                created_at: Utc::now(),
            }),
        );
        Ok(())
    }

    async fn clear(&self, key: &ScopedKey) -> anyhow::Result<()> {
        if matches!(self.records.get(key).map(|r| r.clone()), Some(Record::InFlight)) {
            self.records.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_key_is_absent() {
        let store = MemoryIdempotencyStore::new();
        let key = ScopedKey::new("carrier-1", "abc");
        assert_eq!(store.check(&key).await.unwrap(), IdempotencyState::Absent);
    }

    #[tokio::test]
    async fn second_set_in_flight_conflicts() {
        let store = MemoryIdempotencyStore::new();
        let key = ScopedKey::new("carrier-1", "abc");
        assert_eq!(store.set_in_flight(&key).await.unwrap(), SetInFlightOutcome::Started);
        assert_eq!(store.set_in_flight(&key).await.unwrap(), SetInFlightOutcome::Conflict);
    }

    #[tokio::test]
    async fn completed_request_is_replayed_not_re_executed() {
        let store = MemoryIdempotencyStore::new();
        let key = ScopedKey::new("carrier-1", "abc");
        store.set_in_flight(&key).await.unwrap();
        store
            .set_completed(&key, 201, "{\"id\":\"e1\"}".into())
            .await
            .unwrap();

        let outcome = store.set_in_flight(&key).await.unwrap();
        match outcome {
            SetInFlightOutcome::ReplayCompleted(response) => {
                assert_eq!(response.status_code, 201);
                assert_eq!(response.response_body, "{\"id\":\"e1\"}");
            }
            other => panic!("expected ReplayCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_reverts_in_flight_to_absent() {
        let store = MemoryIdempotencyStore::new();
        let key = ScopedKey::new("carrier-1", "abc");
        store.set_in_flight(&key).await.unwrap();
        store.clear(&key).await.unwrap();
        assert_eq!(store.check(&key).await.unwrap(), IdempotencyState::Absent);
    }

    #[tokio::test]
    async fn completed_record_expires_after_ttl() {
        let store = MemoryIdempotencyStore::with_ttl(Duration::milliseconds(10));
        let key = ScopedKey::new("carrier-1", "abc");
        store.set_in_flight(&key).await.unwrap();
        store.set_completed(&key, 201, "body".into()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(store.check(&key).await.unwrap(), IdempotencyState::Absent);
    }

    #[tokio::test]
    async fn different_actor_scopes_do_not_collide() {
        let store = MemoryIdempotencyStore::new();
        let key_a = ScopedKey::new("carrier-1", "same-key");
        let key_b = ScopedKey::new("carrier-2", "same-key");
        store.set_in_flight(&key_a).await.unwrap();
        assert_eq!(store.check(&key_b).await.unwrap(), IdempotencyState::Absent);
    }
}
