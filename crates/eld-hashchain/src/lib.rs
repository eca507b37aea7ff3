#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-hashchain** – Hash-Chain Builder (spec §4.4).
//!
//! Computes per-event content hashes and the chain hash linking each event to
//! its predecessor within a `(device, log_date)` scope, and verifies chain
//! integrity over a contiguous range. Uses SHA-256 throughout, per the
//! spec's explicit algorithm choice (contrast with the teacher's Blake3
//! causal hashing in `toka-events-core`/`toka-store-core`).

use eld_events_core::Event;
use sha2::{Digest, Sha256};

/// Chain hash of a genesis event (first committed event in a scope).
pub const GENESIS_CHAIN_HASH: [u8; 32] = [0u8; 32];

/// Compute the SHA-256 content hash of an event's canonical field set
/// (spec §4.4).
pub fn content_hash(event: &Event) -> [u8; 32] {
    let canonical = event.canonical_content_json();
    // `serde_json::Map` is backed by a `BTreeMap` by default, so serializing
    // it always yields lexicographically sorted keys regardless of the
    // insertion order `canonical_content_json` used.
    let bytes = serde_json::to_vec(&canonical).expect("canonical JSON always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Compute the chain hash linking `content_hash` to `previous_chain_hash`
/// (spec §4.4): `SHA256(previousChainHash ∥ contentHash)`.
pub fn chain_hash(previous_chain_hash: &[u8; 32], content_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(previous_chain_hash);
    hasher.update(content_hash);
    hasher.finalize().into()
}

/// Result of linking a new event into its scope's chain: the event's own
/// content hash and chain hash, ready to be stamped onto the `Event` before
/// persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLink {
    /// SHA-256 of the canonical content fields.
    pub content_hash: [u8; 32],
    /// SHA-256 of `previous_chain_hash ∥ content_hash`.
    pub chain_hash: [u8; 32],
    /// The chain hash this event links to (`GENESIS_CHAIN_HASH` if first).
    pub previous_chain_hash: [u8; 32],
}

/// Link a new event onto the chain given the chain hash of the highest-
/// sequence active event in the same scope (`None` for genesis).
pub fn link(event: &Event, prior_chain_hash: Option<[u8; 32]>) -> ChainLink {
    let previous_chain_hash = prior_chain_hash.unwrap_or(GENESIS_CHAIN_HASH);
    let content = content_hash(event);
    let chain = chain_hash(&previous_chain_hash, &content);
    ChainLink {
        content_hash: content,
        chain_hash: chain,
        previous_chain_hash,
    }
}

/// Outcome of verifying a contiguous range of events in a scope
/// (spec §4.4 "Verification").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// `true` iff every event in the range satisfies the chain invariant.
    pub valid: bool,
    /// The sequence id of the first event that broke the chain, if any.
    pub first_broken_sequence_id: Option<u32>,
}

/// Verify that `events` (already ordered by ascending sequence id within one
/// scope) form a valid, unbroken hash chain.
///
/// The first event in the slice is trusted to be genesis *for this range* —
/// callers verifying a sub-range of a larger scope should pass the event
/// preceding the range as the implicit predecessor via `expected_first_prev`.
pub fn verify_chain(events: &[Event], expected_first_prev: Option<[u8; 32]>) -> VerificationResult {
    let mut prev_chain_hash = expected_first_prev;

    for event in events {
        let expected_prev = prev_chain_hash.unwrap_or(GENESIS_CHAIN_HASH);
        if event.previous_chain_hash != expected_prev {
            return VerificationResult {
                valid: false,
                first_broken_sequence_id: Some(event.sequence_id),
            };
        }

        let expected_content = content_hash(event);
        if event.content_hash != expected_content {
            return VerificationResult {
                valid: false,
                first_broken_sequence_id: Some(event.sequence_id),
            };
        }

        let expected_chain = chain_hash(&expected_prev, &expected_content);
        if event.chain_hash != expected_chain {
            return VerificationResult {
                valid: false,
                first_broken_sequence_id: Some(event.sequence_id),
            };
        }

        prev_chain_hash = Some(event.chain_hash);
    }

    VerificationResult {
        valid: true,
        first_broken_sequence_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eld_events_core::{EventSubType, EventType, RecordOrigin, RecordStatus};
    use eld_types::{CarrierId, DeviceId, DriverId, EventId, LogPeriodId, VehicleId};
    use uuid::Uuid;

    fn make_event(sequence_id: u32) -> Event {
        Event {
            id: EventId(Uuid::new_v4()),
            sequence_id,
            event_type: EventType::DutyStatusChange,
            event_sub_type: EventSubType::DutyStatus {
                code: "driving".into(),
            },
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
            latitude: None,
            longitude: None,
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

    #[test]
    fn content_hash_is_deterministic() {
        let event = make_event(1);
        assert_eq!(content_hash(&event), content_hash(&event));
    }

    #[test]
    fn genesis_links_to_zero_hash() {
        let event = make_event(1);
        let link = link(&event, None);
        assert_eq!(link.previous_chain_hash, GENESIS_CHAIN_HASH);
        assert_eq!(link.chain_hash, chain_hash(&GENESIS_CHAIN_HASH, &link.content_hash));
    }

    #[test]
    fn verify_chain_accepts_valid_sequence() {
        let mut e1 = make_event(1);
        let link1 = link(&e1, None);
        e1.content_hash = link1.content_hash;
        e1.chain_hash = link1.chain_hash;
        e1.previous_chain_hash = link1.previous_chain_hash;

        let mut e2 = make_event(2);
        let link2 = link(&e2, Some(e1.chain_hash));
        e2.content_hash = link2.content_hash;
        e2.chain_hash = link2.chain_hash;
        e2.previous_chain_hash = link2.previous_chain_hash;

        let result = verify_chain(&[e1, e2], None);
        assert!(result.valid);
        assert_eq!(result.first_broken_sequence_id, None);
    }

    #[test]
    fn verify_chain_detects_tamper() {
        let mut e1 = make_event(1);
        let link1 = link(&e1, None);
        e1.content_hash = link1.content_hash;
        e1.chain_hash = link1.chain_hash;
        e1.previous_chain_hash = link1.previous_chain_hash;

        let mut e2 = make_event(2);
        let link2 = link(&e2, Some(e1.chain_hash));
        e2.content_hash = link2.content_hash;
        e2.chain_hash = link2.chain_hash;
        e2.previous_chain_hash = link2.previous_chain_hash;

        // Tamper with e2's payload after the fact without recomputing hashes.
        e2.accumulated_vehicle_miles += 1;

        let result = verify_chain(&[e1, e2], None);
        assert!(!result.valid);
        assert_eq!(result.first_broken_sequence_id, Some(2));
    }
}
