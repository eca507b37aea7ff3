#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-sequence** – Sequence-ID Allocator (spec §4.3).
//!
//! Issues a per-`(device_id, log_date)` monotonic counter, 1..65535, with
//! offline block reservation and gap tolerance. This crate is the pure
//! state-transition logic: the compare-and-set "serialization point" the
//! spec calls out is the caller's responsibility (a scope-keyed lock in
//! `eld-ingest`, or `SELECT ... FOR UPDATE` in a transactional store) —
//! mirroring the optimistic-concurrency `get_next_seq` shape used by
//! comparable event-log appenders, where the sequence bump and the
//! uniqueness check happen under one lock but the bump logic itself is a
//! plain function.

use eld_types::{DeviceId, GAP_WARNING_THRESHOLD, LARGE_GAP_THRESHOLD, SEQUENCE_ID_MAX, SEQUENCE_ID_MIN};
use serde::{Deserialize, Serialize};

/// The `(device, log_date)` pair that defines a sequence-id counter and
/// hash-chain scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Device the counter belongs to.
    pub device_id: DeviceId,
    /// MMDDYY log date, driver's home-terminal timezone.
    pub log_date: String,
}

/// A pre-drawn block of sequence ids for offline devices (spec §4.3 `Reserve`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationBlock {
    /// First id in the block (inclusive).
    pub start: u32,
    /// Last id in the block (inclusive).
    pub end: u32,
    /// Unix timestamp (seconds) the reservation expires at.
    ///
    /// Per the Open Question resolution in spec §9, an expired block is
    /// simply left in the history — the ids it covered remain consumed
    /// (`last_issued_id` was already bumped at reservation time), so
    /// expiry has no effect on allocation; it is retained for audit only.
    pub expires_at_unix: i64,
}

/// Persisted per-scope counter state (spec §3 `SequenceIdState`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SequenceIdState {
    /// Highest sequence id issued so far in this scope. `0` means none yet.
    pub last_issued_id: u32,
    /// History of reservation blocks drawn against this scope.
    pub reservations: Vec<ReservationBlock>,
}

/// A gap-tolerance warning attached to an otherwise-accepted allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapWarning {
    /// `proposedId > lastIssuedId + 1` but `<= lastIssuedId + 10`.
    GapDetected,
    /// `proposedId > lastIssuedId + 10`.
    LargeGap,
}

/// Errors the allocator can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    /// `proposedId <= lastIssuedId`; the device must reload scope state.
    #[error("non-monotonic sequence id: proposed is not greater than last issued {last_issued_id}")]
    NonMonotonic {
        /// The scope's current `last_issued_id`, for client recovery.
        last_issued_id: u32,
    },
    /// The 16-bit value domain for this scope is exhausted.
    #[error("sequence id space exhausted for this scope")]
    SequenceExhausted,
}

/// Outcome of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The id that was allocated / accepted.
    pub sequence_id: u32,
    /// Gap-tolerance warning, if any.
    pub warning: Option<GapWarning>,
    /// The ids skipped over, if any (for compliance-export annotation).
    pub missing: Vec<u32>,
}

impl SequenceIdState {
    /// Issue the next sequential id with no client-proposed value
    /// (server-origin / online path).
    pub fn issue(&mut self) -> Result<Allocation, SequenceError> {
        let next = self.last_issued_id.checked_add(1).ok_or(SequenceError::SequenceExhausted)?;
        if next > SEQUENCE_ID_MAX {
            return Err(SequenceError::SequenceExhausted);
        }
        self.last_issued_id = next;
        Ok(Allocation {
            sequence_id: next,
            warning: None,
            missing: Vec::new(),
        })
    }

    /// Issue/validate a client-proposed id (offline-origin event, spec §4.3
    /// `Issue(proposedId?)`).
    pub fn issue_proposed(&mut self, proposed_id: u32) -> Result<Allocation, SequenceError> {
        if !(SEQUENCE_ID_MIN..=SEQUENCE_ID_MAX).contains(&proposed_id) {
            return Err(SequenceError::SequenceExhausted);
        }
        if proposed_id <= self.last_issued_id {
            return Err(SequenceError::NonMonotonic {
                last_issued_id: self.last_issued_id,
            });
        }

        let gap = proposed_id - self.last_issued_id;
        let missing: Vec<u32> = if gap > GAP_WARNING_THRESHOLD {
            ((self.last_issued_id + 1)..proposed_id).collect()
        } else {
            Vec::new()
        };
        let warning = if gap > LARGE_GAP_THRESHOLD {
            Some(GapWarning::LargeGap)
        } else if gap > GAP_WARNING_THRESHOLD {
            Some(GapWarning::GapDetected)
        } else {
            None
        };

        self.last_issued_id = proposed_id;
        Ok(Allocation {
            sequence_id: proposed_id,
            warning,
            missing,
        })
    }

    /// Pre-draw a contiguous block of `count` ids for offline use (spec §4.3
    /// `Reserve`). `now_unix` and `ttl_secs` let the caller control the
    /// expiry clock without this crate touching wall-clock time directly.
    pub fn reserve(
        &mut self,
        count: u32,
        now_unix: i64,
        ttl_secs: i64,
    ) -> Result<ReservationBlock, SequenceError> {
        if count == 0 {
            return Err(SequenceError::SequenceExhausted);
        }
        let start = self.last_issued_id.checked_add(1).ok_or(SequenceError::SequenceExhausted)?;
        let end = self.last_issued_id.checked_add(count).ok_or(SequenceError::SequenceExhausted)?;
        if end > SEQUENCE_ID_MAX {
            return Err(SequenceError::SequenceExhausted);
        }

        let block = ReservationBlock {
            start,
            end,
            expires_at_unix: now_unix + ttl_secs,
        };
        self.last_issued_id = end;
        self.reservations.push(block);
        Ok(block)
    }

    /// Detect the expected-vs-missing ids given the set of sequence ids
    /// actually present for this scope (spec §4.9 `detectGaps`).
    pub fn detect_gaps(&self, present_ids: &[u32]) -> Vec<u32> {
        let mut present: Vec<u32> = present_ids.to_vec();
        present.sort_unstable();
        let mut missing = Vec::new();
        let mut expected = SEQUENCE_ID_MIN;
        for id in present {
            while expected < id {
                missing.push(expected);
                expected += 1;
            }
            expected = id + 1;
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_is_sequential() {
        let mut state = SequenceIdState::default();
        assert_eq!(state.issue().unwrap().sequence_id, 1);
        assert_eq!(state.issue().unwrap().sequence_id, 2);
        assert_eq!(state.issue().unwrap().sequence_id, 3);
    }

    #[test]
    fn proposed_equal_to_last_plus_one_has_no_warning() {
        let mut state = SequenceIdState {
            last_issued_id: 10,
            reservations: Vec::new(),
        };
        let alloc = state.issue_proposed(11).unwrap();
        assert_eq!(alloc.sequence_id, 11);
        assert_eq!(alloc.warning, None);
        assert!(alloc.missing.is_empty());
    }

    #[test]
    fn proposed_plus_two_is_gap_detected() {
        let mut state = SequenceIdState {
            last_issued_id: 10,
            reservations: Vec::new(),
        };
        let alloc = state.issue_proposed(12).unwrap();
        assert_eq!(alloc.warning, Some(GapWarning::GapDetected));
        assert_eq!(alloc.missing, vec![11]);
    }

    #[test]
    fn proposed_plus_eleven_is_large_gap() {
        let mut state = SequenceIdState {
            last_issued_id: 10,
            reservations: Vec::new(),
        };
        let alloc = state.issue_proposed(21).unwrap();
        assert_eq!(alloc.warning, Some(GapWarning::LargeGap));
        assert_eq!(alloc.missing.len(), 10);
    }

    #[test]
    fn proposed_less_or_equal_is_non_monotonic() {
        let mut state = SequenceIdState {
            last_issued_id: 47,
            reservations: Vec::new(),
        };
        let err = state.issue_proposed(44).unwrap_err();
        assert_eq!(err, SequenceError::NonMonotonic { last_issued_id: 47 });
    }

    #[test]
    fn reserve_then_issue_covers_block_with_no_gaps() {
        let mut state = SequenceIdState::default();
        let block = state.reserve(5, 0, 86_400).unwrap();
        assert_eq!(block.start, 1);
        assert_eq!(block.end, 5);
        assert_eq!(state.last_issued_id, 5);

        // Subsequent normal issues continue right after the reserved block.
        assert_eq!(state.issue().unwrap().sequence_id, 6);
    }

    #[test]
    fn exhaustion_at_max_value() {
        let mut state = SequenceIdState {
            last_issued_id: SEQUENCE_ID_MAX,
            reservations: Vec::new(),
        };
        let err = state.issue().unwrap_err();
        assert_eq!(err, SequenceError::SequenceExhausted);
    }

    #[test]
    fn detect_gaps_reports_missing_ids() {
        let state = SequenceIdState {
            last_issued_id: 47,
            reservations: Vec::new(),
        };
        let gaps = state.detect_gaps(&[1, 2, 3, 43, 47]);
        assert_eq!(gaps, vec![4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 44, 45, 46]);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// `reserve(scope, n); issue(scope) x n` covers exactly `[start..=end]`
        /// with no gaps (spec §8 round-trip law), for a freshly-reserved
        /// scope (every id up to `end` is accounted for).
        #[test]
        fn reserve_then_issuing_the_block_leaves_no_gaps(count in 1u32..100) {
            let mut state = SequenceIdState::default();
            let block = state.reserve(count, 0, 86_400).unwrap();
            prop_assert_eq!(block.start, 1);
            prop_assert_eq!(block.end, count);
            prop_assert_eq!(state.last_issued_id, block.end);
            prop_assert!(state.detect_gaps(&(block.start..=block.end).collect::<Vec<_>>()).is_empty());
        }

        /// `max(sequence_id of committed events) <= sequence_state.last_issued_id`
        /// (spec §8 quantified invariant): every successful allocation raises
        /// `last_issued_id` to exactly the id that was handed out.
        #[test]
        fn every_successful_allocation_advances_last_issued_to_itself(
            starting_id in 0u32..60_000,
            gap in 1u32..50,
        ) {
            let mut state = SequenceIdState {
                last_issued_id: starting_id,
                reservations: Vec::new(),
            };
            let proposed = starting_id + gap;
            if proposed <= SEQUENCE_ID_MAX {
                let alloc = state.issue_proposed(proposed).unwrap();
                prop_assert_eq!(alloc.sequence_id, state.last_issued_id);
                prop_assert_eq!(state.last_issued_id, proposed);
            }
        }

        /// `proposedId <= lastIssuedId` always yields `NON_MONOTONIC`
        /// (spec §8 quantified invariant).
        #[test]
        fn proposed_not_greater_than_last_issued_is_always_rejected(
            last_issued_id in 1u32..SEQUENCE_ID_MAX,
            back_by in 0u32..1000,
        ) {
            // Keep `proposed` within the valid id domain so the case under
            // test is genuinely non-monotonic, not merely out-of-range.
            let back_by = back_by.min(last_issued_id - SEQUENCE_ID_MIN);
            let proposed = last_issued_id - back_by;
            let mut state = SequenceIdState {
                last_issued_id,
                reservations: Vec::new(),
            };
            let result = state.issue_proposed(proposed);
            prop_assert_eq!(result, Err(SequenceError::NonMonotonic { last_issued_id }));
        }
    }
}
