//! Failure Pattern Detection
//!
//! Keeps a one-hour sliding window of failure timestamps per node and a histogram of
//! failure types. A node is considered to be *repeatedly* failing when the window holds at
//! least three failures and the last three arrived no more than five minutes apart.

use super::types::FailureType;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PATTERN_WINDOW_MS: u64 = 60 * 60 * 1000;
pub const REPEAT_GAP_MS: u64 = 5 * 60 * 1000;
pub const REPEAT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FailurePattern {
    pub total_failures: u64,
    pub failure_types: BTreeMap<FailureType, u64>,
    /// Ascending; only entries within the last hour are retained.
    pub failure_timestamps: Vec<u64>,
    pub is_repeating_failure: bool,
    pub dominant_failure_type: Option<FailureType>,
}

impl FailurePattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a failure, prunes the window and recomputes the derived fields.
    pub fn record(&mut self, failure_type: FailureType, now: u64) {
        self.total_failures += 1;
        *self.failure_types.entry(failure_type).or_insert(0) += 1;

        let position = self.failure_timestamps.partition_point(|&t| t <= now);
        self.failure_timestamps.insert(position, now);

        self.prune(now);
    }

    /// Drops timestamps older than the window and re-evaluates the pattern.
    pub fn prune(&mut self, now: u64) {
        self.failure_timestamps
            .retain(|&t| now.saturating_sub(t) <= PATTERN_WINDOW_MS);
        self.recompute();
    }

    fn recompute(&mut self) {
        let stamps = &self.failure_timestamps;
        self.is_repeating_failure = stamps.len() >= REPEAT_THRESHOLD
            && stamps[stamps.len() - REPEAT_THRESHOLD..]
                .windows(2)
                .all(|pair| pair[1] - pair[0] <= REPEAT_GAP_MS);

        // Ties resolve to the first type in declaration order.
        self.dominant_failure_type = self
            .failure_types
            .iter()
            .fold(None, |best: Option<(FailureType, u64)>, (&kind, &count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((kind, count)),
            })
            .map(|(kind, _)| kind);
    }

    pub fn failures_in_window(&self) -> usize {
        self.failure_timestamps.len()
    }
}
