//! Deterministic per-phase result aggregation.
//!
//! Collects per-item outcomes keyed by stable item id, independent of the
//! order workers complete in, and folds them into phase statistics in a
//! single pass with O(1) counters. The average score uses an incremental
//! running mean over non-error outcomes, iterated in sorted id order so
//! repeated aggregation of the same outcomes is bit-identical.

use std::collections::HashMap;

use tracing::warn;

use crate::workflow::types::{Phase, PhaseOutcome, PhaseResult, PhaseStats, Verdict};

/// Builds one immutable [`PhaseResult`] per phase.
pub struct ResultAggregator {
    phase: Phase,
    outcomes: HashMap<String, PhaseOutcome>,
}

impl ResultAggregator {
    /// Creates an aggregator for one phase.
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            outcomes: HashMap::new(),
        }
    }

    /// Records the outcome for one item. Exactly one outcome is accepted
    /// per item; a second write for the same id is ignored.
    pub fn record(&mut self, item_id: impl Into<String>, outcome: PhaseOutcome) {
        let item_id = item_id.into();
        if self.outcomes.contains_key(&item_id) {
            warn!(
                phase = %self.phase,
                item_id = %item_id,
                "Duplicate outcome for item, keeping the first"
            );
            return;
        }
        self.outcomes.insert(item_id, outcome);
    }

    /// Returns the number of outcomes recorded so far.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns whether no outcomes have been recorded.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Finalizes the phase result. The result is immutable from here on.
    pub fn finalize(self) -> PhaseResult {
        let stats = compute_stats(&self.outcomes);
        PhaseResult {
            phase: self.phase,
            outcomes: self.outcomes,
            stats,
        }
    }
}

/// Folds outcomes into phase statistics in one pass.
///
/// The average is computed only over items with a non-error outcome that
/// carries a score, using the incremental form `avg += (x - avg) / n`.
fn compute_stats(outcomes: &HashMap<String, PhaseOutcome>) -> PhaseStats {
    let mut stats = PhaseStats {
        total: outcomes.len(),
        ..PhaseStats::default()
    };

    let mut ids: Vec<&String> = outcomes.keys().collect();
    ids.sort();

    let mut scored = 0usize;
    for id in ids {
        let outcome = &outcomes[id];
        match outcome.verdict {
            Verdict::Pass => stats.passed += 1,
            Verdict::Fail => stats.failed += 1,
            Verdict::Error => stats.errored += 1,
        }
        if outcome.is_improved() {
            stats.improved += 1;
        }
        if outcome.verdict != Verdict::Error {
            if let Some(score) = outcome.score {
                scored += 1;
                stats.avg_score += (score - stats.avg_score) / scored as f64;
            }
        }
    }

    stats
}
