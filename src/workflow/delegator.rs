//! Phase-scoped coordination: one delegator per phase.
//!
//! A delegator owns the task queue, worker pool and result aggregator for
//! a single phase of one run. It chooses the concurrency ceiling from the
//! phase configuration and forwards an `agent_message` progress event with
//! running counters after every item completes.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::WorkflowConfig;
use crate::error::CallError;
use crate::events::EventBroadcaster;
use crate::scheduler::{
    ItemOutcome, Keyed, ResultAggregator, TaskQueue, WorkerPool, WorkerPoolConfig,
};
use crate::workflow::cancel::CancelToken;
use crate::workflow::types::{EventKind, ItemReport, Phase, PhaseOutcome, PhaseResult, Verdict};

/// Running per-phase counters shared with the progress callback.
#[derive(Default)]
struct PhaseProgress {
    completed: AtomicUsize,
    passed: AtomicUsize,
    failed: AtomicUsize,
    errored: AtomicUsize,
}

/// Coordinator for one phase of one run.
pub struct Delegator {
    phase: Phase,
    correlation_id: String,
    pool: WorkerPool,
    broadcaster: EventBroadcaster,
}

impl Delegator {
    /// Creates a delegator for a phase, sizing its pool from configuration.
    pub fn new(
        phase: Phase,
        config: &WorkflowConfig,
        broadcaster: EventBroadcaster,
        correlation_id: impl Into<String>,
    ) -> Self {
        let pool_config = WorkerPoolConfig::new(config.max_concurrent_for(phase))
            .with_per_item_timeout(config.per_item_timeout)
            .with_max_attempts(config.max_attempts);

        Self {
            phase,
            correlation_id: correlation_id.into(),
            pool: WorkerPool::new(pool_config),
            broadcaster,
        }
    }

    /// Returns the phase this delegator drives.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Fans the items into the worker pool and aggregates the outcomes.
    ///
    /// Every item produces exactly one outcome in the returned
    /// [`PhaseResult`]; pool-level failures (exhausted retries, fatal
    /// errors, cancellation) become `error` outcomes for that item only.
    pub async fn run_phase<T, H, Fut>(
        &self,
        items: Vec<T>,
        handler: H,
        cancel: CancelToken,
    ) -> PhaseResult
    where
        T: Keyed + Clone + Send + 'static,
        H: Fn(T, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ItemReport, CallError>> + Send + 'static,
    {
        let total = items.len();
        info!(
            correlation_id = %self.correlation_id,
            phase = %self.phase,
            items = total,
            max_concurrent = self.pool.config().max_concurrent,
            "Phase started"
        );

        let progress = Arc::new(PhaseProgress::default());
        let on_complete = {
            let progress = Arc::clone(&progress);
            let broadcaster = self.broadcaster.clone();
            let correlation_id = self.correlation_id.clone();
            let phase = self.phase;
            move |item_id: &str, outcome: &ItemOutcome<ItemReport>| {
                let verdict = match &outcome.result {
                    Ok(report) => report.verdict,
                    Err(_) => Verdict::Error,
                };
                match verdict {
                    Verdict::Pass => progress.passed.fetch_add(1, Ordering::SeqCst),
                    Verdict::Fail => progress.failed.fetch_add(1, Ordering::SeqCst),
                    Verdict::Error => progress.errored.fetch_add(1, Ordering::SeqCst),
                };
                let completed = progress.completed.fetch_add(1, Ordering::SeqCst) + 1;

                broadcaster.publish(
                    &correlation_id,
                    EventKind::AgentMessage,
                    serde_json::json!({
                        "phase": phase,
                        "item_id": item_id,
                        "verdict": verdict,
                        "attempts": outcome.attempts,
                        "completed": completed,
                        "total": total,
                        "passed": progress.passed.load(Ordering::SeqCst),
                        "failed": progress.failed.load(Ordering::SeqCst),
                        "errored": progress.errored.load(Ordering::SeqCst),
                    }),
                );
            }
        };

        let run = self
            .pool
            .run(TaskQueue::new(items), handler, cancel, on_complete)
            .await;

        let mut aggregator = ResultAggregator::new(self.phase);
        for (item_id, outcome) in run.outcomes {
            let phase_outcome = match outcome.result {
                Ok(report) => report.into_outcome(self.phase, outcome.attempts),
                Err(err) => {
                    PhaseOutcome::error(self.phase, err.to_string()).with_attempts(outcome.attempts)
                }
            };
            aggregator.record(item_id, phase_outcome);
        }

        let result = aggregator.finalize();
        info!(
            correlation_id = %self.correlation_id,
            phase = %self.phase,
            total = result.stats.total,
            passed = result.stats.passed,
            failed = result.stats.failed,
            errored = result.stats.errored,
            max_in_flight = run.stats.max_in_flight,
            "Phase complete"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use crate::workflow::cancel::cancel_pair;
    use crate::workflow::types::RequirementItem;

    fn test_config() -> WorkflowConfig {
        WorkflowConfig::default()
            .with_per_item_timeout(Duration::from_millis(200))
            .with_max_attempts(2)
    }

    fn test_items(n: usize) -> Vec<RequirementItem> {
        (0..n)
            .map(|i| RequirementItem::new(format!("r{}", i), format!("requirement {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_run_phase_produces_outcome_per_item() {
        let broadcaster = EventBroadcaster::new(64, Duration::from_secs(1));
        let delegator = Delegator::new(
            Phase::Validating,
            &test_config(),
            broadcaster.clone(),
            "run-1",
        );
        let (_handle, cancel) = cancel_pair();

        let result = delegator
            .run_phase(
                test_items(7),
                |_item: RequirementItem, _cancel: CancelToken| async move {
                    Ok(ItemReport::new(Verdict::Pass, "scored").with_score(0.9))
                },
                cancel,
            )
            .await;

        assert_eq!(result.phase, Phase::Validating);
        assert_eq!(result.outcomes.len(), 7);
        assert_eq!(result.stats.total, 7);
        assert_eq!(result.stats.passed, 7);
        assert!((result.stats.avg_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_phase_publishes_progress_events() {
        let broadcaster = EventBroadcaster::new(64, Duration::from_secs(1));
        let mut stream = broadcaster.subscribe("run-1");
        let delegator = Delegator::new(
            Phase::Validating,
            &test_config(),
            broadcaster.clone(),
            "run-1",
        );
        let (_handle, cancel) = cancel_pair();

        delegator
            .run_phase(
                test_items(3),
                |_item: RequirementItem, _cancel: CancelToken| async move {
                    Ok(ItemReport::new(Verdict::Pass, "ok"))
                },
                cancel,
            )
            .await;

        let mut completed_counts = Vec::new();
        for _ in 0..3 {
            let event = stream.next().await.expect("progress event");
            assert_eq!(event.kind, EventKind::AgentMessage);
            assert_eq!(event.payload["total"], 3);
            completed_counts.push(event.payload["completed"].as_u64().unwrap());
        }
        completed_counts.sort();
        assert_eq!(completed_counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_worker_errors_become_error_outcomes() {
        let broadcaster = EventBroadcaster::new(64, Duration::from_secs(1));
        let delegator = Delegator::new(
            Phase::Validating,
            &test_config(),
            broadcaster.clone(),
            "run-1",
        );
        let (_handle, cancel) = cancel_pair();

        let result = delegator
            .run_phase(
                test_items(3),
                |item: RequirementItem, _cancel: CancelToken| async move {
                    if item.id == "r1" {
                        return Err(CallError::fatal("bad item"));
                    }
                    Ok(ItemReport::new(Verdict::Pass, "ok"))
                },
                cancel,
            )
            .await;

        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(result.stats.errored, 1);
        assert_eq!(result.stats.passed, 2);
        let errored = &result.outcomes["r1"];
        assert_eq!(errored.verdict, Verdict::Error);
        assert!(errored.detail.contains("bad item"));
    }

    #[tokio::test]
    async fn test_phase_ceiling_comes_from_config() {
        let config = test_config().with_phase_concurrency(Phase::Rewriting, 2);
        let broadcaster = EventBroadcaster::new(64, Duration::from_secs(1));
        let delegator = Delegator::new(Phase::Rewriting, &config, broadcaster, "run-1");
        assert_eq!(delegator.pool.config().max_concurrent, 2);
        assert_eq!(delegator.phase(), Phase::Rewriting);
    }
}
