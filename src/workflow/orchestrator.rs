//! Workflow orchestration: phase state machine and session registry.
//!
//! The orchestrator sequences one delegator per phase, carries the running
//! requirement set between phases, escalates low-confidence items to the
//! clarification gate, and is cancellable by correlation id. Transitions
//! are computed by the pure [`next_phase`] function from the finished
//! phase's result alone, so the pipeline is deterministic given identical
//! inputs and identical capability outputs.
//!
//! The registry of active runs is owned here: an entry is created on
//! submit, a second submission with the same correlation id is rejected
//! while the first is active, and the entry is dropped when the run
//! reaches a terminal state (the event channel survives it for the
//! configured grace period).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capability::{MinedRequirement, RequirementProvider};
use crate::config::{ConfigError, WorkflowConfig};
use crate::events::{EventBroadcaster, EventStream};
use crate::scheduler::ResultAggregator;

use super::cancel::{cancel_pair, CancelHandle, CancelToken};
use super::clarification::{AnswerStatus, ClarificationGate, GateOutcome};
use super::delegator::Delegator;
use super::types::{
    ClarificationQuestion, EventKind, ItemReport, Phase, PhaseOutcome, PhaseResult,
    RequirementItem, SourceDocument, Verdict, WorkflowRequest, WorkflowRun,
};

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A run with this correlation id is already active.
    #[error("duplicate correlation id '{0}': a run is already active")]
    DuplicateRun(String),

    /// No active run exists for this correlation id.
    #[error("no active run for correlation id '{0}'")]
    RunNotFound(String),

    /// Mining produced no requirement items.
    #[error("no requirement items after mining")]
    EmptyBatch,

    /// Every item in a phase errored.
    #[error("phase '{phase}' exhausted: all {total} item(s) errored")]
    PhaseExhausted { phase: Phase, total: usize },

    /// The run was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Computes the state that follows a finished phase.
///
/// Pure: the decision depends only on the phase result and the size of the
/// requirement set, never on external signals.
pub fn next_phase(current: Phase, result: &PhaseResult, item_count: usize) -> Phase {
    // Exhaustion escalates from any phase.
    if result.stats.total > 0 && result.stats.errored == result.stats.total {
        return Phase::Failed;
    }

    match current {
        Phase::Pending => Phase::Mining,
        Phase::Mining => {
            if item_count == 0 {
                Phase::Failed
            } else {
                Phase::KgBuild
            }
        }
        Phase::KgBuild => Phase::Validating,
        Phase::Validating => {
            if result.stats.failed > 0 {
                Phase::Rewriting
            } else {
                Phase::QaReview
            }
        }
        Phase::Rewriting => Phase::QaReview,
        Phase::QaReview => {
            if result.stats.failed > 0 {
                Phase::Clarification
            } else {
                Phase::Completed
            }
        }
        Phase::Clarification => Phase::Completed,
        Phase::Completed | Phase::Failed => current,
    }
}

/// Registry entry for an active run.
struct RunHandle {
    cancel: CancelHandle,
}

struct Inner {
    config: WorkflowConfig,
    provider: Arc<dyn RequirementProvider>,
    broadcaster: EventBroadcaster,
    gate: Arc<ClarificationGate>,
    runs: Mutex<HashMap<String, RunHandle>>,
}

/// Drives submitted batches through the phase state machine.
///
/// Cheap to clone; clones share the run registry and event channels.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl WorkflowOrchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Config` if the configuration is invalid.
    pub fn new(
        config: WorkflowConfig,
        provider: Arc<dyn RequirementProvider>,
    ) -> Result<Self, WorkflowError> {
        config.validate()?;
        let broadcaster = EventBroadcaster::new(config.replay_capacity, config.channel_grace);
        let gate = Arc::new(ClarificationGate::new(config.clarification_timeout));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                provider,
                broadcaster,
                gate,
                runs: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Subscribes to a run's event stream.
    pub fn subscribe(&self, correlation_id: &str) -> EventStream {
        self.inner.broadcaster.subscribe(correlation_id)
    }

    /// Returns whether a run is currently active.
    pub fn is_active(&self, correlation_id: &str) -> bool {
        self.lock_runs().contains_key(correlation_id)
    }

    /// Returns the number of active runs.
    pub fn active_runs(&self) -> usize {
        self.lock_runs().len()
    }

    /// Accepts a batch and starts driving it through the phases.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::DuplicateRun` if a run with the same
    /// correlation id is still active.
    pub fn submit(&self, request: WorkflowRequest) -> Result<(), WorkflowError> {
        let correlation_id = request.correlation_id.clone();
        let mut runs = self.lock_runs();
        if runs.contains_key(&correlation_id) {
            return Err(WorkflowError::DuplicateRun(correlation_id));
        }

        let (handle, token) = cancel_pair();
        runs.insert(correlation_id.clone(), RunHandle { cancel: handle });
        drop(runs);

        info!(
            correlation_id = %correlation_id,
            documents = request.documents.len(),
            items = request.items.len(),
            "Workflow accepted"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.drive(request, token).await;
        });
        Ok(())
    }

    /// Cancels an active run.
    ///
    /// In-flight delegators observe the cancellation within one item
    /// timeout; no phase transition is published afterwards.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::RunNotFound` if no run is active under this
    /// correlation id.
    pub fn cancel(&self, correlation_id: &str) -> Result<(), WorkflowError> {
        let runs = self.lock_runs();
        let handle = runs
            .get(correlation_id)
            .ok_or_else(|| WorkflowError::RunNotFound(correlation_id.to_string()))?;
        handle.cancel.cancel();
        drop(runs);

        self.inner.gate.cancel_run(correlation_id);
        info!(correlation_id = %correlation_id, "Workflow cancellation requested");
        Ok(())
    }

    /// Routes a human answer to its pending clarification question.
    pub fn answer_clarification(
        &self,
        correlation_id: &str,
        question_id: Uuid,
        value: impl Into<String>,
    ) -> AnswerStatus {
        self.inner.gate.answer(correlation_id, question_id, value)
    }

    /// Runs the full state machine for one request, then publishes the
    /// terminal events and drops the registry entry.
    async fn drive(self, request: WorkflowRequest, cancel: CancelToken) {
        let correlation_id = request.correlation_id.clone();
        let started_at = Utc::now();

        let mut items = request.items.clone();
        let outcome = self
            .run_phases(&correlation_id, &request.documents, &mut items, &cancel)
            .await;

        let (terminal, reason) = match &outcome {
            Ok(()) => (Phase::Completed, None),
            Err(err) => (Phase::Failed, Some(err.to_string())),
        };

        match &reason {
            None => info!(correlation_id = %correlation_id, "Workflow completed"),
            Some(reason) => {
                warn!(correlation_id = %correlation_id, reason = %reason, "Workflow failed")
            }
        }

        self.inner.broadcaster.publish(
            &correlation_id,
            EventKind::WorkflowStatus,
            serde_json::json!({ "phase": terminal, "reason": reason }),
        );

        let run = WorkflowRun {
            correlation_id: correlation_id.clone(),
            phase: terminal,
            reason,
            items,
            started_at,
            ended_at: Utc::now(),
        };
        self.inner.broadcaster.publish(
            &correlation_id,
            EventKind::WorkflowResult,
            serde_json::to_value(&run).unwrap_or_default(),
        );

        self.inner.gate.cancel_run(&correlation_id);
        self.inner.broadcaster.mark_terminal(&correlation_id);
        self.lock_runs().remove(&correlation_id);
    }

    /// The phase loop. Mutates `items` as phases complete; returns the
    /// failure that ended the run, if any.
    async fn run_phases(
        &self,
        correlation_id: &str,
        documents: &[SourceDocument],
        items: &mut Vec<RequirementItem>,
        cancel: &CancelToken,
    ) -> Result<(), WorkflowError> {
        let mut previous = Phase::Pending;
        let mut phase = Phase::Mining;
        let mut prev_result: Option<PhaseResult> = None;

        loop {
            self.publish_transition(correlation_id, previous, phase);

            let result = match phase {
                Phase::Mining => {
                    self.run_mining(correlation_id, documents, items, cancel).await
                }
                Phase::KgBuild => self.run_kg_build(correlation_id, items, cancel).await,
                Phase::Validating => {
                    self.run_scoring(Phase::Validating, correlation_id, items.clone(), cancel)
                        .await
                }
                Phase::Rewriting => {
                    let failed = prev_result
                        .as_ref()
                        .map(|r| r.failed_ids())
                        .unwrap_or_default();
                    self.run_rewriting(correlation_id, items, &failed, cancel).await
                }
                Phase::QaReview => {
                    self.run_scoring(Phase::QaReview, correlation_id, items.clone(), cancel)
                        .await
                }
                Phase::Clarification => {
                    let flagged = prev_result
                        .as_ref()
                        .map(|r| r.failed_ids())
                        .unwrap_or_default();
                    self.run_clarification(correlation_id, items, &flagged, cancel)
                        .await?
                }
                // The loop returns before a terminal phase is ever entered.
                Phase::Pending | Phase::Completed | Phase::Failed => return Ok(()),
            };

            if cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            if phase != Phase::Mining {
                merge_outcomes(items, &result);
            }

            match next_phase(phase, &result, items.len()) {
                Phase::Failed => {
                    return Err(if phase == Phase::Mining && items.is_empty() {
                        WorkflowError::EmptyBatch
                    } else {
                        WorkflowError::PhaseExhausted {
                            phase,
                            total: result.stats.total,
                        }
                    });
                }
                Phase::Completed => return Ok(()),
                next => {
                    previous = phase;
                    phase = next;
                    prev_result = Some(result);
                }
            }
        }
    }

    /// Mines requirement items out of the submitted documents and merges
    /// them with the caller-supplied items in document order.
    async fn run_mining(
        &self,
        correlation_id: &str,
        documents: &[SourceDocument],
        items: &mut Vec<RequirementItem>,
        cancel: &CancelToken,
    ) -> PhaseResult {
        let delegator = self.delegator(Phase::Mining, correlation_id);
        let mined: Arc<Mutex<HashMap<String, Vec<MinedRequirement>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let provider = Arc::clone(&self.inner.provider);
        let collector = Arc::clone(&mined);
        let handler = move |doc: SourceDocument, _cancel: CancelToken| {
            let provider = Arc::clone(&provider);
            let collector = Arc::clone(&collector);
            async move {
                let requirements = provider.mine(&doc.content).await?;
                let count = requirements.len();
                collector
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(doc.id.clone(), requirements);
                Ok(ItemReport::new(
                    Verdict::Pass,
                    format!("mined {} requirement(s)", count),
                ))
            }
        };

        let result = delegator
            .run_phase(documents.to_vec(), handler, cancel.clone())
            .await;

        // Merge in document submission order so item ids and ordering are
        // deterministic regardless of worker completion order.
        let mut mined = mined
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for doc in documents {
            let Some(requirements) = mined.remove(&doc.id) else {
                continue;
            };
            for (ordinal, requirement) in requirements.into_iter().enumerate() {
                let item_id = requirement
                    .id
                    .unwrap_or_else(|| format!("{}-{}", doc.id, ordinal + 1));
                if items.iter().any(|i| i.id == item_id) {
                    warn!(
                        correlation_id = %correlation_id,
                        item_id = %item_id,
                        "Mined item id collides with an existing item, skipping"
                    );
                    continue;
                }
                let mut item = RequirementItem::new(item_id, requirement.text);
                item.source_ref = requirement.source_ref.or_else(|| Some(doc.id.clone()));
                items.push(item);
            }
        }

        result
    }

    /// Indexes every item into the knowledge graph, one worker per item.
    async fn run_kg_build(
        &self,
        correlation_id: &str,
        items: &[RequirementItem],
        cancel: &CancelToken,
    ) -> PhaseResult {
        let delegator = self.delegator(Phase::KgBuild, correlation_id);
        let provider = Arc::clone(&self.inner.provider);
        let top_k = self.inner.config.search_top_k;

        let handler = move |item: RequirementItem, _cancel: CancelToken| {
            let provider = Arc::clone(&provider);
            async move {
                let delta = provider.build_graph(std::slice::from_ref(&item)).await?;
                let neighbors = provider.search(&item.text, top_k).await?;
                Ok(ItemReport::new(
                    Verdict::Pass,
                    format!(
                        "indexed {} node(s), {} edge(s); {} neighbor(s)",
                        delta.nodes,
                        delta.edges,
                        neighbors.len()
                    ),
                ))
            }
        };

        delegator
            .run_phase(items.to_vec(), handler, cancel.clone())
            .await
    }

    /// Scores every item against the pass threshold. Used by both the
    /// validation and QA review phases.
    async fn run_scoring(
        &self,
        phase: Phase,
        correlation_id: &str,
        items: Vec<RequirementItem>,
        cancel: &CancelToken,
    ) -> PhaseResult {
        let delegator = self.delegator(phase, correlation_id);
        let provider = Arc::clone(&self.inner.provider);
        let threshold = self.inner.config.pass_threshold;

        let handler = move |item: RequirementItem, _cancel: CancelToken| {
            let provider = Arc::clone(&provider);
            async move {
                let evaluation = provider.evaluate(&item.text).await?;
                let verdict = if evaluation.passes(threshold) {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                };
                Ok(ItemReport::new(
                    verdict,
                    format!(
                        "score {:.2} against threshold {:.2}",
                        evaluation.score, threshold
                    ),
                )
                .with_score(evaluation.score)
                .with_baseline_score(item.current_score))
            }
        };

        delegator.run_phase(items, handler, cancel.clone()).await
    }

    /// Rewrites the items that failed validation and re-scores them.
    async fn run_rewriting(
        &self,
        correlation_id: &str,
        items: &[RequirementItem],
        failed_ids: &[String],
        cancel: &CancelToken,
    ) -> PhaseResult {
        let subset: Vec<RequirementItem> = items
            .iter()
            .filter(|item| failed_ids.contains(&item.id))
            .cloned()
            .collect();

        let delegator = self.delegator(Phase::Rewriting, correlation_id);
        let provider = Arc::clone(&self.inner.provider);
        let threshold = self.inner.config.pass_threshold;

        let handler = move |item: RequirementItem, _cancel: CancelToken| {
            let provider = Arc::clone(&provider);
            async move {
                let atoms = provider.suggest(&item.text).await?;
                let rewritten = provider.rewrite(&item.text, &atoms).await?;
                let evaluation = provider.evaluate(&rewritten).await?;
                let verdict = if evaluation.passes(threshold) {
                    Verdict::Pass
                } else {
                    Verdict::Fail
                };
                Ok(ItemReport::new(
                    verdict,
                    format!(
                        "rewritten with {} suggestion(s), score {:.2}",
                        atoms.len(),
                        evaluation.score
                    ),
                )
                .with_score(evaluation.score)
                .with_baseline_score(item.current_score)
                .with_rewritten_text(rewritten))
            }
        };

        delegator.run_phase(subset, handler, cancel.clone()).await
    }

    /// Publishes one question per flagged item and waits for the answers
    /// concurrently. A timeout resolves an item to manual review; run
    /// cancellation aborts the phase.
    async fn run_clarification(
        &self,
        correlation_id: &str,
        items: &[RequirementItem],
        flagged_ids: &[String],
        cancel: &CancelToken,
    ) -> Result<PhaseResult, WorkflowError> {
        let mut waits = Vec::new();
        for item_id in flagged_ids {
            let Some(item) = items.iter().find(|i| &i.id == item_id) else {
                continue;
            };
            let question = ClarificationQuestion::new(
                correlation_id,
                item_id.clone(),
                format!(
                    "Requirement '{}' scored below the pass threshold after review. \
                     Accept it as-is or flag it for manual review?",
                    item.id
                ),
                vec!["accept".to_string(), "manual_review".to_string()],
            );
            // Register before publishing so an answer that races the event
            // is never rejected.
            let pending = self.inner.gate.register(&question);
            self.inner.broadcaster.publish(
                correlation_id,
                EventKind::Question,
                serde_json::to_value(&question).unwrap_or_default(),
            );
            waits.push((item_id.clone(), pending));
        }

        let resolutions =
            futures::future::join_all(waits.into_iter().map(|(item_id, pending)| {
                let gate = Arc::clone(&self.inner.gate);
                async move { (item_id, gate.wait(pending, cancel).await) }
            }))
            .await;

        let mut aggregator = ResultAggregator::new(Phase::Clarification);
        let mut cancelled = false;
        for (item_id, outcome) in resolutions {
            match outcome {
                GateOutcome::Answered(answer) => {
                    let verdict = if answer.value == "manual_review" {
                        Verdict::Fail
                    } else {
                        Verdict::Pass
                    };
                    self.inner.broadcaster.publish(
                        correlation_id,
                        EventKind::AgentMessage,
                        serde_json::json!({
                            "phase": Phase::Clarification,
                            "item_id": item_id,
                            "resolution": answer.value,
                        }),
                    );
                    aggregator.record(
                        item_id,
                        PhaseOutcome::new(
                            Phase::Clarification,
                            verdict,
                            format!("clarified: {}", answer.value),
                        ),
                    );
                }
                GateOutcome::TimedOut => {
                    aggregator.record(
                        item_id,
                        PhaseOutcome::new(
                            Phase::Clarification,
                            Verdict::Fail,
                            "clarification timed out, flagged for manual review",
                        ),
                    );
                }
                GateOutcome::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            return Err(WorkflowError::Cancelled);
        }
        Ok(aggregator.finalize())
    }

    fn delegator(&self, phase: Phase, correlation_id: &str) -> Delegator {
        Delegator::new(
            phase,
            &self.inner.config,
            self.inner.broadcaster.clone(),
            correlation_id,
        )
    }

    fn publish_transition(&self, correlation_id: &str, previous: Phase, phase: Phase) {
        info!(
            correlation_id = %correlation_id,
            from = %previous,
            to = %phase,
            "Phase transition"
        );
        self.inner.broadcaster.publish(
            correlation_id,
            EventKind::WorkflowStatus,
            serde_json::json!({ "phase": phase, "previous": previous }),
        );
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunHandle>> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Applies each item's phase outcome back onto the requirement set.
fn merge_outcomes(items: &mut [RequirementItem], result: &PhaseResult) {
    for item in items.iter_mut() {
        if let Some(outcome) = result.outcomes.get(&item.id) {
            item.apply_outcome(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::PhaseStats;

    fn result(phase: Phase, passed: usize, failed: usize, errored: usize) -> PhaseResult {
        PhaseResult {
            phase,
            outcomes: HashMap::new(),
            stats: PhaseStats {
                total: passed + failed + errored,
                passed,
                failed,
                errored,
                improved: 0,
                avg_score: 0.0,
            },
        }
    }

    #[test]
    fn test_mining_transition() {
        let r = result(Phase::Mining, 2, 0, 0);
        assert_eq!(next_phase(Phase::Mining, &r, 5), Phase::KgBuild);
        assert_eq!(next_phase(Phase::Mining, &r, 0), Phase::Failed);
    }

    #[test]
    fn test_validating_branches_on_failures() {
        let clean = result(Phase::Validating, 5, 0, 0);
        assert_eq!(next_phase(Phase::Validating, &clean, 5), Phase::QaReview);

        let with_failures = result(Phase::Validating, 3, 2, 0);
        assert_eq!(
            next_phase(Phase::Validating, &with_failures, 5),
            Phase::Rewriting
        );
    }

    #[test]
    fn test_rewriting_always_advances_to_qa() {
        let r = result(Phase::Rewriting, 1, 1, 0);
        assert_eq!(next_phase(Phase::Rewriting, &r, 5), Phase::QaReview);
    }

    #[test]
    fn test_qa_branches_on_flags() {
        let clean = result(Phase::QaReview, 5, 0, 0);
        assert_eq!(next_phase(Phase::QaReview, &clean, 5), Phase::Completed);

        let flagged = result(Phase::QaReview, 4, 1, 0);
        assert_eq!(
            next_phase(Phase::QaReview, &flagged, 5),
            Phase::Clarification
        );
    }

    #[test]
    fn test_clarification_completes() {
        let r = result(Phase::Clarification, 1, 1, 0);
        assert_eq!(next_phase(Phase::Clarification, &r, 5), Phase::Completed);
    }

    #[test]
    fn test_exhaustion_fails_from_any_phase() {
        let exhausted = result(Phase::Validating, 0, 0, 4);
        assert_eq!(next_phase(Phase::Validating, &exhausted, 4), Phase::Failed);
        assert_eq!(next_phase(Phase::KgBuild, &exhausted, 4), Phase::Failed);
        assert_eq!(next_phase(Phase::QaReview, &exhausted, 4), Phase::Failed);
    }

    #[test]
    fn test_partial_errors_do_not_fail_the_run() {
        let partial = result(Phase::Validating, 3, 0, 1);
        assert_eq!(next_phase(Phase::Validating, &partial, 4), Phase::QaReview);
    }

    #[test]
    fn test_empty_phase_result_is_not_exhaustion() {
        // A rewriting pass over zero items (nothing failed validation)
        // must not trip the all-errored escalation.
        let empty = result(Phase::Rewriting, 0, 0, 0);
        assert_eq!(next_phase(Phase::Rewriting, &empty, 5), Phase::QaReview);
    }

    #[test]
    fn test_merge_outcomes_targets_items_by_id() {
        let mut items = vec![
            RequirementItem::new("r1", "first"),
            RequirementItem::new("r2", "second"),
        ];
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "r2".to_string(),
            PhaseOutcome::new(Phase::Validating, Verdict::Fail, "low").with_score(0.3),
        );
        let result = PhaseResult {
            phase: Phase::Validating,
            outcomes,
            stats: PhaseStats::default(),
        };

        merge_outcomes(&mut items, &result);
        assert!(items[0].history.is_empty());
        assert_eq!(items[1].current_score, Some(0.3));
        assert_eq!(items[1].verdict, Some(Verdict::Fail));
    }
}
