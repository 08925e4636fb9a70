//! Core data model for workflow runs.
//!
//! This module defines the types shared across the orchestration core:
//!
//! - `Phase`: the workflow state machine states
//! - `RequirementItem`: a single requirement flowing through the phases
//! - `PhaseOutcome` / `PhaseResult` / `PhaseStats`: per-phase results
//! - `WorkflowEvent` / `EventKind`: the progress-event stream records
//! - `ClarificationQuestion` / `ClarificationAnswer`: the human gate types

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::worker_pool::Keyed;

/// One stage of the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Run accepted but not yet started.
    Pending,
    /// Mining requirement items out of source documents.
    Mining,
    /// Indexing items into the knowledge graph.
    KgBuild,
    /// Scoring items against the validation criteria.
    Validating,
    /// Rewriting items that failed validation.
    Rewriting,
    /// Final quality review of the full batch.
    QaReview,
    /// Waiting on human answers for low-confidence items.
    Clarification,
    /// Terminal: the run finished.
    Completed,
    /// Terminal: the run was aborted (exhaustion, cancellation).
    Failed,
}

impl Phase {
    /// Returns whether this phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "pending"),
            Phase::Mining => write!(f, "mining"),
            Phase::KgBuild => write!(f, "kg_build"),
            Phase::Validating => write!(f, "validating"),
            Phase::Rewriting => write!(f, "rewriting"),
            Phase::QaReview => write!(f, "qa_review"),
            Phase::Clarification => write!(f, "clarification"),
            Phase::Completed => write!(f, "completed"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// Verdict for one item in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// The item passed the phase.
    Pass,
    /// The item was scored and fell short.
    Fail,
    /// The phase handler could not produce a result for the item.
    Error,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
            Verdict::Error => write!(f, "error"),
        }
    }
}

/// A source document submitted for requirement mining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable identifier for the document.
    pub id: String,
    /// Raw document content.
    pub content: String,
}

impl SourceDocument {
    /// Creates a new source document.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

impl Keyed for SourceDocument {
    fn key(&self) -> &str {
        &self.id
    }
}

/// A single requirement item flowing through the workflow.
///
/// Workers never mutate items directly; they return per-item reports which
/// the orchestrator merges back by id, so the item's slot is written by
/// exactly one owner at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementItem {
    /// Stable identifier, caller- or mining-assigned.
    pub id: String,
    /// Current requirement text (updated by the rewrite phase).
    pub text: String,
    /// Where the requirement came from (document id, section).
    #[serde(default)]
    pub source_ref: Option<String>,
    /// Most recent evaluation score.
    #[serde(default)]
    pub current_score: Option<f64>,
    /// Most recent verdict.
    #[serde(default)]
    pub verdict: Option<Verdict>,
    /// Ordered per-phase outcome history, append-only.
    #[serde(default)]
    pub history: Vec<PhaseOutcome>,
}

impl RequirementItem {
    /// Creates a new requirement item.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source_ref: None,
            current_score: None,
            verdict: None,
            history: Vec::new(),
        }
    }

    /// Sets the source reference.
    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    /// Applies a phase outcome to this item: updates text/score/verdict and
    /// appends the outcome to the history.
    pub fn apply_outcome(&mut self, outcome: &PhaseOutcome) {
        if let Some(text) = &outcome.rewritten_text {
            self.text = text.clone();
        }
        if let Some(score) = outcome.score {
            self.current_score = Some(score);
        }
        self.verdict = Some(outcome.verdict);
        self.history.push(outcome.clone());
    }

    /// Returns the outcome recorded for a given phase, if any.
    pub fn outcome_for(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.history.iter().find(|o| o.phase == phase)
    }
}

impl Keyed for RequirementItem {
    fn key(&self) -> &str {
        &self.id
    }
}

/// The recorded result of one (item, phase) pair. Appended once, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    /// Phase that produced this outcome.
    pub phase: Phase,
    /// Score assigned in this phase, if the phase scores items.
    #[serde(default)]
    pub score: Option<f64>,
    /// Score the item carried before this phase, used to count improvements.
    #[serde(default)]
    pub baseline_score: Option<f64>,
    /// Verdict for the item in this phase.
    pub verdict: Verdict,
    /// Human-readable detail (error text, clarification resolution).
    pub detail: String,
    /// Number of handler attempts consumed for this item.
    pub attempts: u32,
    /// Replacement text produced by the rewrite phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewritten_text: Option<String>,
}

impl PhaseOutcome {
    /// Creates an outcome with the given verdict.
    pub fn new(phase: Phase, verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            phase,
            score: None,
            baseline_score: None,
            verdict,
            detail: detail.into(),
            attempts: 1,
            rewritten_text: None,
        }
    }

    /// Creates an error outcome for an item the handler could not process.
    pub fn error(phase: Phase, detail: impl Into<String>) -> Self {
        Self::new(phase, Verdict::Error, detail)
    }

    /// Sets the score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Sets the baseline score.
    pub fn with_baseline_score(mut self, score: f64) -> Self {
        self.baseline_score = Some(score);
        self
    }

    /// Sets the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Returns whether the outcome's score improved on its baseline.
    pub fn is_improved(&self) -> bool {
        match (self.score, self.baseline_score) {
            (Some(score), Some(baseline)) => score > baseline,
            _ => false,
        }
    }
}

/// What a phase handler reports for one item. The delegator stamps the
/// phase and attempt count to turn this into a [`PhaseOutcome`].
#[derive(Debug, Clone)]
pub struct ItemReport {
    /// Verdict for the item.
    pub verdict: Verdict,
    /// Score assigned by the handler, if any.
    pub score: Option<f64>,
    /// Score the item carried before this phase.
    pub baseline_score: Option<f64>,
    /// Human-readable detail.
    pub detail: String,
    /// Replacement text, set by the rewrite handler.
    pub rewritten_text: Option<String>,
}

impl ItemReport {
    /// Creates a report with the given verdict.
    pub fn new(verdict: Verdict, detail: impl Into<String>) -> Self {
        Self {
            verdict,
            score: None,
            baseline_score: None,
            detail: detail.into(),
            rewritten_text: None,
        }
    }

    /// Sets the score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Sets the baseline score.
    pub fn with_baseline_score(mut self, score: Option<f64>) -> Self {
        self.baseline_score = score;
        self
    }

    /// Sets the replacement text.
    pub fn with_rewritten_text(mut self, text: impl Into<String>) -> Self {
        self.rewritten_text = Some(text.into());
        self
    }

    /// Converts the report into a phase outcome.
    pub fn into_outcome(self, phase: Phase, attempts: u32) -> PhaseOutcome {
        PhaseOutcome {
            phase,
            score: self.score,
            baseline_score: self.baseline_score,
            verdict: self.verdict,
            detail: self.detail,
            attempts,
            rewritten_text: self.rewritten_text,
        }
    }
}

/// Aggregated statistics for one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    /// Number of items that entered the phase.
    pub total: usize,
    /// Items with a pass verdict.
    pub passed: usize,
    /// Items with a fail verdict.
    pub failed: usize,
    /// Items with an error verdict.
    pub errored: usize,
    /// Items whose score improved on their baseline.
    pub improved: usize,
    /// Mean score over non-error outcomes carrying a score.
    pub avg_score: f64,
}

/// The finalized result of one phase: per-item outcomes keyed by item id
/// plus aggregate statistics. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Phase this result belongs to.
    pub phase: Phase,
    /// Outcome per item id.
    pub outcomes: HashMap<String, PhaseOutcome>,
    /// Aggregate statistics.
    pub stats: PhaseStats,
}

impl PhaseResult {
    /// Returns the ids of items with a fail verdict, in sorted order.
    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.verdict == Verdict::Fail)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Kind of a workflow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Per-item progress from a delegator.
    AgentMessage,
    /// Phase transition.
    WorkflowStatus,
    /// Terminal payload for the run.
    WorkflowResult,
    /// Clarification prompt awaiting a human answer.
    Question,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::AgentMessage => write!(f, "agent_message"),
            EventKind::WorkflowStatus => write!(f, "workflow_status"),
            EventKind::WorkflowResult => write!(f, "workflow_result"),
            EventKind::Question => write!(f, "question"),
        }
    }
}

/// One record in the per-correlation event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Correlation id of the run this event belongs to.
    pub correlation_id: String,
    /// Monotonic sequence number per correlation id, no gaps.
    pub sequence: u64,
    /// Event kind.
    pub kind: EventKind,
    /// Kind-specific payload.
    pub payload: serde_json::Value,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

/// A clarification question raised for a low-confidence item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    /// Unique question id.
    pub question_id: Uuid,
    /// Run the question belongs to.
    pub correlation_id: String,
    /// Item the question is about.
    pub item_id: String,
    /// Prompt shown to the human reviewer.
    pub prompt: String,
    /// Suggested answer options.
    pub options: Vec<String>,
}

impl ClarificationQuestion {
    /// Creates a new question with a fresh id.
    pub fn new(
        correlation_id: impl Into<String>,
        item_id: impl Into<String>,
        prompt: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            question_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            item_id: item_id.into(),
            prompt: prompt.into(),
            options,
        }
    }
}

/// A resolved clarification answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationAnswer {
    /// Question being answered.
    pub question_id: Uuid,
    /// Answer value supplied by the reviewer.
    pub value: String,
    /// When the answer was accepted.
    pub answered_at: DateTime<Utc>,
}

/// A batch submission: one run per correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Caller-supplied correlation id tying the run to its event stream.
    pub correlation_id: String,
    /// Documents to mine requirement items from.
    #[serde(default)]
    pub documents: Vec<SourceDocument>,
    /// Pre-supplied requirement items.
    #[serde(default)]
    pub items: Vec<RequirementItem>,
}

impl WorkflowRequest {
    /// Creates a request carrying only pre-supplied items.
    pub fn with_items(correlation_id: impl Into<String>, items: Vec<RequirementItem>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            documents: Vec::new(),
            items,
        }
    }

    /// Creates a request carrying documents to mine.
    pub fn with_documents(
        correlation_id: impl Into<String>,
        documents: Vec<SourceDocument>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            documents,
            items: Vec::new(),
        }
    }
}

/// Snapshot of a run, carried in the terminal `workflow_result` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Correlation id of the run.
    pub correlation_id: String,
    /// Terminal phase (`completed` or `failed`).
    pub phase: Phase,
    /// Failure reason when the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Final requirement items with their histories.
    pub items: Vec<RequirementItem>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal phase.
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display_and_terminal() {
        assert_eq!(format!("{}", Phase::KgBuild), "kg_build");
        assert_eq!(format!("{}", Phase::QaReview), "qa_review");
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Validating.is_terminal());
    }

    #[test]
    fn test_phase_serde_names() {
        let json = serde_json::to_string(&Phase::KgBuild).expect("serialize");
        assert_eq!(json, "\"kg_build\"");
        let phase: Phase = serde_json::from_str("\"qa_review\"").expect("deserialize");
        assert_eq!(phase, Phase::QaReview);
    }

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::AgentMessage).expect("serialize");
        assert_eq!(json, "\"agent_message\"");
        assert_eq!(format!("{}", EventKind::WorkflowResult), "workflow_result");
    }

    #[test]
    fn test_apply_outcome_updates_item() {
        let mut item = RequirementItem::new("r1", "the system shall respond");
        let outcome = PhaseOutcome::new(Phase::Validating, Verdict::Fail, "below threshold")
            .with_score(0.4)
            .with_attempts(2);

        item.apply_outcome(&outcome);
        assert_eq!(item.current_score, Some(0.4));
        assert_eq!(item.verdict, Some(Verdict::Fail));
        assert_eq!(item.history.len(), 1);
        assert_eq!(item.outcome_for(Phase::Validating).unwrap().attempts, 2);
        assert!(item.outcome_for(Phase::Rewriting).is_none());
    }

    #[test]
    fn test_apply_outcome_rewrites_text() {
        let mut item = RequirementItem::new("r1", "old text");
        let mut outcome = PhaseOutcome::new(Phase::Rewriting, Verdict::Pass, "rewritten");
        outcome.rewritten_text = Some("new text".to_string());

        item.apply_outcome(&outcome);
        assert_eq!(item.text, "new text");
    }

    #[test]
    fn test_outcome_improvement() {
        let outcome = PhaseOutcome::new(Phase::Rewriting, Verdict::Pass, "ok")
            .with_score(0.8)
            .with_baseline_score(0.5);
        assert!(outcome.is_improved());

        let outcome = PhaseOutcome::new(Phase::Rewriting, Verdict::Pass, "ok").with_score(0.8);
        assert!(!outcome.is_improved());
    }

    #[test]
    fn test_item_report_into_outcome() {
        let report = ItemReport::new(Verdict::Pass, "scored")
            .with_score(0.9)
            .with_baseline_score(Some(0.6))
            .with_rewritten_text("improved text");

        let outcome = report.into_outcome(Phase::Rewriting, 3);
        assert_eq!(outcome.phase, Phase::Rewriting);
        assert_eq!(outcome.verdict, Verdict::Pass);
        assert_eq!(outcome.score, Some(0.9));
        assert_eq!(outcome.baseline_score, Some(0.6));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.rewritten_text, Some("improved text".to_string()));
    }

    #[test]
    fn test_phase_result_failed_ids_sorted() {
        let mut outcomes = HashMap::new();
        outcomes.insert(
            "r3".to_string(),
            PhaseOutcome::new(Phase::Validating, Verdict::Fail, "low"),
        );
        outcomes.insert(
            "r1".to_string(),
            PhaseOutcome::new(Phase::Validating, Verdict::Fail, "low"),
        );
        outcomes.insert(
            "r2".to_string(),
            PhaseOutcome::new(Phase::Validating, Verdict::Pass, "ok"),
        );

        let result = PhaseResult {
            phase: Phase::Validating,
            outcomes,
            stats: PhaseStats::default(),
        };
        assert_eq!(result.failed_ids(), vec!["r1".to_string(), "r3".to_string()]);
    }

    #[test]
    fn test_item_serialization_roundtrip() {
        let mut item = RequirementItem::new("r1", "text").with_source_ref("doc-1#2");
        item.apply_outcome(&PhaseOutcome::new(Phase::Validating, Verdict::Pass, "ok").with_score(0.9));

        let json = serde_json::to_string(&item).expect("serialize");
        let parsed: RequirementItem = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, item.id);
        assert_eq!(parsed.source_ref, Some("doc-1#2".to_string()));
        assert_eq!(parsed.history.len(), 1);
    }

    #[test]
    fn test_question_ids_unique() {
        let q1 = ClarificationQuestion::new("run-1", "r1", "Is this testable?", vec![]);
        let q2 = ClarificationQuestion::new("run-1", "r1", "Is this testable?", vec![]);
        assert_ne!(q1.question_id, q2.question_id);
    }
}
