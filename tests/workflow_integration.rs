//! End-to-end workflow tests over a scripted capability provider.
//!
//! The provider's behavior is keyed by substring markers in the requirement
//! text, so each test scripts failures, hangs and low scores per item
//! without any network dependency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use uuid::Uuid;

use reqforge::capability::{
    Atom, Evaluation, GraphDelta, MinedRequirement, RequirementProvider, SearchHit,
};
use reqforge::config::WorkflowConfig;
use reqforge::error::CallError;
use reqforge::events::EventStream;
use reqforge::workflow::types::{
    EventKind, Phase, RequirementItem, SourceDocument, Verdict, WorkflowEvent, WorkflowRequest,
    WorkflowRun,
};
use reqforge::workflow::{AnswerStatus, WorkflowError, WorkflowOrchestrator};

/// Capability stub scripted by substring markers in the text.
#[derive(Default)]
struct ScriptedProvider {
    /// Uniform delay inside `evaluate`.
    evaluate_delay: Duration,
    /// Texts containing one of these score 0.4 / fail.
    low_markers: Vec<String>,
    /// Texts containing one of these hang far past any item timeout.
    hang_markers: Vec<String>,
    /// Remaining scripted transient failures per marker.
    transient_budget: Mutex<HashMap<String, u32>>,
    /// When set, rewritten texts score high regardless of markers.
    rewrite_fixes: bool,
    /// Concurrency accounting across `evaluate` calls.
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.evaluate_delay = delay;
        self
    }

    fn with_low_marker(mut self, marker: &str) -> Self {
        self.low_markers.push(marker.to_string());
        self
    }

    fn with_hang_marker(mut self, marker: &str) -> Self {
        self.hang_markers.push(marker.to_string());
        self
    }

    fn with_transient_failures(self, marker: &str, count: u32) -> Self {
        self.transient_budget
            .lock()
            .unwrap()
            .insert(marker.to_string(), count);
        self
    }

    fn with_rewrite_fixes(mut self) -> Self {
        self.rewrite_fixes = true;
        self
    }

    fn max_observed_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequirementProvider for ScriptedProvider {
    async fn evaluate(&self, text: &str) -> Result<Evaluation, CallError> {
        {
            let mut budget = self.transient_budget.lock().unwrap();
            for (marker, remaining) in budget.iter_mut() {
                if text.contains(marker.as_str()) && *remaining > 0 {
                    *remaining -= 1;
                    return Err(CallError::transient("scripted transient failure"));
                }
            }
        }

        if self.hang_markers.iter().any(|m| text.contains(m)) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.evaluate_delay.is_zero() {
            tokio::time::sleep(self.evaluate_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fixed = self.rewrite_fixes && text.starts_with("rewritten:");
        let low = !fixed && self.low_markers.iter().any(|m| text.contains(m));
        Ok(if low {
            Evaluation {
                score: 0.4,
                verdict: Verdict::Fail,
                per_criterion: Vec::new(),
            }
        } else {
            Evaluation {
                score: 0.9,
                verdict: Verdict::Pass,
                per_criterion: Vec::new(),
            }
        })
    }

    async fn suggest(&self, _text: &str) -> Result<Vec<Atom>, CallError> {
        Ok(vec![Atom {
            text: "make it verifiable".to_string(),
            kind: None,
        }])
    }

    async fn rewrite(&self, text: &str, _atoms: &[Atom]) -> Result<String, CallError> {
        Ok(format!("rewritten: {}", text))
    }

    async fn mine(&self, document: &str) -> Result<Vec<MinedRequirement>, CallError> {
        Ok(document
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| MinedRequirement {
                id: None,
                text: line.to_string(),
                source_ref: None,
            })
            .collect())
    }

    async fn build_graph(&self, items: &[RequirementItem]) -> Result<GraphDelta, CallError> {
        Ok(GraphDelta {
            nodes: items.len(),
            edges: items.len().saturating_sub(1),
        })
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<SearchHit>, CallError> {
        Ok(Vec::new())
    }
}

fn test_config() -> WorkflowConfig {
    WorkflowConfig::default()
        .with_per_item_timeout(Duration::from_millis(500))
        .with_clarification_timeout(Duration::from_secs(5))
        .with_channel_grace(Duration::from_millis(50))
}

fn orchestrator(
    config: WorkflowConfig,
    provider: Arc<ScriptedProvider>,
) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(config, provider).expect("valid config")
}

fn items(texts: &[&str]) -> Vec<RequirementItem> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| RequirementItem::new(format!("r{}", i + 1), *text))
        .collect()
}

/// Drains the stream until the terminal `workflow_result` arrives.
async fn collect_until_result(stream: &mut EventStream) -> (Vec<WorkflowEvent>, WorkflowRun) {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out waiting for events")
            .expect("stream ended before workflow_result");
        events.push(event.clone());
        if event.kind == EventKind::WorkflowResult {
            let run: WorkflowRun =
                serde_json::from_value(event.payload).expect("workflow_result payload");
            return (events, run);
        }
    }
}

// Scenario A: 10 items, ceiling 3, handler always succeeds. Every item
// passes, the ceiling is reached and never exceeded.
#[tokio::test]
async fn batch_completes_within_concurrency_ceiling() {
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(40)));
    let config = test_config()
        .with_phase_concurrency(Phase::Validating, 3)
        .with_phase_concurrency(Phase::QaReview, 3);
    let orchestrator = orchestrator(config, Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-a");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-a",
            items(&[
                "req one", "req two", "req three", "req four", "req five", "req six", "req seven",
                "req eight", "req nine", "req ten",
            ]),
        ))
        .expect("submission accepted");

    let (events, run) = collect_until_result(&mut stream).await;

    assert_eq!(run.phase, Phase::Completed);
    assert_eq!(run.items.len(), 10);
    for item in &run.items {
        let validating = item.outcome_for(Phase::Validating).expect("validated");
        assert_eq!(validating.verdict, Verdict::Pass);
        assert_eq!(validating.attempts, 1);
        assert!(item.outcome_for(Phase::KgBuild).is_some());
        assert!(item.outcome_for(Phase::QaReview).is_some());
        // Nothing failed, so no rewrite or clarification outcomes exist.
        assert!(item.outcome_for(Phase::Rewriting).is_none());
    }

    // The backlog of 10 items kept all three slots busy at some instant
    // and the ceiling was never exceeded.
    assert_eq!(provider.max_observed_in_flight(), 3);

    // Sequence numbers are strictly increasing with no gaps.
    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, expected as u64);
        assert_eq!(event.correlation_id, "run-a");
    }
}

// Scenario B: the handler fails twice then succeeds for one item; its
// outcome records three attempts, siblings record one.
#[tokio::test]
async fn transient_failures_are_retried_per_item() {
    let provider = Arc::new(ScriptedProvider::new().with_transient_failures("three", 2));
    let orchestrator = orchestrator(test_config().with_max_attempts(3), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-b");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-b",
            items(&["req one", "req two", "req three", "req four", "req five"]),
        ))
        .expect("submission accepted");

    let (_events, run) = collect_until_result(&mut stream).await;

    assert_eq!(run.phase, Phase::Completed);
    assert_eq!(run.items.len(), 5);

    let flaky = run.items.iter().find(|i| i.id == "r3").expect("r3 present");
    let outcome = flaky.outcome_for(Phase::Validating).expect("validated");
    assert_eq!(outcome.verdict, Verdict::Pass);
    assert_eq!(outcome.attempts, 3);

    for id in ["r1", "r2", "r4", "r5"] {
        let item = run.items.iter().find(|i| i.id == id).expect("item present");
        assert_eq!(item.outcome_for(Phase::Validating).unwrap().attempts, 1);
    }
}

// Scenario C: one item exceeds the per-item timeout on every attempt; it
// ends errored after max_attempts while its siblings are unaffected.
#[tokio::test]
async fn timeouts_are_isolated_to_the_offending_item() {
    let provider = Arc::new(ScriptedProvider::new().with_hang_marker("stalls"));
    let config = test_config()
        .with_per_item_timeout(Duration::from_millis(100))
        .with_max_attempts(2);
    let orchestrator = orchestrator(config, Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-c");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-c",
            items(&["req one", "req that stalls", "req three", "req four", "req five"]),
        ))
        .expect("submission accepted");

    let (_events, run) = collect_until_result(&mut stream).await;

    // The run still completes: partial errors never abort the batch.
    assert_eq!(run.phase, Phase::Completed);
    assert_eq!(run.items.len(), 5);

    let stalled = run.items.iter().find(|i| i.id == "r2").expect("r2 present");
    let outcome = stalled.outcome_for(Phase::Validating).expect("attempted");
    assert_eq!(outcome.verdict, Verdict::Error);
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.detail.contains("timed out"));

    for id in ["r1", "r3", "r4", "r5"] {
        let item = run.items.iter().find(|i| i.id == id).expect("item present");
        assert_eq!(
            item.outcome_for(Phase::Validating).unwrap().verdict,
            Verdict::Pass
        );
    }
}

// A failed validation routes through the rewrite phase; with an effective
// rewrite the item recovers and the run completes without clarification.
#[tokio::test]
async fn failed_items_are_rewritten_and_recover() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_low_marker("vague")
            .with_rewrite_fixes(),
    );
    let orchestrator = orchestrator(test_config(), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-rw");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-rw",
            items(&["req one", "something vague", "req three"]),
        ))
        .expect("submission accepted");

    let (events, run) = collect_until_result(&mut stream).await;

    assert_eq!(run.phase, Phase::Completed);

    let rewritten = run.items.iter().find(|i| i.id == "r2").expect("r2 present");
    assert!(rewritten.text.starts_with("rewritten:"));
    let outcome = rewritten.outcome_for(Phase::Rewriting).expect("rewritten");
    assert_eq!(outcome.verdict, Verdict::Pass);
    assert!(outcome.is_improved());

    // Untouched siblings never enter the rewrite phase.
    let clean = run.items.iter().find(|i| i.id == "r1").expect("r1 present");
    assert!(clean.outcome_for(Phase::Rewriting).is_none());

    // The rewriting phase transition was published; clarification was not.
    let statuses: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::WorkflowStatus)
        .filter_map(|e| e.payload.get("phase").and_then(|p| p.as_str()))
        .collect();
    assert!(statuses.contains(&"rewriting"));
    assert!(!statuses.contains(&"clarification"));
}

// Scenario D: QA review flags an item, a question event is published, the
// first answer resumes the run to Completed, the second is rejected.
#[tokio::test]
async fn clarification_answer_resumes_the_run() {
    let provider = Arc::new(ScriptedProvider::new().with_low_marker("ambiguous"));
    let orchestrator = orchestrator(test_config(), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-d");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-d",
            items(&["req one", "req two", "req three", "req four ambiguous", "req five"]),
        ))
        .expect("submission accepted");

    // Wait for the question event.
    let question = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("timed out waiting for question")
            .expect("stream ended before question");
        if event.kind == EventKind::Question {
            break event;
        }
    };
    assert_eq!(question.payload["item_id"], "r4");
    let question_id = Uuid::parse_str(question.payload["question_id"].as_str().unwrap())
        .expect("question id");

    assert_eq!(
        orchestrator.answer_clarification("run-d", question_id, "accept"),
        AnswerStatus::Accepted
    );

    let (_events, run) = collect_until_result(&mut stream).await;
    assert_eq!(run.phase, Phase::Completed);

    let flagged = run.items.iter().find(|i| i.id == "r4").expect("r4 present");
    let outcome = flagged
        .outcome_for(Phase::Clarification)
        .expect("clarified");
    assert_eq!(outcome.verdict, Verdict::Pass);
    assert!(outcome.detail.contains("accept"));

    // A second answer for the same question is rejected.
    assert_eq!(
        orchestrator.answer_clarification("run-d", question_id, "manual_review"),
        AnswerStatus::AlreadyAnswered
    );
    // An unknown question is distinguished from an answered one.
    assert_eq!(
        orchestrator.answer_clarification("run-d", Uuid::new_v4(), "accept"),
        AnswerStatus::NotFound
    );
}

// Scenario E: a second submission with the same correlation id is rejected
// while the first run is active; the id is reusable after completion.
#[tokio::test]
async fn duplicate_correlation_ids_are_rejected_while_active() {
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(100)));
    let orchestrator = orchestrator(test_config(), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-e");
    orchestrator
        .submit(WorkflowRequest::with_items("run-e", items(&["req one"])))
        .expect("first submission accepted");

    let rejected = orchestrator.submit(WorkflowRequest::with_items("run-e", items(&["req one"])));
    assert!(matches!(rejected, Err(WorkflowError::DuplicateRun(id)) if id == "run-e"));

    let (_events, run) = collect_until_result(&mut stream).await;
    assert_eq!(run.phase, Phase::Completed);

    // Terminal runs release their correlation id.
    assert!(!orchestrator.is_active("run-e"));
    orchestrator
        .submit(WorkflowRequest::with_items("run-e", items(&["req two"])))
        .expect("id reusable after the first run ended");

    // Cancelling an unknown id reports not-found.
    assert!(matches!(
        orchestrator.cancel("no-such-run"),
        Err(WorkflowError::RunNotFound(_))
    ));
}

// Cancellation: the run resolves to Failed with a cancellation reason and
// publishes nothing after the terminal events.
#[tokio::test]
async fn cancellation_stops_further_transitions() {
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(150)));
    let orchestrator = orchestrator(test_config(), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-x");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-x",
            items(&["req one", "req two", "req three", "req four", "req five", "req six"]),
        ))
        .expect("submission accepted");

    tokio::time::sleep(Duration::from_millis(60)).await;
    orchestrator.cancel("run-x").expect("run is active");

    let (events, run) = collect_until_result(&mut stream).await;
    assert_eq!(run.phase, Phase::Failed);
    assert!(run.reason.as_deref().unwrap_or("").contains("cancelled"));

    // Sequence numbers stayed gap-free through the cancellation.
    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, expected as u64);
    }

    // No event of any kind follows the terminal workflow_result.
    match tokio::time::timeout(Duration::from_millis(300), stream.next()).await {
        Ok(Some(event)) => panic!("unexpected event after terminal result: {:?}", event),
        Ok(None) | Err(_) => {}
    }
}

// Mining: documents fan out to the miner, mined items get deterministic
// document-derived ids and flow through the rest of the pipeline.
#[tokio::test]
async fn documents_are_mined_into_items() {
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = orchestrator(test_config(), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-m");
    orchestrator
        .submit(WorkflowRequest::with_documents(
            "run-m",
            vec![SourceDocument::new(
                "spec",
                "alpha requirement\nbeta requirement\n\ngamma requirement",
            )],
        ))
        .expect("submission accepted");

    let (_events, run) = collect_until_result(&mut stream).await;

    assert_eq!(run.phase, Phase::Completed);
    let ids: Vec<&str> = run.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["spec-1", "spec-2", "spec-3"]);
    for item in &run.items {
        assert_eq!(item.source_ref.as_deref(), Some("spec"));
        assert_eq!(
            item.outcome_for(Phase::Validating).unwrap().verdict,
            Verdict::Pass
        );
    }
}

// Zero items after mining is unrecoverable: the run fails deterministically
// instead of hanging.
#[tokio::test]
async fn empty_mining_output_fails_the_run() {
    let provider = Arc::new(ScriptedProvider::new());
    let orchestrator = orchestrator(test_config(), Arc::clone(&provider));

    let mut stream = orchestrator.subscribe("run-z");
    orchestrator
        .submit(WorkflowRequest::with_documents(
            "run-z",
            vec![SourceDocument::new("empty", "   \n  \n")],
        ))
        .expect("submission accepted");

    let (_events, run) = collect_until_result(&mut stream).await;
    assert_eq!(run.phase, Phase::Failed);
    assert!(run
        .reason
        .as_deref()
        .unwrap_or("")
        .contains("no requirement items"));
}

// A late subscriber still sees the full ordered history via replay.
#[tokio::test]
async fn late_subscriber_replays_the_run() {
    let provider = Arc::new(ScriptedProvider::new());
    let config = test_config().with_channel_grace(Duration::from_secs(5));
    let orchestrator = orchestrator(config, Arc::clone(&provider));

    let mut live = orchestrator.subscribe("run-r");
    orchestrator
        .submit(WorkflowRequest::with_items(
            "run-r",
            items(&["req one", "req two"]),
        ))
        .expect("submission accepted");
    let (live_events, _run) = collect_until_result(&mut live).await;

    // Subscribe after the run already finished.
    let mut replay = orchestrator.subscribe("run-r");
    let (replayed, run) = collect_until_result(&mut replay).await;

    assert_eq!(run.phase, Phase::Completed);
    assert_eq!(replayed.len(), live_events.len());
    for (a, b) in live_events.iter().zip(replayed.iter()) {
        assert_eq!(a.sequence, b.sequence);
        assert_eq!(a.kind, b.kind);
    }
}
