//! Human-in-the-loop clarification gate.
//!
//! When QA review flags an item below the pass threshold, the orchestrator
//! publishes a question and suspends that run's forward progress behind
//! [`ClarificationGate::ask`]. Each question is resolved exactly once: the
//! first accepted answer wins, a timeout resolves to the default
//! manual-review answer, and cancelling the parent run cancels its pending
//! questions. Other runs are unaffected.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::workflow::cancel::CancelToken;
use crate::workflow::types::{ClarificationAnswer, ClarificationQuestion};

/// Result of submitting an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerStatus {
    /// The answer resolved the question.
    Accepted,
    /// The question was already resolved (earlier answer or timeout).
    AlreadyAnswered,
    /// No such question is or was pending.
    NotFound,
}

/// How a question was resolved.
#[derive(Debug)]
pub enum GateOutcome {
    /// A human answered in time.
    Answered(ClarificationAnswer),
    /// The wait timed out; the caller applies the default manual-review
    /// resolution.
    TimedOut,
    /// The parent run was cancelled while waiting.
    Cancelled,
}

struct PendingQuestion {
    tx: oneshot::Sender<ClarificationAnswer>,
    correlation_id: String,
}

/// Receipt for a registered question; consumed by [`ClarificationGate::wait`].
pub struct PendingAnswer {
    question_id: Uuid,
    rx: oneshot::Receiver<ClarificationAnswer>,
}

/// Single-resolution question gate shared across runs.
pub struct ClarificationGate {
    pending: Mutex<HashMap<Uuid, PendingQuestion>>,
    resolved: Mutex<HashSet<Uuid>>,
    timeout: Duration,
}

impl ClarificationGate {
    /// Creates a gate with the given answer timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashSet::new()),
            timeout,
        }
    }

    /// Registers a question so answers are accepted from this point on.
    ///
    /// Register before publishing the question to observers, so an answer
    /// arriving immediately after the event is never rejected.
    pub fn register(&self, question: &ClarificationQuestion) -> PendingAnswer {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            question.question_id,
            PendingQuestion {
                tx,
                correlation_id: question.correlation_id.clone(),
            },
        );
        debug!(
            correlation_id = %question.correlation_id,
            question_id = %question.question_id,
            item_id = %question.item_id,
            "Clarification registered"
        );
        PendingAnswer {
            question_id: question.question_id,
            rx,
        }
    }

    /// Waits for a registered question's resolution.
    ///
    /// Suspends only the calling run. Resolution order of precedence:
    /// an accepted answer, run cancellation, the gate timeout.
    pub async fn wait(&self, pending: PendingAnswer, cancel: &CancelToken) -> GateOutcome {
        let PendingAnswer { question_id, rx } = pending;

        tokio::select! {
            res = tokio::time::timeout(self.timeout, rx) => match res {
                Ok(Ok(answer)) => GateOutcome::Answered(answer),
                // The sender was dropped: the question was withdrawn by a
                // run-level cancellation.
                Ok(Err(_)) => GateOutcome::Cancelled,
                Err(_) => {
                    self.withdraw(question_id, true);
                    info!(
                        question_id = %question_id,
                        "Clarification timed out, defaulting to manual review"
                    );
                    GateOutcome::TimedOut
                }
            },
            _ = cancel.cancelled() => {
                self.withdraw(question_id, false);
                GateOutcome::Cancelled
            }
        }
    }

    /// Registers the question and waits for its resolution in one step.
    pub async fn ask(
        &self,
        question: &ClarificationQuestion,
        cancel: &CancelToken,
    ) -> GateOutcome {
        let pending = self.register(question);
        self.wait(pending, cancel).await
    }

    /// Submits an answer for a pending question. The first accepted answer
    /// wins; later answers for the same question are rejected.
    pub fn answer(
        &self,
        correlation_id: &str,
        question_id: Uuid,
        value: impl Into<String>,
    ) -> AnswerStatus {
        let removed = {
            let mut pending = lock(&self.pending);
            let correlation_matches = pending
                .get(&question_id)
                .map(|q| q.correlation_id == correlation_id);
            match correlation_matches {
                Some(true) => pending.remove(&question_id),
                Some(false) => return AnswerStatus::NotFound,
                None => None,
            }
        };

        let Some(pending_question) = removed else {
            return if lock(&self.resolved).contains(&question_id) {
                AnswerStatus::AlreadyAnswered
            } else {
                AnswerStatus::NotFound
            };
        };

        lock(&self.resolved).insert(question_id);
        let answer = ClarificationAnswer {
            question_id,
            value: value.into(),
            answered_at: Utc::now(),
        };
        // The waiter may have timed out in the same instant; the question
        // still counts as resolved either way.
        let _ = pending_question.tx.send(answer);
        AnswerStatus::Accepted
    }

    /// Cancels every pending question belonging to a run.
    pub fn cancel_run(&self, correlation_id: &str) {
        let mut pending = lock(&self.pending);
        // Dropping the senders wakes the corresponding `ask` calls with a
        // cancellation outcome.
        pending.retain(|_, q| q.correlation_id != correlation_id);
    }

    /// Returns the number of questions currently awaiting an answer.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Removes a question from the pending set, optionally marking it
    /// resolved so late answers are rejected as already-answered.
    fn withdraw(&self, question_id: Uuid, mark_resolved: bool) {
        lock(&self.pending).remove(&question_id);
        if mark_resolved {
            lock(&self.resolved).insert(question_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
