//! Bounded worker pool for phase execution.
//!
//! The pool runs a batch of keyed work items against an injected handler
//! with a hard concurrency ceiling: up to `max_concurrent` worker tasks
//! pull items from a shared FIFO queue, so the ceiling bounds in-flight
//! handler calls structurally rather than by counting.
//!
//! # Features
//!
//! - Hard concurrency ceiling with FIFO dispatch behind completed slots
//! - Per-item attempt timeout
//! - Bounded retry on transient failures, immediate failure on fatal ones
//! - Partial-failure isolation: one item's failure never aborts siblings
//! - Cooperative cancellation observed within one attempt timeout
//! - In-flight high-watermark tracking

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::CallError;
use crate::workflow::cancel::CancelToken;

use super::task_queue::TaskQueue;

/// Work items processed by the pool carry a stable id. Results are keyed
/// by this id, never by completion order.
pub trait Keyed {
    /// Returns the item's stable identifier.
    fn key(&self) -> &str;
}

/// Terminal failure for one item. Sibling items are unaffected.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// The handler reported a fatal failure.
    #[error("fatal failure after {attempts} attempt(s): {reason}")]
    Fatal { reason: String, attempts: u32 },

    /// Transient failures (including timeouts) exhausted the attempt limit.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries { last_error: String, attempts: u32 },

    /// The pool was cancelled before the item completed.
    #[error("cancelled before completion")]
    Cancelled,
}

/// Final outcome for one item.
#[derive(Debug)]
pub struct ItemOutcome<R> {
    /// Handler result or terminal failure.
    pub result: Result<R, WorkerError>,
    /// Attempts consumed.
    pub attempts: u32,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Hard upper bound on simultaneously in-flight handler calls.
    pub max_concurrent: usize,
    /// Timeout for a single handler attempt.
    pub per_item_timeout: Duration,
    /// Maximum attempts per item.
    pub max_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            per_item_timeout: Duration::from_secs(120),
            max_attempts: 3,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given concurrency ceiling.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    /// Sets the per-item attempt timeout.
    pub fn with_per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = timeout;
        self
    }

    /// Sets the maximum attempts per item.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// Statistics for one pool run.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Items that completed successfully.
    pub succeeded: u64,
    /// Items that failed (fatal or exhausted retries).
    pub failed: u64,
    /// Items abandoned due to cancellation.
    pub cancelled: u64,
    /// Highest number of simultaneously in-flight handler calls observed.
    pub max_in_flight: usize,
}

/// Shared atomic counters updated by workers.
struct SharedPoolStats {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    fn enter_flight(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
    }

    fn exit_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Result of one pool run: outcomes keyed by item id plus statistics.
#[derive(Debug)]
pub struct PoolRun<R> {
    /// Outcome per item id. Contains one entry per input item.
    pub outcomes: HashMap<String, ItemOutcome<R>>,
    /// Run statistics.
    pub stats: PoolStats,
}

/// Result of one handler attempt.
enum Attempt<R> {
    Done(R),
    Transient(String),
    Fatal(String),
    Cancelled,
}

/// Bounded-concurrency pool running keyed items against a handler.
pub struct WorkerPool {
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Creates a new pool.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self { config }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Runs every queued item through the handler.
    ///
    /// Workers pull items in FIFO order; transient failures requeue until
    /// `max_attempts`, fatal failures and exhausted retries produce an
    /// error outcome for that item only. Returns one outcome per input
    /// item; under cancellation, unprocessed items are marked `Cancelled`.
    ///
    /// `on_complete` fires once per item when its final outcome is known,
    /// before the pool run returns.
    pub async fn run<T, R, H, Fut, C>(
        &self,
        queue: TaskQueue<T>,
        handler: H,
        cancel: CancelToken,
        on_complete: C,
    ) -> PoolRun<R>
    where
        T: Keyed + Clone + Send + 'static,
        R: Send + 'static,
        H: Fn(T, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, CallError>> + Send + 'static,
        C: Fn(&str, &ItemOutcome<R>) + Send + Sync + 'static,
    {
        let total = queue.total();
        let num_workers = self.config.max_concurrent.min(total);

        let queue = Arc::new(queue);
        let handler = Arc::new(handler);
        let on_complete = Arc::new(on_complete);
        let stats = Arc::new(SharedPoolStats::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, ItemOutcome<R>)>();

        let per_item_timeout = self.config.per_item_timeout;
        let max_attempts = self.config.max_attempts;

        let mut handles = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let worker_id = format!("worker-{}", i);
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let on_complete = Arc::clone(&on_complete);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            let tx = tx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker_id = %worker_id, "Worker observed cancellation");
                        break;
                    }

                    let Some(mut task) = queue.pop() else {
                        break;
                    };
                    task.attempts += 1;
                    let key = task.item.key().to_string();

                    debug!(
                        worker_id = %worker_id,
                        item_id = %key,
                        attempt = task.attempts,
                        "Processing item"
                    );

                    stats.enter_flight();
                    let attempt = {
                        let fut = handler(task.item.clone(), cancel.clone());
                        tokio::select! {
                            res = tokio::time::timeout(per_item_timeout, fut) => match res {
                                Ok(Ok(value)) => Attempt::Done(value),
                                Ok(Err(err)) if err.is_retryable() => {
                                    Attempt::Transient(err.to_string())
                                }
                                Ok(Err(err)) => Attempt::Fatal(err.to_string()),
                                Err(_) => Attempt::Transient(format!(
                                    "attempt timed out after {:?}",
                                    per_item_timeout
                                )),
                            },
                            _ = cancel.cancelled() => Attempt::Cancelled,
                        }
                    };
                    stats.exit_flight();

                    match attempt {
                        Attempt::Done(value) => {
                            stats.succeeded.fetch_add(1, Ordering::SeqCst);
                            let outcome = ItemOutcome {
                                result: Ok(value),
                                attempts: task.attempts,
                            };
                            on_complete(&key, &outcome);
                            let _ = tx.send((key, outcome));
                        }
                        Attempt::Transient(reason) if task.attempts < max_attempts => {
                            warn!(
                                worker_id = %worker_id,
                                item_id = %key,
                                attempt = task.attempts,
                                error = %reason,
                                "Transient failure, requeueing item"
                            );
                            queue.requeue(task);
                        }
                        Attempt::Transient(reason) => {
                            warn!(
                                worker_id = %worker_id,
                                item_id = %key,
                                attempts = task.attempts,
                                error = %reason,
                                "Retries exhausted, marking item errored"
                            );
                            stats.failed.fetch_add(1, Ordering::SeqCst);
                            let outcome = ItemOutcome {
                                result: Err(WorkerError::ExhaustedRetries {
                                    last_error: reason,
                                    attempts: task.attempts,
                                }),
                                attempts: task.attempts,
                            };
                            on_complete(&key, &outcome);
                            let _ = tx.send((key, outcome));
                        }
                        Attempt::Fatal(reason) => {
                            warn!(
                                worker_id = %worker_id,
                                item_id = %key,
                                error = %reason,
                                "Fatal failure, marking item errored"
                            );
                            stats.failed.fetch_add(1, Ordering::SeqCst);
                            let outcome = ItemOutcome {
                                result: Err(WorkerError::Fatal {
                                    reason,
                                    attempts: task.attempts,
                                }),
                                attempts: task.attempts,
                            };
                            on_complete(&key, &outcome);
                            let _ = tx.send((key, outcome));
                        }
                        Attempt::Cancelled => {
                            stats.cancelled.fetch_add(1, Ordering::SeqCst);
                            let outcome = ItemOutcome {
                                result: Err(WorkerError::Cancelled),
                                attempts: task.attempts,
                            };
                            let _ = tx.send((key, outcome));
                            break;
                        }
                    }
                }
            }));
        }
        drop(tx);

        let mut outcomes = HashMap::with_capacity(total);
        while let Some((key, outcome)) = rx.recv().await {
            outcomes.insert(key, outcome);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }

        // Items still queued after the workers drained out were abandoned
        // by cancellation.
        while let Some(task) = queue.pop() {
            stats.cancelled.fetch_add(1, Ordering::SeqCst);
            outcomes.insert(
                task.item.key().to_string(),
                ItemOutcome {
                    result: Err(WorkerError::Cancelled),
                    attempts: task.attempts,
                },
            );
        }

        PoolRun {
            outcomes,
            stats: stats.snapshot(),
        }
    }
}
