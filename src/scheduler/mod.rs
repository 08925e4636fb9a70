//! Bounded phase execution: task queue, worker pool, result aggregation.
//!
//! This module provides the per-phase execution machinery:
//!
//! - **TaskQueue**: in-memory FIFO of per-item work units
//! - **WorkerPool**: bounded-concurrency workers with timeout and retry
//! - **ResultAggregator**: deterministic per-phase statistics
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Delegator   │
//!                      │  (one/phase) │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │  TaskQueue   │
//!                      │    (FIFO)    │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                     ResultAggregator
//! ```
//!
//! The worker count N is the phase's hard concurrency ceiling; additional
//! items wait in the queue behind completed slots. One item's failure is
//! isolated to that item's outcome.

pub mod aggregator;
pub mod task_queue;
pub mod worker_pool;

pub use aggregator::ResultAggregator;
pub use task_queue::{QueuedTask, TaskQueue};
pub use worker_pool::{
    ItemOutcome, Keyed, PoolRun, PoolStats, WorkerError, WorkerPool, WorkerPoolConfig,
};
