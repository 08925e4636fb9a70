//! Progress-event streaming for workflow observers.
//!
//! The orchestrator and its delegators publish [`WorkflowEvent`] records
//! through a per-correlation [`EventBroadcaster`]; external observers
//! consume them as an ordered, replayable stream.
//!
//! [`WorkflowEvent`]: crate::workflow::types::WorkflowEvent

pub mod broadcaster;

pub use broadcaster::{EventBroadcaster, EventStream};
