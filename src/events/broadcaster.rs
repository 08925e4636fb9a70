//! Per-correlation event fan-out with replay.
//!
//! One logical channel per correlation id. Publishers (the orchestrator and
//! any number of concurrently running delegators) go through a single lock
//! per channel, which is what keeps sequence numbers strictly increasing
//! with no gaps under concurrent publication. Subscribers receive events in
//! publish order; a late subscriber first receives the bounded replay
//! buffer so a reconnecting observer does not miss the terminal
//! `workflow_result`.
//!
//! Channels are torn down after the run reaches a terminal state and the
//! grace period elapses with no active subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::workflow::types::{EventKind, WorkflowEvent};

/// Stream of workflow events for one subscriber.
pub type EventStream = UnboundedReceiverStream<WorkflowEvent>;

/// State of one correlation id's channel.
struct Channel {
    next_sequence: u64,
    replay: VecDeque<WorkflowEvent>,
    subscribers: Vec<mpsc::UnboundedSender<WorkflowEvent>>,
    terminal: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            next_sequence: 0,
            replay: VecDeque::new(),
            subscribers: Vec::new(),
            terminal: false,
        }
    }

    fn has_active_subscribers(&self) -> bool {
        self.subscribers.iter().any(|tx| !tx.is_closed())
    }
}

/// Fan-out hub for workflow events, keyed by correlation id.
///
/// Cheap to clone; clones share the same channels.
#[derive(Clone)]
pub struct EventBroadcaster {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    replay_capacity: usize,
    grace: Duration,
}

impl EventBroadcaster {
    /// Creates a broadcaster.
    ///
    /// # Arguments
    ///
    /// * `replay_capacity` - Events retained per channel for late subscribers
    /// * `grace` - Idle period after a terminal mark before teardown
    pub fn new(replay_capacity: usize, grace: Duration) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            replay_capacity,
            grace,
        }
    }

    /// Publishes an event, stamping its sequence number and timestamp.
    ///
    /// Returns the assigned sequence number.
    pub fn publish(
        &self,
        correlation_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> u64 {
        let mut channels = self.lock();
        let channel = channels
            .entry(correlation_id.to_string())
            .or_insert_with(Channel::new);

        let sequence = channel.next_sequence;
        channel.next_sequence += 1;

        let event = WorkflowEvent {
            correlation_id: correlation_id.to_string(),
            sequence,
            kind,
            payload,
            timestamp: Utc::now(),
        };

        channel.replay.push_back(event.clone());
        while channel.replay.len() > self.replay_capacity {
            channel.replay.pop_front();
        }

        channel.subscribers.retain(|tx| tx.send(event.clone()).is_ok());

        sequence
    }

    /// Subscribes to a correlation id's event stream.
    ///
    /// The stream starts with the replay buffer (the last
    /// `replay_capacity` events at most) followed by all subsequent events
    /// in publish order.
    pub fn subscribe(&self, correlation_id: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.lock();
        let channel = channels
            .entry(correlation_id.to_string())
            .or_insert_with(Channel::new);

        for event in &channel.replay {
            // Receiver is in hand; an unbounded send cannot fail here.
            let _ = tx.send(event.clone());
        }
        channel.subscribers.push(tx);

        UnboundedReceiverStream::new(rx)
    }

    /// Marks a channel terminal and schedules its teardown.
    ///
    /// The channel is dropped once the grace period elapses with no active
    /// subscribers; while subscribers remain attached, teardown is retried
    /// every grace period.
    pub fn mark_terminal(&self, correlation_id: &str) {
        {
            let mut channels = self.lock();
            if let Some(channel) = channels.get_mut(correlation_id) {
                channel.terminal = true;
            } else {
                return;
            }
        }

        let broadcaster = self.clone();
        let correlation_id = correlation_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(broadcaster.grace).await;
                if broadcaster.try_teardown(&correlation_id) {
                    debug!(correlation_id = %correlation_id, "Event channel torn down");
                    break;
                }
            }
        });
    }

    /// Returns the number of live channels.
    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    /// Drops the channel if it is terminal with no active subscribers.
    fn try_teardown(&self, correlation_id: &str) -> bool {
        let mut channels = self.lock();
        match channels.get(correlation_id) {
            Some(channel) if channel.terminal && !channel.has_active_subscribers() => {
                channels.remove(correlation_id);
                true
            }
            Some(_) => false,
            // Already gone.
            None => true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
