//! Event bus for progress events.
//!
//! The orchestrator publishes a [`ProgressEvent`] on every state transition
//! and for every progress message from an executor. Consumers (display,
//! persistence, advisors) subscribe independently; each subscription is a
//! lazy stream that starts at the moment of subscription and ends when the
//! session closes the bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::core::TaskId;
use crate::dispatch::ExecutionId;
use crate::execution::TaskState;

/// Default capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A progress or state change for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    /// `None` for tasks that never started (blocked, or cancelled while pending).
    pub execution_id: Option<ExecutionId>,
    pub state: TaskState,
    pub attempt: u32,
    pub percent: u8,
    pub message: String,
    pub output: Option<String>,
    /// Set on the event announcing that a failed critical task blocks this one.
    #[serde(default)]
    pub blocked_by: Option<TaskId>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, state: TaskState, message: impl Into<String>) -> Self {
        Self {
            task_id,
            execution_id: None,
            state,
            attempt: 0,
            percent: 0,
            message: message.into(),
            output: None,
            blocked_by: None,
            timestamp: Utc::now(),
        }
    }

    /// Announce that `task_id` cannot start because `blocker` failed.
    pub fn blocked(task_id: TaskId, blocker: TaskId) -> Self {
        let message = format!("blocked by failed task {}", blocker);
        Self {
            blocked_by: Some(blocker),
            ..Self::new(task_id, TaskState::Pending, message)
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_by.is_some()
    }
}

/// Lazy sequence of events for one subscriber.
pub type EventStream = BoxStream<'static, ProgressEvent>;

/// Multicast bus for progress events.
#[derive(Clone)]
pub struct EventBus {
    /// `None` once the session has ended.
    sender: Arc<Mutex<Option<broadcast::Sender<ProgressEvent>>>>,
    /// Number of events published (for monitoring)
    published: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received it; 0 when there are
    /// none or the bus is closed.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(sender) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                sender.send(event).unwrap_or(0)
            }
            None => 0,
        }
    }

    /// Subscribe from this point onward.
    ///
    /// The stream yields every later event and finishes after the bus is
    /// closed and the backlog is drained. Subscribing to a closed bus yields
    /// an empty stream.
    pub fn subscribe(&self) -> EventStream {
        let receiver = {
            let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.as_ref().map(|s| s.subscribe())
        };
        let Some(receiver) = receiver else {
            return stream::empty().boxed();
        };

        stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// End the session: current streams finish once drained.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Get the total number of events published.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("published", &self.published())
            .field("closed", &self.is_closed())
            .finish()
    }
}
