//! Typed event channel
//!
//! Components publish [`Event`]s instead of broadcasting loosely typed
//! notifications. Every subscriber owns its own receiver, so it sees each
//! publisher's events in FIFO order and handles them on one task.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 128;

/// Notifications emitted to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// A session reached Active
    SessionStarted { label: String },
    /// A session ended, or a start attempt gave up
    SessionStopped,
    /// Answer to a status request
    SessionStatus {
        #[serde(rename = "isRunning")]
        is_running: bool,
    },
    /// A start attempt failed; carries the message shown to the user
    SessionError { message: String },
    /// Failover picked a new candidate
    FailoverSwitching { candidate: String },
    FailoverSucceeded { label: String },
    /// Monitor exhausted its attempts
    NoInternetWarning,
}

/// Fan-out event channel shared by all components
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: Event) {
        debug!("event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
