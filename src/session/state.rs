//! Session state and status snapshot

use crate::config::ConnectionDescriptor;
use crate::provider::ServerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Validating,
    Starting,
    Active,
    Stopping,
    /// Last start attempt failed; a new start is allowed
    Failed,
}

impl SessionState {
    /// Whether engines or the interface may be engaged
    pub fn is_busy(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Validating => write!(f, "validating"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub active_server: Option<ServerId>,
    pub label: Option<String>,
    /// Set only while Active
    pub started_at: Option<DateTime<Utc>>,
    /// Set only while Failed
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        SessionStatus {
            state: SessionState::Idle,
            session_id: None,
            active_server: None,
            label: None,
            started_at: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Active
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// What to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub descriptor: ConnectionDescriptor,
    pub label: String,
    /// Store id when the descriptor came from a server record
    pub server_id: Option<ServerId>,
}

impl StartRequest {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        let label = descriptor.label.clone();
        StartRequest {
            descriptor,
            label,
            server_id: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_server(mut self, id: ServerId) -> Self {
        self.server_id = Some(id);
        self
    }
}
