use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::generate_id;

/// Structured system-event record (§6.4), appended for startup, shutdown,
/// timer firings, incident creations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: String,
    pub event_type: SystemEventType,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemEventType {
    Startup,
    Shutdown,
    Ready,
    TimerFired,
    IncidentCreated,
}

impl SystemEvent {
    pub fn new(
        event_type: SystemEventType,
        status: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_id(),
            event_type,
            status: status.into(),
            message: message.into(),
            created_at: now,
        }
    }
}
