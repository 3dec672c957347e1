use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InstanceId;
use crate::value::VariableMap;

/// Process instance lifecycle state (§3.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Completed,
    Canceled,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Canceled | InstanceState::Failed
        )
    }
}

/// One concrete execution of a process definition (§3.2).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: InstanceId,
    pub process_key: String,
    pub state: InstanceState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub variables: VariableMap,
}

impl ProcessInstance {
    pub fn new(instance_id: InstanceId, process_key: String, now: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            process_key,
            state: InstanceState::Active,
            started_at: now,
            updated_at: now,
            completed_at: None,
            variables: VariableMap::new(),
        }
    }

    /// Transition to a terminal state, stamping `updated_at`/`completed_at`.
    pub fn finish(&mut self, state: InstanceState, now: DateTime<Utc>) {
        debug_assert!(state.is_terminal(), "finish() requires a terminal state");
        self.state = state;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}
