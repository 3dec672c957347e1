use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, TokenId};
use crate::value::VariableMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Active,
    Waiting,
    Completed,
    Canceled,
}

/// The single external handle a `WAITING` token carries (§3.3 invariant:
/// "exactly one external handle whose completion transitions the token
/// back to ACTIVE"). Rendered as `waiting_for` on the record
/// (`"timer:<id>"`, `"job:<key>"`, ...) but kept structured in memory so
/// callers don't re-parse a string tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitHandle {
    Timer(String),
    Job(String),
    Message(String),
    UserTask,
    Incident(String),
}

impl WaitHandle {
    /// Render as the `"kind:<id>"` string form §3.3 specifies for
    /// `waiting_for`.
    pub fn as_tag(&self) -> String {
        match self {
            WaitHandle::Timer(id) => format!("timer:{id}"),
            WaitHandle::Job(id) => format!("job:{id}"),
            WaitHandle::Message(name) => format!("message:{name}"),
            WaitHandle::UserTask => "user_task".to_string(),
            WaitHandle::Incident(id) => format!("incident:{id}"),
        }
    }
}

/// The unit of execution that traverses a process graph (§3.3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: TokenId,
    pub instance_id: InstanceId,
    pub current_element_id: String,
    pub state: TokenState,
    pub waiting_for: Option<WaitHandle>,
    pub parent_token_id: Option<TokenId>,
    pub variables: VariableMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn new_at(
        instance_id: InstanceId,
        element_id: impl Into<String>,
        parent_token_id: Option<TokenId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: TokenId::generate(),
            instance_id,
            current_element_id: element_id.into(),
            state: TokenState::Active,
            waiting_for: None,
            parent_token_id,
            variables: VariableMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the token to `WAITING` on a single external handle, per the
    /// §3.3 invariant.
    pub fn park(&mut self, handle: WaitHandle, now: DateTime<Utc>) {
        self.state = TokenState::Waiting;
        self.waiting_for = Some(handle);
        self.updated_at = now;
    }

    /// Resume a waiting token back to `ACTIVE`, clearing its handle.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.state = TokenState::Active;
        self.waiting_for = None;
        self.updated_at = now;
    }

    pub fn advance_to(&mut self, element_id: impl Into<String>, now: DateTime<Utc>) {
        self.current_element_id = element_id.into();
        self.updated_at = now;
    }

    pub fn terminate(&mut self, state: TokenState, now: DateTime<Utc>) {
        debug_assert!(matches!(state, TokenState::Completed | TokenState::Canceled));
        self.state = state;
        self.waiting_for = None;
        self.updated_at = now;
    }
}
