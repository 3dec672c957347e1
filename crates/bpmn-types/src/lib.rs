pub mod buffered_message;
pub mod callback;
pub mod error;
pub mod event_export;
pub mod expr;
pub mod hash;
pub mod ids;
pub mod incident;
pub mod instance;
pub mod job;
pub mod join_state;
pub mod process;
pub mod race;
pub mod subscription;
pub mod timer;
pub mod token;
pub mod value;

pub use buffered_message::{BufferedMessage, DEFAULT_BUFFER_TTL_SECS};
pub use callback::{JobCallback, MessageDeliveredCallback, TimerFiredCallback};
pub use error::DomainError;
pub use event_export::{SystemEvent, SystemEventType};
pub use expr::{ExpressionError, ExpressionEvaluator};
pub use hash::{content_hash, content_hash_hex};
pub use ids::{
    IncidentId, InstanceId, JobKey, JoinStateId, MessageId, RaceId, SubscriptionId, TimerId,
    TokenId, WorkerId, generate_id,
};
pub use incident::{Incident, IncidentFilter, IncidentStats, IncidentStatus, IncidentType, Resolution, ResolutionAction};
pub use instance::{InstanceState, ProcessInstance};
pub use job::{Job, JobStatus};
pub use join_state::JoinState;
pub use process::{
    ElementId, ElementRecord, ElementType, ErrorDefinition, Flow, FlowId, MessageDefinition,
    ProcessDefinition, SignalDefinition, TimerDefinition, TimerKind, process_key,
};
pub use race::{GatewayRace, RaceSibling};
pub use subscription::MessageSubscription;
pub use timer::{CycleMeta, TimerRecord, TimerState};
pub use token::{Token, TokenState, WaitHandle};
pub use value::{VariableMap, Value, merge_variables};
