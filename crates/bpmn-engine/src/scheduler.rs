use bpmn_types::{JobCallback, MessageDeliveredCallback, TimerFiredCallback, TokenId, VariableMap};

/// Why a token re-enters the scheduler inbox (§4.E "Token scheduler").
/// Events for a single token are processed in FIFO order (§5 "Ordering
/// guarantees") since each worker drains the shared inbox one event at a
/// time and a token never has two events in flight concurrently (its
/// producers are themselves serialized: a job has one lease, a timer
/// fires once, a subscription delivers once).
#[derive(Clone, Debug)]
pub enum SchedulerReason {
    Start,
    SignalReady { variables: VariableMap },
    TimerFired(TimerFiredCallback),
    JobCallback(JobCallback),
    MessageDelivered(MessageDeliveredCallback),
    Cancel,
}

pub type InboxEvent = (TokenId, SchedulerReason);
