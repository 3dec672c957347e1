use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, TimerId, TokenId};
use crate::process::TimerKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerState {
    Scheduled,
    Fired,
    Cancelled,
}

/// Cycle-timer bookkeeping (§3.4 "cycle metadata"): how many repeats remain
/// (`None` for the unbounded `R/` form) and the fixed re-fire interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleMeta {
    pub repeats_remaining: Option<u32>,
    pub interval: chrono::Duration,
}

/// A scheduled timer (§3.4). `time_duration`/`time_date`/`time_cycle` hold
/// the raw ISO-8601 source string for whichever `timer_type` this is, kept
/// around for `Restore()` and for diagnostics even after parsing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub timer_id: TimerId,
    pub element_id: String,
    pub process_instance_id: InstanceId,
    pub token_id: TokenId,
    pub timer_type: TimerKind,
    pub time_duration: Option<String>,
    pub time_date: Option<String>,
    pub time_cycle: Option<String>,
    pub state: TimerState,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub cycle: Option<CycleMeta>,
}
