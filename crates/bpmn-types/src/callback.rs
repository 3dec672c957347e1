use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, JobKey, SubscriptionId, TimerId, TokenId};
use crate::job::JobStatus;
use crate::value::VariableMap;

/// Timer-fire callback payload (§6.5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerFiredCallback {
    pub timer_id: TimerId,
    pub element_id: String,
    pub token_id: TokenId,
    pub process_instance_id: InstanceId,
    pub fired_at: DateTime<Utc>,
}

/// Job complete/fail/error callback payload (§6.5). `status` is one of
/// `Completed`/`Failed`/`ErrorThrown`; other `JobStatus` values never
/// appear here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobCallback {
    pub job_key: JobKey,
    pub element_id: String,
    pub token_id: TokenId,
    pub process_instance_id: InstanceId,
    pub status: JobStatus,
    pub variables: Option<VariableMap>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Message-delivery callback payload (§4.C Delivery): "enqueue a resume
/// event on the executor's inbound channel referencing the token and its
/// current element." Not enumerated in §6.5 (which covers only timer/job
/// payloads) but the same shape, added for the third external-handle kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDeliveredCallback {
    pub subscription_id: SubscriptionId,
    pub element_id: String,
    pub token_id: Option<TokenId>,
    pub process_instance_id: Option<InstanceId>,
    pub message_name: String,
    pub variables: VariableMap,
    pub delivered_at: DateTime<Utc>,
}
