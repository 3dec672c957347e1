use chrono::{DateTime, Utc};

use bpmn_types::{IncidentId, IncidentType, InstanceId, JobKey, TimerId, TokenId, WorkerId};

/// The fields a caller supplies when raising an incident; `incident_id`,
/// `status`, `created_at` and `resolution` are filled in by the sink
/// (§4.incidents "creation requests, typed variants per source" — the
/// "type" is `incident_type`, the "source" fields are whichever of these
/// the raiser knows).
#[derive(Clone, Debug)]
pub struct NewIncident {
    pub incident_type: IncidentType,
    pub message: String,
    pub instance_id: Option<InstanceId>,
    pub element_id: Option<String>,
    pub token_id: Option<TokenId>,
    pub job_key: Option<JobKey>,
    pub timer_id: Option<TimerId>,
    pub message_name: Option<String>,
    pub worker_id: Option<WorkerId>,
}

impl NewIncident {
    pub fn new(incident_type: IncidentType, message: impl Into<String>) -> Self {
        Self {
            incident_type,
            message: message.into(),
            instance_id: None,
            element_id: None,
            token_id: None,
            job_key: None,
            timer_id: None,
            message_name: None,
            worker_id: None,
        }
    }

    pub fn instance(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn element(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }

    pub fn token(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    pub fn job(mut self, job_key: JobKey) -> Self {
        self.job_key = Some(job_key);
        self
    }

    pub fn timer(mut self, timer_id: TimerId) -> Self {
        self.timer_id = Some(timer_id);
        self
    }

    pub fn message_name(mut self, message_name: impl Into<String>) -> Self {
        self.message_name = Some(message_name.into());
        self
    }

    pub fn worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }
}

/// The unified error-propagation sink every component raises into
/// (§7 "incidents are the unified sink for errors that outlive a single
/// call"). Kept as a trait so `bpmn-timewheel`/`bpmn-jobs`/`bpmn-messaging`
/// depend on the capability, not on `bpmn-incidents`'s storage choice.
pub trait IncidentSink: Send + Sync {
    fn raise(&self, incident: NewIncident, now: DateTime<Utc>) -> Result<IncidentId, crate::error::IncidentError>;
}
