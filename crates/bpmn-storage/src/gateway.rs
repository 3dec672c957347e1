use std::sync::Arc;

use bpmn_types::{
    BufferedMessage, GatewayRace, Incident, IncidentFilter, Job, JobStatus, JoinState,
    MessageSubscription, ProcessDefinition, ProcessInstance, SystemEvent, TimerRecord, TimerState,
    Token, TokenState, generate_id,
};
use tracing::warn;

use crate::error::StorageError;
use crate::kv::KvStore;

/// Record-family key prefixes (§6.3). Suggested, not load-bearing for
/// correctness beyond giving `scan_prefix` disjoint ranges per family.
mod prefix {
    pub const PROCESSES: &str = "processes:";
    pub const INSTANCES: &str = "instances:";
    pub const TOKENS: &str = "tokens:";
    pub const TIMERS: &str = "timers:";
    pub const JOBS: &str = "jobs:";
    pub const SUBSCRIPTIONS: &str = "subscriptions:";
    pub const BUFFERED_MESSAGES: &str = "buffered_messages:";
    pub const INCIDENTS: &str = "incidents:";
    pub const SYSTEM_EVENTS: &str = "system_events:";
    pub const JOIN_STATES: &str = "join_states:";
    pub const GATEWAY_RACES: &str = "gateway_races:";
}

fn key(prefix: &str, id: &str) -> Vec<u8> {
    format!("{prefix}{id}").into_bytes()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::StorageUnavailable(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::StorageUnavailable(e.to_string()))
}

/// Typed CRUD + scan over every record family the core touches (§4.A).
/// Generic over the underlying `KvStore` so the embedding process can
/// swap in a real durable backend without this layer changing.
pub struct StorageGateway<K: KvStore> {
    kv: Arc<K>,
}

impl<K: KvStore> Clone for StorageGateway<K> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
        }
    }
}

impl<K: KvStore> StorageGateway<K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self { kv }
    }

    /// Mint a globally unique, lexicographically sortable id (§4.A).
    pub fn generate_id(&self) -> String {
        generate_id()
    }

    // ---- processes ----

    pub fn save_process(&self, process: &ProcessDefinition) -> Result<(), StorageError> {
        self.kv
            .put(&key(prefix::PROCESSES, &process.process_key()), &encode(process)?)
    }

    pub fn get_process(&self, process_key: &str) -> Result<Option<ProcessDefinition>, StorageError> {
        match self.kv.get(&key(prefix::PROCESSES, process_key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All stored versions of `process_id`, in ascending version order —
    /// used to find the current version and to check for a reusable
    /// content-identical version before minting a new one (§3.1, §8).
    pub fn list_process_versions(
        &self,
        process_id: &str,
    ) -> Result<Vec<ProcessDefinition>, StorageError> {
        let mut versions: Vec<ProcessDefinition> = self
            .kv
            .scan_prefix(format!("{}{process_id}:v", prefix::PROCESSES).as_bytes())?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect::<Result<_, _>>()?;
        versions.sort_by_key(|p| p.version);
        Ok(versions)
    }

    // ---- instances ----

    pub fn save_instance(&self, instance: &ProcessInstance) -> Result<(), StorageError> {
        self.kv.put(
            &key(prefix::INSTANCES, instance.instance_id.as_str()),
            &encode(instance)?,
        )
    }

    pub fn get_instance(&self, instance_id: &str) -> Result<Option<ProcessInstance>, StorageError> {
        match self.kv.get(&key(prefix::INSTANCES, instance_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ---- tokens ----

    pub fn save_token(&self, token: &Token) -> Result<(), StorageError> {
        self.kv
            .put(&key(prefix::TOKENS, token.token_id.as_str()), &encode(token)?)
    }

    pub fn get_token(&self, token_id: &str) -> Result<Option<Token>, StorageError> {
        match self.kv.get(&key(prefix::TOKENS, token_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_token(&self, token_id: &str) -> Result<(), StorageError> {
        self.kv.delete(&key(prefix::TOKENS, token_id))
    }

    pub fn list_tokens_by_state(&self, state: TokenState) -> Result<Vec<Token>, StorageError> {
        self.scan_all::<Token>(prefix::TOKENS)
            .map(|tokens| tokens.into_iter().filter(|t| t.state == state).collect())
    }

    pub fn list_tokens_by_instance(&self, instance_id: &str) -> Result<Vec<Token>, StorageError> {
        self.scan_all::<Token>(prefix::TOKENS).map(|tokens| {
            tokens
                .into_iter()
                .filter(|t| t.instance_id.as_str() == instance_id)
                .collect()
        })
    }

    // ---- timers ----

    pub fn save_timer(&self, timer: &TimerRecord) -> Result<(), StorageError> {
        self.kv
            .put(&key(prefix::TIMERS, timer.timer_id.as_str()), &encode(timer)?)
    }

    pub fn get_timer(&self, timer_id: &str) -> Result<Option<TimerRecord>, StorageError> {
        match self.kv.get(&key(prefix::TIMERS, timer_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_timers_by_state(&self, state: TimerState) -> Result<Vec<TimerRecord>, StorageError> {
        self.scan_all::<TimerRecord>(prefix::TIMERS)
            .map(|timers| timers.into_iter().filter(|t| t.state == state).collect())
    }

    // ---- jobs ----

    pub fn save_job(&self, job: &Job) -> Result<(), StorageError> {
        self.kv
            .put(&key(prefix::JOBS, job.job_key.as_str()), &encode(job)?)
    }

    pub fn get_job(&self, job_key: &str) -> Result<Option<Job>, StorageError> {
        match self.kv.get(&key(prefix::JOBS, job_key))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Jobs of `job_type` in `status`, ordered by `created_at` ascending
    /// (§4.D "Worker fairness": "returns jobs in created_at ascending
    /// within a type").
    pub fn list_jobs_by_type_and_status(
        &self,
        job_type: &str,
        status: JobStatus,
    ) -> Result<Vec<Job>, StorageError> {
        let mut jobs: Vec<Job> = self
            .scan_all::<Job>(prefix::JOBS)?
            .into_iter()
            .filter(|j| j.job_type == job_type && j.status == status)
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    pub fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StorageError> {
        self.scan_all::<Job>(prefix::JOBS)
            .map(|jobs| jobs.into_iter().filter(|j| j.status == status).collect())
    }

    // ---- subscriptions ----

    pub fn save_subscription(&self, sub: &MessageSubscription) -> Result<(), StorageError> {
        self.kv.put(
            &key(prefix::SUBSCRIPTIONS, sub.subscription_id.as_str()),
            &encode(sub)?,
        )
    }

    pub fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<MessageSubscription>, StorageError> {
        match self.kv.get(&key(prefix::SUBSCRIPTIONS, subscription_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_subscription(&self, subscription_id: &str) -> Result<(), StorageError> {
        self.kv.delete(&key(prefix::SUBSCRIPTIONS, subscription_id))
    }

    pub fn list_subscriptions_by_message_name(
        &self,
        message_name: &str,
    ) -> Result<Vec<MessageSubscription>, StorageError> {
        self.scan_all::<MessageSubscription>(prefix::SUBSCRIPTIONS)
            .map(|subs| {
                subs.into_iter()
                    .filter(|s| s.is_active && s.message_name == message_name)
                    .collect()
            })
    }

    // ---- buffered messages ----

    pub fn save_buffered_message(&self, message: &BufferedMessage) -> Result<(), StorageError> {
        self.kv.put(
            &key(prefix::BUFFERED_MESSAGES, message.message_id.as_str()),
            &encode(message)?,
        )
    }

    pub fn delete_buffered_message(&self, message_id: &str) -> Result<(), StorageError> {
        self.kv.delete(&key(prefix::BUFFERED_MESSAGES, message_id))
    }

    pub fn list_buffered_by_name(&self, name: &str) -> Result<Vec<BufferedMessage>, StorageError> {
        self.scan_all::<BufferedMessage>(prefix::BUFFERED_MESSAGES)
            .map(|messages| {
                messages
                    .into_iter()
                    .filter(|m| !m.consumed && m.name == name)
                    .collect()
            })
    }

    pub fn list_all_buffered(&self) -> Result<Vec<BufferedMessage>, StorageError> {
        self.scan_all(prefix::BUFFERED_MESSAGES)
    }

    /// Every subscription regardless of `message_name`/`is_active` — used
    /// by instance cancellation to find subscriptions bound to a given
    /// instance's tokens without a secondary index.
    pub fn list_all_subscriptions(&self) -> Result<Vec<MessageSubscription>, StorageError> {
        self.scan_all(prefix::SUBSCRIPTIONS)
    }

    // ---- incidents ----

    pub fn save_incident(&self, incident: &Incident) -> Result<(), StorageError> {
        self.kv.put(
            &key(prefix::INCIDENTS, incident.incident_id.as_str()),
            &encode(incident)?,
        )
    }

    pub fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, StorageError> {
        match self.kv.get(&key(prefix::INCIDENTS, incident_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, StorageError> {
        self.scan_all::<Incident>(prefix::INCIDENTS)
            .map(|incidents| incidents.into_iter().filter(|i| filter.matches(i)).collect())
    }

    // ---- join states ----

    pub fn save_join_state(&self, state: &JoinState) -> Result<(), StorageError> {
        self.kv.put(
            &key(prefix::JOIN_STATES, state.join_state_id.as_str()),
            &encode(state)?,
        )
    }

    pub fn get_join_state(&self, join_state_id: &str) -> Result<Option<JoinState>, StorageError> {
        match self.kv.get(&key(prefix::JOIN_STATES, join_state_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_join_state(&self, join_state_id: &str) -> Result<(), StorageError> {
        self.kv.delete(&key(prefix::JOIN_STATES, join_state_id))
    }

    // ---- gateway races (eventBasedGateway) ----

    pub fn save_gateway_race(&self, race: &GatewayRace) -> Result<(), StorageError> {
        self.kv
            .put(&key(prefix::GATEWAY_RACES, race.race_id.as_str()), &encode(race)?)
    }

    pub fn get_gateway_race(&self, race_id: &str) -> Result<Option<GatewayRace>, StorageError> {
        match self.kv.get(&key(prefix::GATEWAY_RACES, race_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_gateway_race(&self, race_id: &str) -> Result<(), StorageError> {
        self.kv.delete(&key(prefix::GATEWAY_RACES, race_id))
    }

    // ---- system events ----

    pub fn append_system_event(&self, event: &SystemEvent) -> Result<(), StorageError> {
        self.kv
            .put(&key(prefix::SYSTEM_EVENTS, &event.id), &encode(event)?)
    }

    pub fn list_system_events(&self) -> Result<Vec<SystemEvent>, StorageError> {
        self.scan_all(prefix::SYSTEM_EVENTS)
    }

    // ---- shared scan helper ----

    fn scan_all<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        self.kv
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(k, v)| {
                decode(&v).map_err(|e| {
                    warn!(key = %String::from_utf8_lossy(&k), error = %e, "failed to decode stored record");
                    e
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use bpmn_types::{InstanceId, TokenId};
    use chrono::Utc;

    fn gateway() -> StorageGateway<InMemoryKvStore> {
        StorageGateway::new(Arc::new(InMemoryKvStore::new()))
    }

    #[test]
    fn save_and_get_instance_round_trips() {
        let gw = gateway();
        let instance = ProcessInstance::new(InstanceId::generate(), "p:v1".to_string(), Utc::now());
        gw.save_instance(&instance).unwrap();

        let loaded = gw.get_instance(instance.instance_id.as_str()).unwrap();
        assert_eq!(loaded, Some(instance));
    }

    #[test]
    fn get_missing_instance_returns_none() {
        let gw = gateway();
        assert_eq!(gw.get_instance("nope").unwrap(), None);
    }

    #[test]
    fn list_tokens_by_state_filters_correctly() {
        let gw = gateway();
        let instance_id = InstanceId::generate();
        let now = Utc::now();

        let mut active = Token::new_at(instance_id.clone(), "a", None, now);
        let mut waiting = Token::new_at(instance_id.clone(), "b", None, now);
        waiting.park(bpmn_types::WaitHandle::UserTask, now);

        gw.save_token(&active).unwrap();
        gw.save_token(&waiting).unwrap();

        let actives = gw.list_tokens_by_state(TokenState::Active).unwrap();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].token_id, active.token_id);

        let waitings = gw.list_tokens_by_state(TokenState::Waiting).unwrap();
        assert_eq!(waitings.len(), 1);
        assert_eq!(waitings[0].token_id, waiting.token_id);

        active.terminate(TokenState::Completed, now);
        gw.save_token(&active).unwrap();
        assert_eq!(gw.list_tokens_by_state(TokenState::Active).unwrap().len(), 0);
    }

    #[test]
    fn list_jobs_by_type_and_status_orders_by_created_at() {
        let gw = gateway();
        let instance_id = InstanceId::generate();
        let t0 = Utc::now();

        let mut first = Job::new_pending(
            "email",
            instance_id.clone(),
            "task-1",
            TokenId::generate(),
            Default::default(),
            Default::default(),
            3,
            t0,
        );
        first.created_at = t0;
        let mut second = Job::new_pending(
            "email",
            instance_id.clone(),
            "task-2",
            TokenId::generate(),
            Default::default(),
            Default::default(),
            3,
            t0,
        );
        second.created_at = t0 + chrono::Duration::seconds(1);

        // Insert in reverse creation order to prove the gateway sorts, not
        // just returns insertion order.
        gw.save_job(&second).unwrap();
        gw.save_job(&first).unwrap();

        let jobs = gw
            .list_jobs_by_type_and_status("email", JobStatus::Pending)
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_key, first.job_key);
        assert_eq!(jobs[1].job_key, second.job_key);
    }

    #[test]
    fn list_process_versions_sorted_ascending() {
        let gw = gateway();
        for version in [3u64, 1, 2] {
            let def = ProcessDefinition {
                process_id: "p".to_string(),
                version,
                content_hash: format!("h{version}"),
                elements: Default::default(),
                flows: Default::default(),
                messages: Default::default(),
                errors: Default::default(),
                signals: Default::default(),
            };
            gw.save_process(&def).unwrap();
        }

        let versions = gw.list_process_versions("p").unwrap();
        let nums: Vec<u64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }
}
