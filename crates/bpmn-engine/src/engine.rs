use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bpmn_incidents::{IncidentSink, IncidentStore, NewIncident};
use bpmn_jobs::{JobQueue, JobQueueConfig};
use bpmn_messaging::{MessageBus, MessageBusConfig, MessageDeliveredCallback, NewMessage, NewSubscription};
use bpmn_storage::{KvStore, StorageGateway};
use bpmn_timewheel::{TimeWheel, TimeWheelConfig};
use bpmn_types::{
    ElementType, ExpressionEvaluator, Incident, IncidentFilter, IncidentId, IncidentStats,
    InstanceId, InstanceState, JobStatus, ProcessDefinition, ResolutionAction, SystemEvent,
    SystemEventType, Token, TokenId, TokenState, VariableMap, WaitHandle,
};

use crate::error::ExecutorError;
use crate::instance_lock::InstanceLocks;
use crate::scheduler::{InboxEvent, SchedulerReason};

/// Worker pool sizing and inbox sizing knobs (§5 "a pool of worker
/// threads drains the scheduler inbox"). Builder-style, matching the
/// sibling crates' `*Config::build`.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub worker_threads: usize,
    pub inbox_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            inbox_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Wire up storage, the incident sink, and every downstream subsystem
    /// (time wheel, job queue, message bus), then spawn the callback pump
    /// threads and the worker pool that drains the scheduler inbox (§4.E,
    /// §5). Returns a handle any number of callers can clone and share;
    /// every spawned thread holds only what it needs to keep running
    /// until the last handle and the last subsystem channel are dropped.
    pub fn build<K: KvStore + 'static>(
        &self,
        kv: Arc<K>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Arc<ProcessEngine<K>> {
        let gateway = StorageGateway::new(kv);
        let incident_store = IncidentStore::new(gateway.clone());
        let incidents: Arc<dyn IncidentSink> = Arc::new(incident_store.clone());

        let (timewheel, timer_rx) = TimeWheelConfig::default().build(gateway.clone(), Arc::clone(&incidents));
        let (jobs, job_rx) = JobQueueConfig::default().build(gateway.clone(), Arc::clone(&incidents));
        let (messages, message_rx) =
            MessageBusConfig::default().build(gateway.clone(), Arc::clone(&incidents), Arc::clone(&evaluator));

        let (inbox_tx, inbox_rx) = sync_channel(self.inbox_channel_capacity.max(1));
        // `Receiver` isn't `Sync`; a shared `Mutex` is the standard way to
        // fan a single channel out across a worker pool.
        let inbox_rx = Arc::new(Mutex::new(inbox_rx));

        let engine = Arc::new(ProcessEngine {
            gateway,
            incident_store,
            incidents,
            evaluator,
            timewheel,
            jobs,
            messages,
            locks: Arc::new(InstanceLocks::new()),
            inbox: inbox_tx,
            config: *self,
        });

        for worker in 0..self.worker_threads.max(1) {
            let engine = Arc::clone(&engine);
            let inbox_rx = Arc::clone(&inbox_rx);
            thread::Builder::new()
                .name(format!("bpmn-engine-worker-{worker}"))
                .spawn(move || loop {
                    let event = {
                        let rx = inbox_rx.lock().expect("engine inbox lock poisoned");
                        rx.recv()
                    };
                    match event {
                        Ok((token_id, reason)) => engine.drain(token_id, reason, Utc::now()),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn engine worker thread");
        }

        spawn_timer_pump(Arc::clone(&engine), timer_rx);
        spawn_job_pump(Arc::clone(&engine), job_rx);
        spawn_message_pump(Arc::clone(&engine), message_rx);

        engine
    }
}

fn spawn_timer_pump<K: KvStore + 'static>(engine: Arc<ProcessEngine<K>>, rx: Receiver<bpmn_types::TimerFiredCallback>) {
    thread::spawn(move || {
        for callback in rx {
            let token_id = callback.token_id.clone();
            if engine.inbox.send((token_id, SchedulerReason::TimerFired(callback))).is_err() {
                break;
            }
        }
    });
}

fn spawn_job_pump<K: KvStore + 'static>(engine: Arc<ProcessEngine<K>>, rx: Receiver<bpmn_types::JobCallback>) {
    thread::spawn(move || {
        for callback in rx {
            let token_id = callback.token_id.clone();
            if engine.inbox.send((token_id, SchedulerReason::JobCallback(callback))).is_err() {
                break;
            }
        }
    });
}

fn spawn_message_pump<K: KvStore + 'static>(engine: Arc<ProcessEngine<K>>, rx: Receiver<MessageDeliveredCallback>) {
    thread::spawn(move || {
        for callback in rx {
            match callback.token_id.clone() {
                Some(token_id) => {
                    if engine
                        .inbox
                        .send((token_id, SchedulerReason::MessageDelivered(callback)))
                        .is_err()
                    {
                        break;
                    }
                }
                None => {
                    if let Err(err) = engine.instantiate_from_subscription(callback, Utc::now()) {
                        warn!(error = %err, "failed to start a process instance from a message-triggered subscription");
                    }
                }
            }
        }
    });
}

/// The BPMN process executor (§4.E). Owns storage and every downstream
/// subsystem handle; the element dispatch table lives in `executors.rs`
/// as a second `impl` block over the same type.
pub struct ProcessEngine<K: KvStore> {
    pub(crate) gateway: StorageGateway<K>,
    pub(crate) incident_store: IncidentStore<K>,
    pub(crate) incidents: Arc<dyn IncidentSink>,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) timewheel: TimeWheel<K>,
    pub(crate) jobs: JobQueue<K>,
    pub(crate) messages: MessageBus<K>,
    pub(crate) locks: Arc<InstanceLocks>,
    pub(crate) inbox: SyncSender<InboxEvent>,
    #[allow(dead_code)]
    pub(crate) config: EngineConfig,
}

impl<K: KvStore + 'static> ProcessEngine<K> {
    pub fn storage(&self) -> &StorageGateway<K> {
        &self.gateway
    }

    pub fn jobs(&self) -> &JobQueue<K> {
        &self.jobs
    }

    pub fn messages(&self) -> &MessageBus<K> {
        &self.messages
    }

    pub fn timers(&self) -> &TimeWheel<K> {
        &self.timewheel
    }

    pub fn incidents(&self) -> &IncidentStore<K> {
        &self.incident_store
    }

    /// Register a process definition and, if its start event is
    /// message-triggered, install the matching process-start subscription
    /// (`token_id: None`, §4.E "message start events").
    pub fn register_process(&self, def: ProcessDefinition, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let process_key = def.process_key();
        let start = crate::graph::start_event(&def).ok_or_else(|| ExecutorError::ElementNotFound("start event".to_string()))?;
        let message_ref = match &start.element_type {
            ElementType::StartEvent { message_ref } => message_ref.clone(),
            _ => None,
        };
        self.gateway.save_process(&def)?;

        if let Some(message_ref) = message_ref {
            let message_name = def.resolve_message_name(&message_ref).to_string();
            self.messages.subscribe(
                NewSubscription {
                    process_definition_key: process_key,
                    element_id: start.id.clone(),
                    message_name,
                    correlation_key: None,
                    token_id: None,
                },
                now,
            )?;
        }
        Ok(())
    }

    /// Create a new instance at `process_key`'s start event and run it
    /// synchronously until it either completes or parks (§4.E `Start`).
    /// Rejects message-triggered start events: those instances come into
    /// being only via a delivered message (`instantiate_from_subscription`).
    pub fn start_instance(
        &self,
        process_key: &str,
        variables: VariableMap,
        now: DateTime<Utc>,
    ) -> Result<InstanceId, ExecutorError> {
        let def = self
            .gateway
            .get_process(process_key)?
            .ok_or_else(|| ExecutorError::ProcessNotFound(process_key.to_string()))?;
        let start = crate::graph::start_event(&def).ok_or_else(|| ExecutorError::ElementNotFound("start event".to_string()))?;
        if matches!(&start.element_type, ElementType::StartEvent { message_ref: Some(_) }) {
            return Err(ExecutorError::ElementNotFound(
                "message-triggered start events are instantiated via message delivery, not start_instance".to_string(),
            ));
        }

        let mut instance = bpmn_types::ProcessInstance::new(InstanceId::generate(), process_key.to_string(), now);
        instance.variables = variables.clone();
        let mut token = Token::new_at(instance.instance_id.clone(), start.id.clone(), None, now);
        token.variables = variables;

        self.gateway.save_instance(&instance)?;
        self.gateway.save_token(&token)?;

        let instance_id = instance.instance_id.clone();
        let token_id = token.token_id.clone();
        self.advance(token_id, SchedulerReason::Start, now)?;
        Ok(instance_id)
    }

    /// Entry point for a process-start message delivery (`token_id: None`
    /// on the callback). Creates the instance, re-installs the start
    /// subscription so future deliveries keep starting new instances, and
    /// runs the new token synchronously (§4.E "message start events").
    pub(crate) fn instantiate_from_subscription(
        &self,
        callback: MessageDeliveredCallback,
        now: DateTime<Utc>,
    ) -> Result<InstanceId, ExecutorError> {
        let subscription = self
            .gateway
            .get_subscription(callback.subscription_id.as_str())?
            .ok_or_else(|| ExecutorError::ElementNotFound(callback.subscription_id.to_string()))?;
        let def = self
            .gateway
            .get_process(&subscription.process_definition_key)?
            .ok_or_else(|| ExecutorError::ProcessNotFound(subscription.process_definition_key.clone()))?;
        let start = crate::graph::element(&def, &subscription.element_id)?;

        let mut instance = bpmn_types::ProcessInstance::new(InstanceId::generate(), def.process_key(), now);
        instance.variables = callback.variables.clone();
        let mut token = Token::new_at(instance.instance_id.clone(), start.id.clone(), None, now);
        token.variables = callback.variables;

        self.gateway.save_instance(&instance)?;
        self.gateway.save_token(&token)?;

        self.messages.subscribe(
            NewSubscription {
                process_definition_key: subscription.process_definition_key,
                element_id: subscription.element_id,
                message_name: subscription.message_name,
                correlation_key: None,
                token_id: None,
            },
            now,
        )?;

        let instance_id = instance.instance_id.clone();
        let token_id = token.token_id.clone();
        self.advance(token_id, SchedulerReason::Start, now)?;
        Ok(instance_id)
    }

    /// Drain `dispatch_one` until the token's chain of internal
    /// continuations settles — a fast-path BFS local to this call, never
    /// touching the shared inbox (§5 "internal continuations never
    /// re-enter the scheduler inbox"). Errors propagate to the caller.
    ///
    /// Held under the target instance's advisory lock for its whole
    /// duration, not just per dispatch: installing an event-based-gateway
    /// race or a message catcher can trigger a *synchronous* delivery
    /// inside `bpmn-messaging` (a buffered message matching the brand new
    /// subscription), which only enqueues a callback rather than
    /// re-entering here directly — but the worker thread that eventually
    /// drains that callback calls `advance` too, and will simply block on
    /// this same lock until the install finishes. That's what keeps the
    /// install and the resume from observing each other's half-written
    /// state.
    pub(crate) fn advance(&self, token_id: TokenId, reason: SchedulerReason, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let Some(token) = self.gateway.get_token(token_id.as_str())? else {
            debug!(token_id = %token_id, "advance for an unknown token, dropping");
            return Ok(());
        };
        let instance_id = token.instance_id.clone();
        self.locks.with_lock(&instance_id, move || self.advance_locked(token_id, reason, now))
    }

    fn advance_locked(&self, token_id: TokenId, reason: SchedulerReason, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let mut queue: std::collections::VecDeque<InboxEvent> = std::collections::VecDeque::new();
        queue.push_back((token_id, reason));

        while let Some((token_id, reason)) = queue.pop_front() {
            let continuations = self.dispatch_one(&token_id, reason, now)?;
            queue.extend(continuations);
        }
        Ok(())
    }

    /// Same as `advance`, but swallows (and logs) errors — the shape a
    /// background worker thread needs, since there's no caller left to
    /// propagate an `Err` to.
    pub(crate) fn drain(&self, token_id: TokenId, reason: SchedulerReason, now: DateTime<Utc>) {
        if let Err(err) = self.advance(token_id, reason, now) {
            warn!(token_id = %token_id, error = %err, "dispatch failed");
        }
    }

    /// Cancel every non-terminal token, job, timer, and subscription
    /// belonging to `instance_id`, then mark the instance `CANCELED`
    /// (§4.E instance cancellation). Held under the per-instance advisory
    /// lock so no concurrently-resuming token races this teardown.
    pub fn cancel_instance(&self, instance_id: &InstanceId, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        self.locks.with_lock(instance_id, || self.cancel_instance_locked(instance_id, now))
    }

    fn cancel_instance_locked(&self, instance_id: &InstanceId, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let mut instance = self
            .gateway
            .get_instance(instance_id.as_str())?
            .ok_or_else(|| ExecutorError::InstanceNotFound(instance_id.to_string()))?;

        let tokens = self.gateway.list_tokens_by_instance(instance_id.as_str())?;
        for mut token in tokens {
            if matches!(token.state, TokenState::Active | TokenState::Waiting) {
                self.release_wait_handle(&token);
                token.terminate(TokenState::Canceled, now);
                self.gateway.save_token(&token)?;
            }
        }

        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Deferred] {
            for job in self.gateway.list_jobs_by_status(status)? {
                if job.process_instance_id == *instance_id {
                    self.jobs.cancel(job.job_key.as_str())?;
                }
            }
        }

        for timer in self.gateway.list_timers_by_state(bpmn_types::TimerState::Scheduled)? {
            if timer.process_instance_id == *instance_id {
                self.timewheel.cancel(timer.timer_id.as_str())?;
            }
        }

        for sub in self.gateway.list_all_subscriptions()? {
            if sub.is_active && sub.token_id.as_ref().is_some_and(|t| {
                self.gateway
                    .get_token(t.as_str())
                    .ok()
                    .flatten()
                    .is_some_and(|token| token.instance_id == *instance_id)
            }) {
                self.messages.unsubscribe(sub.subscription_id.as_str())?;
            }
        }

        if !instance.state.is_terminal() {
            instance.finish(InstanceState::Canceled, now);
            self.gateway.save_instance(&instance)?;
        }
        self.locks.forget(instance_id);
        Ok(())
    }

    /// Best-effort release of whatever external handle a token was
    /// waiting on, before it's terminated out from under that handle.
    pub(crate) fn release_wait_handle(&self, token: &Token) {
        match &token.waiting_for {
            Some(WaitHandle::Timer(timer_id)) => {
                if let Err(err) = self.timewheel.cancel(timer_id) {
                    debug!(timer_id = %timer_id, error = %err, "timer already gone while releasing wait handle");
                }
            }
            Some(WaitHandle::Job(job_key)) => {
                if let Err(err) = self.jobs.cancel(job_key) {
                    debug!(job_key = %job_key, error = %err, "job already gone while releasing wait handle");
                }
            }
            Some(WaitHandle::Message(_)) => {
                if let Ok(subs) = self.gateway.list_all_subscriptions() {
                    for sub in subs {
                        if sub.is_active && sub.token_id.as_ref() == Some(&token.token_id) {
                            let _ = self.messages.unsubscribe(sub.subscription_id.as_str());
                        }
                    }
                }
            }
            Some(WaitHandle::UserTask) | Some(WaitHandle::Incident(_)) | None => {}
        }
    }

    /// Complete a parked user task (§4.E userTask): merge output
    /// variables, resume the token, and run it forward.
    pub fn complete_user_task(&self, token_id: &TokenId, variables: VariableMap, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let token = self
            .gateway
            .get_token(token_id.as_str())?
            .ok_or_else(|| ExecutorError::TokenNotFound(token_id.to_string()))?;
        if token.waiting_for != Some(WaitHandle::UserTask) {
            return Err(ExecutorError::TokenNotFound(format!("{token_id} is not parked on a user task")));
        }
        self.advance(token_id.clone(), SchedulerReason::SignalReady { variables }, now)
    }

    /// Apply a resolution action to an open incident (§4.E incident
    /// resolution). `Retry` hands the job back to `bpmn-jobs` and
    /// re-parks the associated token on the job handle so it resumes
    /// normally the next time that job completes or fails; `Dismiss`
    /// cancels the associated token outright.
    pub fn resolve_incident(
        &self,
        incident_id: &str,
        action: ResolutionAction,
        resolved_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Incident, ExecutorError> {
        let incident = self.incident_store.get(incident_id)?;
        let token = incident
            .token_id
            .as_ref()
            .and_then(|id| self.gateway.get_token(id.as_str()).ok().flatten());

        match &action {
            ResolutionAction::Retry { new_retries } => {
                let job_key = incident
                    .job_key
                    .as_ref()
                    .ok_or_else(|| ExecutorError::IncidentNotFound(incident_id.to_string()))?;
                self.jobs.retry(job_key.as_str(), *new_retries, now)?;
                if let Some(mut token) = token {
                    token.park(WaitHandle::Job(job_key.to_string()), now);
                    self.gateway.save_token(&token)?;
                }
            }
            ResolutionAction::Dismiss => {
                if let Some(token) = token {
                    self.release_wait_handle(&token);
                    let mut token = token;
                    token.terminate(TokenState::Canceled, now);
                    self.gateway.save_token(&token)?;
                }
            }
        }

        Ok(self.incident_store.resolve(incident_id, action, resolved_by, now)?)
    }

    pub fn incident_stats(&self, now: DateTime<Utc>) -> Result<IncidentStats, ExecutorError> {
        Ok(self.incident_store.stats(now)?)
    }

    pub fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, ExecutorError> {
        Ok(self.incident_store.list(filter)?)
    }

    pub(crate) fn raise_incident(&self, new: NewIncident, now: DateTime<Utc>) -> Result<IncidentId, ExecutorError> {
        Ok(self.incidents.raise(new, now)?)
    }

    /// Replay `SCHEDULED` timers from storage and append a startup event
    /// (§4.B `Restore`, §6.4 Startup). Run once before serving traffic
    /// after a process restart.
    pub fn restore(&self, now: DateTime<Utc>) -> Result<usize, ExecutorError> {
        let restored = self.timewheel.restore(now)?;
        self.gateway.append_system_event(&SystemEvent::new(
            SystemEventType::Startup,
            "ok",
            format!("restored {restored} scheduled timers"),
            now,
        ))?;
        Ok(restored)
    }

    pub fn mark_ready(&self, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        self.gateway
            .append_system_event(&SystemEvent::new(SystemEventType::Ready, "ok", "engine ready", now))?;
        Ok(())
    }

    /// Record a shutdown event. Thread teardown is the embedding process's
    /// responsibility (§1 Non-goals "process supervision"): dropping every
    /// `Arc<ProcessEngine<_>>` handle is what actually stops the worker
    /// pool and callback pumps, since they hold no reference back to this
    /// method.
    pub fn shutdown(&self, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        self.gateway
            .append_system_event(&SystemEvent::new(SystemEventType::Shutdown, "ok", "engine shutting down", now))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::{Duration as StdDuration, Instant};

    use bpmn_storage::InMemoryKvStore;
    use bpmn_types::{ElementRecord, Flow, MessageDefinition, TimerDefinition, TimerKind, TimerState, Value, WorkerId};

    use super::*;
    use crate::expr::SimpleFeelEvaluator;

    fn harness() -> Arc<ProcessEngine<InMemoryKvStore>> {
        let kv = Arc::new(InMemoryKvStore::new());
        let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(SimpleFeelEvaluator);
        EngineConfig::default().worker_threads(2).build(kv, evaluator)
    }

    fn element(id: &str, element_type: ElementType, incoming: &[&str], outgoing: &[&str]) -> ElementRecord {
        ElementRecord {
            id: id.to_string(),
            name: None,
            element_type,
            incoming: incoming.iter().map(|s| s.to_string()).collect(),
            outgoing: outgoing.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn flow(id: &str, source: &str, target: &str, condition: Option<&str>, is_default: bool) -> Flow {
        Flow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: condition.map(|c| c.to_string()),
            is_default,
        }
    }

    fn process(process_id: &str, elements: Vec<ElementRecord>, flows: Vec<Flow>, messages: Vec<MessageDefinition>) -> ProcessDefinition {
        ProcessDefinition {
            process_id: process_id.to_string(),
            version: 1,
            content_hash: "test".to_string(),
            elements: elements.into_iter().map(|e| (e.id.clone(), e)).collect(),
            flows: flows.into_iter().map(|f| (f.id.clone(), f)).collect(),
            messages: messages.into_iter().map(|m| (m.name.clone(), m)).collect(),
            errors: HashMap::new(),
            signals: HashMap::new(),
        }
    }

    /// Poll `check` until it returns `Some`, or panic once `timeout` has
    /// elapsed. Needed wherever a callback crosses from a subsystem's own
    /// background thread through the engine's worker pool, since that
    /// continuation never runs on the calling thread.
    fn wait_until<T>(timeout: StdDuration, mut check: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = check() {
                return value;
            }
            if Instant::now() >= deadline {
                panic!("condition did not become true within {timeout:?}");
            }
            std::thread::sleep(StdDuration::from_millis(10));
        }
    }

    fn instance_completed(engine: &ProcessEngine<InMemoryKvStore>, instance_id: &InstanceId) -> bool {
        engine
            .storage()
            .get_instance(instance_id.as_str())
            .unwrap()
            .map(|i| i.state == InstanceState::Completed)
            .unwrap_or(false)
    }

    #[test]
    fn service_task_completion_runs_a_token_to_the_end_event() {
        let engine = harness();
        let def = process(
            "service-task",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element(
                    "charge",
                    ElementType::ServiceTask { job_type: "charge-card".to_string(), retries: 3 },
                    &["f1"],
                    &["f2"],
                ),
                element("end", ElementType::EndEvent { terminate: false }, &["f2"], &[]),
            ],
            vec![flow("f1", "start", "charge", None, false), flow("f2", "charge", "end", None, false)],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();
        let instance_id = engine.start_instance("service-task:v1", VariableMap::new(), Utc::now()).unwrap();

        let job = wait_until(StdDuration::from_secs(2), || {
            engine.jobs().activate("charge-card", WorkerId::from_raw("worker-1"), 1, StdDuration::from_secs(30), Utc::now()).unwrap().into_iter().next()
        });
        engine.jobs().complete(job.job_key.as_str(), VariableMap::new(), Utc::now()).unwrap();

        wait_until(StdDuration::from_secs(2), || instance_completed(&engine, &instance_id).then_some(()));
    }

    #[test]
    fn exclusive_gateway_follows_the_matching_condition() {
        let engine = harness();
        let def = process(
            "exclusive",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element("split", ElementType::ExclusiveGateway, &["f1"], &["high", "low"]),
                element("end-high", ElementType::EndEvent { terminate: false }, &["high"], &[]),
                element("end-low", ElementType::EndEvent { terminate: false }, &["low"], &[]),
            ],
            vec![
                flow("f1", "start", "split", None, false),
                flow("high", "split", "end-high", Some("amount>100"), false),
                flow("low", "split", "end-low", None, true),
            ],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();

        let mut vars = VariableMap::new();
        vars.insert("amount".to_string(), Value::Int(500));
        let instance_id = engine.start_instance("exclusive:v1", vars, Utc::now()).unwrap();

        assert!(instance_completed(&engine, &instance_id));
        let tokens = engine.storage().list_tokens_by_instance(instance_id.as_str()).unwrap();
        assert!(tokens.iter().any(|t| t.current_element_id == "end-high"));
    }

    #[test]
    fn exclusive_gateway_with_no_true_condition_and_no_default_raises_an_incident() {
        let engine = harness();
        let def = process(
            "exclusive-no-default",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element("split", ElementType::ExclusiveGateway, &["f1"], &["high"]),
                element("end-high", ElementType::EndEvent { terminate: false }, &["high"], &[]),
            ],
            vec![
                flow("f1", "start", "split", None, false),
                flow("high", "split", "end-high", Some("amount>100"), false),
            ],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();

        let mut vars = VariableMap::new();
        vars.insert("amount".to_string(), Value::Int(1));
        let instance_id = engine.start_instance("exclusive-no-default:v1", vars, Utc::now()).unwrap();

        assert!(!instance_completed(&engine, &instance_id));
        let incidents = engine
            .list_incidents(&IncidentFilter { instance_id: Some(instance_id.clone()), ..Default::default() })
            .unwrap();
        assert_eq!(incidents.len(), 1);
        let tokens = engine.storage().list_tokens_by_instance(instance_id.as_str()).unwrap();
        assert!(tokens.iter().any(|t| t.current_element_id == "split" && t.state == TokenState::Waiting));
    }

    #[test]
    fn inclusive_gateway_with_no_true_condition_and_no_default_raises_an_incident() {
        let engine = harness();
        let def = process(
            "inclusive-no-default",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element("split", ElementType::InclusiveGateway, &["f1"], &["high"]),
                element("end-high", ElementType::EndEvent { terminate: false }, &["high"], &[]),
            ],
            vec![
                flow("f1", "start", "split", None, false),
                flow("high", "split", "end-high", Some("amount>100"), false),
            ],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();

        let mut vars = VariableMap::new();
        vars.insert("amount".to_string(), Value::Int(1));
        let instance_id = engine.start_instance("inclusive-no-default:v1", vars, Utc::now()).unwrap();

        assert!(!instance_completed(&engine, &instance_id));
        let incidents = engine
            .list_incidents(&IncidentFilter { instance_id: Some(instance_id.clone()), ..Default::default() })
            .unwrap();
        assert_eq!(incidents.len(), 1);
    }

    #[test]
    fn message_catch_event_consumes_a_buffered_message() {
        let engine = harness();
        let def = process(
            "message-catch",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element(
                    "wait",
                    ElementType::IntermediateCatchEvent { message_ref: Some("approved".to_string()), timer_definition: None },
                    &["f1"],
                    &["f2"],
                ),
                element("end", ElementType::EndEvent { terminate: false }, &["f2"], &[]),
            ],
            vec![flow("f1", "start", "wait", None, false), flow("f2", "wait", "end", None, false)],
            vec![MessageDefinition { name: "approved".to_string(), correlation_key: None }],
        );
        engine.register_process(def, Utc::now()).unwrap();

        // Published before any subscriber exists: must sit buffered until
        // the instance's catch event installs its subscription.
        engine
            .messages()
            .publish(
                NewMessage { name: "approved".to_string(), correlation_key: String::new(), variables: VariableMap::new(), ttl: None },
                Utc::now(),
            )
            .unwrap();

        let instance_id = engine.start_instance("message-catch:v1", VariableMap::new(), Utc::now()).unwrap();
        wait_until(StdDuration::from_secs(2), || instance_completed(&engine, &instance_id).then_some(()));
    }

    #[test]
    fn boundary_error_event_routes_around_a_thrown_error() {
        let engine = harness();
        let def = process(
            "boundary-error",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element(
                    "risky",
                    ElementType::ServiceTask { job_type: "risky-call".to_string(), retries: 3 },
                    &["f1"],
                    &["f2"],
                ),
                element(
                    "catch-denied",
                    ElementType::BoundaryEvent {
                        attached_to_ref: "risky".to_string(),
                        cancel_activity: true,
                        error_ref: Some("DENIED".to_string()),
                        timer_definition: None,
                        message_ref: None,
                    },
                    &[],
                    &["recovery"],
                ),
                element("end-ok", ElementType::EndEvent { terminate: false }, &["f2"], &[]),
                element("end-recovered", ElementType::EndEvent { terminate: false }, &["recovery"], &[]),
            ],
            vec![
                flow("f1", "start", "risky", None, false),
                flow("f2", "risky", "end-ok", None, false),
                flow("recovery", "catch-denied", "end-recovered", None, false),
            ],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();
        let instance_id = engine.start_instance("boundary-error:v1", VariableMap::new(), Utc::now()).unwrap();

        let job = wait_until(StdDuration::from_secs(2), || {
            engine.jobs().activate("risky-call", WorkerId::from_raw("worker-1"), 1, StdDuration::from_secs(30), Utc::now()).unwrap().into_iter().next()
        });
        engine
            .jobs()
            .throw_error(job.job_key.as_str(), "DENIED", "card declined", VariableMap::new(), Utc::now())
            .unwrap();

        wait_until(StdDuration::from_secs(2), || instance_completed(&engine, &instance_id).then_some(()));
        let tokens = engine.storage().list_tokens_by_instance(instance_id.as_str()).unwrap();
        assert!(tokens.iter().any(|t| t.current_element_id == "end-recovered"));
        assert!(engine.list_incidents(&IncidentFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn unmatched_thrown_error_raises_an_incident_instead_of_routing() {
        let engine = harness();
        let def = process(
            "unhandled-error",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element(
                    "risky",
                    ElementType::ServiceTask { job_type: "risky-call".to_string(), retries: 3 },
                    &["f1"],
                    &["f2"],
                ),
                element("end", ElementType::EndEvent { terminate: false }, &["f2"], &[]),
            ],
            vec![flow("f1", "start", "risky", None, false), flow("f2", "risky", "end", None, false)],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();
        let instance_id = engine.start_instance("unhandled-error:v1", VariableMap::new(), Utc::now()).unwrap();

        let job = wait_until(StdDuration::from_secs(2), || {
            engine.jobs().activate("risky-call", WorkerId::from_raw("worker-1"), 1, StdDuration::from_secs(30), Utc::now()).unwrap().into_iter().next()
        });
        engine
            .jobs()
            .throw_error(job.job_key.as_str(), "UNHANDLED", "boom", VariableMap::new(), Utc::now())
            .unwrap();

        wait_until(StdDuration::from_secs(2), || {
            let incidents = engine
                .list_incidents(&IncidentFilter { instance_id: Some(instance_id.clone()), ..Default::default() })
                .unwrap();
            (!incidents.is_empty()).then_some(())
        });
        assert!(!instance_completed(&engine, &instance_id));
    }

    #[test]
    fn parallel_gateway_forks_and_joins_before_completing() {
        let engine = harness();
        let def = process(
            "fork-join",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f0"]),
                element("fork", ElementType::ParallelGateway, &["f0"], &["f1", "f2"]),
                element("a", ElementType::Task, &["f1"], &["fa"]),
                element("b", ElementType::Task, &["f2"], &["fb"]),
                element("join", ElementType::ParallelGateway, &["fa", "fb"], &["f3"]),
                element("end", ElementType::EndEvent { terminate: false }, &["f3"], &[]),
            ],
            vec![
                flow("f0", "start", "fork", None, false),
                flow("f1", "fork", "a", None, false),
                flow("f2", "fork", "b", None, false),
                flow("fa", "a", "join", None, false),
                flow("fb", "b", "join", None, false),
                flow("f3", "join", "end", None, false),
            ],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();
        let instance_id = engine.start_instance("fork-join:v1", VariableMap::new(), Utc::now()).unwrap();

        // Plain tasks never wait on anything external, so the whole fork
        // and join settles synchronously inside `start_instance`.
        assert!(instance_completed(&engine, &instance_id));
        let tokens = engine.storage().list_tokens_by_instance(instance_id.as_str()).unwrap();
        assert!(tokens.iter().any(|t| t.current_element_id == "end" && t.state == TokenState::Completed));
    }

    #[test]
    fn a_timer_overdue_at_restore_fires_immediately() {
        let engine = harness();
        let def = process(
            "timer-restart",
            vec![
                element("start", ElementType::StartEvent { message_ref: None }, &[], &["f1"]),
                element(
                    "wait",
                    ElementType::IntermediateCatchEvent {
                        message_ref: None,
                        timer_definition: Some(TimerDefinition { kind: TimerKind::Duration, expression: "PT1H".to_string() }),
                    },
                    &["f1"],
                    &["f2"],
                ),
                element("end", ElementType::EndEvent { terminate: false }, &["f2"], &[]),
            ],
            vec![flow("f1", "start", "wait", None, false), flow("f2", "wait", "end", None, false)],
            vec![],
        );
        engine.register_process(def, Utc::now()).unwrap();

        let now = Utc::now();
        let instance_id = engine.start_instance("timer-restart:v1", VariableMap::new(), now).unwrap();

        // Simulate a restart where the timer came due while the wheel
        // wasn't running: it's still SCHEDULED in storage but its
        // `scheduled_at` is already in the past relative to `restart_at`.
        let scheduled = engine.storage().list_timers_by_state(TimerState::Scheduled).unwrap();
        assert_eq!(scheduled.len(), 1);
        let restart_at = scheduled[0].scheduled_at + chrono::Duration::hours(2);

        let restored = engine.restore(restart_at).unwrap();
        assert_eq!(restored, 1);

        wait_until(StdDuration::from_secs(2), || instance_completed(&engine, &instance_id).then_some(()));
    }
}
