//! Per-element-type dispatch (§4.E). One `impl` block per concern, kept
//! in this file so `engine.rs` stays the wiring/lifecycle half of
//! `ProcessEngine`.

use chrono::{DateTime, Utc};
use tracing::debug;

use bpmn_incidents::NewIncident;
use bpmn_jobs::NewJob;
use bpmn_messaging::{NewMessage, NewSubscription};
use bpmn_storage::KvStore;
use bpmn_timewheel::{NewTimer, TimerError};
use bpmn_types::{
    ElementRecord, ElementType, FlowId, GatewayRace, IncidentFilter, IncidentId, IncidentStatus,
    IncidentType, InstanceId, InstanceState, JobStatus, JoinState, ProcessDefinition, RaceSibling,
    TimerDefinition, Token, TokenId, TokenState, Value, VariableMap, WaitHandle, merge_variables,
};

use crate::engine::ProcessEngine;
use crate::error::ExecutorError;
use crate::graph;
use crate::scheduler::{InboxEvent, SchedulerReason};

/// Stashed on an event-based-gateway catcher token so the winner can find
/// and cancel its siblings without a second lookup table.
const RACE_MARKER_KEY: &str = "__event_based_gateway_race";

impl<K: KvStore + 'static> ProcessEngine<K> {
    /// One step of the token scheduler: validate/resolve `reason` against
    /// the loaded token, then dispatch on its current element. Returns the
    /// internal continuations this step produced, for `advance`'s local
    /// drain loop to keep processing without re-entering the shared inbox.
    pub(crate) fn dispatch_one(
        &self,
        token_id: &TokenId,
        reason: SchedulerReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEvent>, ExecutorError> {
        let Some(mut token) = self.gateway.get_token(token_id.as_str())? else {
            debug!(token_id = %token_id, "dispatch for an unknown token, dropping");
            return Ok(vec![]);
        };
        if matches!(token.state, TokenState::Completed | TokenState::Canceled) {
            return Ok(vec![]);
        }
        let Some(instance) = self.gateway.get_instance(token.instance_id.as_str())? else {
            return Ok(vec![]);
        };
        if instance.state.is_terminal() {
            return Ok(vec![]);
        }

        // `MessageDelivered` is the one reason whose token is already
        // resumed: `MessageBus::deliver` merges variables and calls
        // `token.resume` itself before the callback is even emitted, so
        // by the time we load the token here it already reads `Active`.
        // Every other reason must validate and resume it here.
        let mut was_waiting = token.state == TokenState::Waiting;
        match &reason {
            SchedulerReason::Cancel => {
                self.release_wait_handle(&token);
                token.terminate(TokenState::Canceled, now);
                self.gateway.save_token(&token)?;
                return Ok(vec![]);
            }
            SchedulerReason::Start => {}
            SchedulerReason::SignalReady { variables } => {
                merge_variables(&mut token.variables, variables);
                if was_waiting {
                    token.resume(now);
                }
            }
            SchedulerReason::TimerFired(cb) => {
                if !was_waiting || token.waiting_for.as_ref() != Some(&WaitHandle::Timer(cb.timer_id.to_string())) {
                    debug!(token_id = %token_id, "stale timer callback, dropping");
                    return Ok(vec![]);
                }
                token.resume(now);
            }
            SchedulerReason::JobCallback(cb) => {
                if !was_waiting || token.waiting_for.as_ref() != Some(&WaitHandle::Job(cb.job_key.to_string())) {
                    debug!(token_id = %token_id, "stale job callback, dropping");
                    return Ok(vec![]);
                }
                token.resume(now);
            }
            SchedulerReason::MessageDelivered(_) => {
                was_waiting = true;
            }
        }
        self.gateway.save_token(&token)?;

        let def = self
            .gateway
            .get_process(&instance.process_key)?
            .ok_or_else(|| ExecutorError::ProcessNotFound(instance.process_key.clone()))?;
        self.execute_element(&def, token, was_waiting, &reason, now)
    }

    fn execute_element(
        &self,
        def: &ProcessDefinition,
        token: Token,
        was_waiting: bool,
        reason: &SchedulerReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEvent>, ExecutorError> {
        let element = graph::element(def, &token.current_element_id)?.clone();
        match &element.element_type {
            ElementType::StartEvent { .. } | ElementType::Task => self.advance_single_outgoing(def, token, &element, now),
            ElementType::EndEvent { terminate } => self.exec_end_event(token, *terminate, now),
            ElementType::ServiceTask { job_type, retries } => {
                let job_type = job_type.clone();
                let retries = *retries;
                self.exec_service_task(def, token, &element, &job_type, retries, was_waiting, reason, now)
            }
            ElementType::UserTask => self.exec_user_task(def, token, &element, was_waiting, now),
            ElementType::ExclusiveGateway => self.exec_exclusive_gateway(def, token, &element, now),
            ElementType::ParallelGateway => {
                let outgoing = element.outgoing.clone();
                self.exec_gateway_fork(def, token, outgoing, now)
            }
            ElementType::InclusiveGateway => self.exec_inclusive_gateway(def, token, &element, now),
            ElementType::EventBasedGateway => self.exec_event_based_gateway(def, token, &element, was_waiting, now),
            ElementType::IntermediateCatchEvent { .. } => self.exec_intermediate_catch(def, token, &element, was_waiting, now),
            ElementType::IntermediateThrowEvent { .. } => self.exec_throw_event(def, token, &element, now),
            ElementType::BoundaryEvent { .. } => self.exec_boundary_fire(def, token, &element, was_waiting, now),
            ElementType::SequenceFlow => Err(ExecutorError::ElementNotFound(format!(
                "{} is a flow id, not a dispatchable element",
                element.id
            ))),
        }
    }

    // ---- shared flow/join helpers ----

    /// `token`'s scope for expression evaluation: instance variables
    /// layered under token variables, token wins on conflict (§4.E
    /// "exclusiveGateway"/"inclusiveGateway" condition evaluation).
    fn variable_scope(&self, token: &Token) -> Value {
        let mut map = std::collections::BTreeMap::new();
        if let Ok(Some(instance)) = self.gateway.get_instance(token.instance_id.as_str()) {
            map.extend(instance.variables);
        }
        map.extend(token.variables.clone());
        Value::Map(map)
    }

    fn merge_into_instance(&self, instance_id: &InstanceId, variables: &VariableMap, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        if variables.is_empty() {
            return Ok(());
        }
        if let Some(mut instance) = self.gateway.get_instance(instance_id.as_str())? {
            merge_variables(&mut instance.variables, variables);
            instance.updated_at = now;
            self.gateway.save_instance(&instance)?;
        }
        Ok(())
    }

    fn open_incident_for(&self, filter: IncidentFilter) -> Result<IncidentId, ExecutorError> {
        self.incident_store
            .list(&filter)?
            .into_iter()
            .max_by_key(|i| i.created_at)
            .map(|i| i.incident_id)
            .ok_or_else(|| ExecutorError::IncidentNotFound("no matching open incident".to_string()))
    }

    fn cancel_token(&self, token: &Token, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let mut token = token.clone();
        self.release_wait_handle(&token);
        token.terminate(TokenState::Canceled, now);
        self.gateway.save_token(&token)?;
        Ok(())
    }

    /// Cancel any boundary timer/message catchers still attached to
    /// `activity`'s token once it leaves play (normal completion or an
    /// interrupting boundary/error match) — otherwise they'd sit parked
    /// forever with nothing left to interrupt.
    fn cancel_sibling_boundary_catchers(&self, def: &ProcessDefinition, host: &Token, activity: &ElementRecord, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let boundary_ids: std::collections::HashSet<&str> =
            def.boundary_events_for(&activity.id).into_iter().map(|b| b.id.as_str()).collect();
        if boundary_ids.is_empty() {
            return Ok(());
        }
        for catcher in self.gateway.list_tokens_by_instance(host.instance_id.as_str())? {
            if catcher.parent_token_id.as_ref() == Some(&host.token_id)
                && boundary_ids.contains(catcher.current_element_id.as_str())
                && matches!(catcher.state, TokenState::Active | TokenState::Waiting)
            {
                self.cancel_token(&catcher, now)?;
            }
        }
        Ok(())
    }

    /// `token` has exactly one outgoing flow (start events, tasks, catch
    /// events resuming, throw events, boundary events firing).
    fn advance_single_outgoing(&self, def: &ProcessDefinition, mut token: Token, element: &ElementRecord, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let Some(flow_id) = element.outgoing.first().cloned() else {
            token.terminate(TokenState::Completed, now);
            self.gateway.save_token(&token)?;
            return Ok(vec![]);
        };
        self.move_token_across_flow(def, token, &flow_id, now)
    }

    /// Advance `token` across `flow_id`. If the target is a join gateway
    /// (more than one incoming flow), route straight into `exec_join`
    /// instead of dispatching a generic continuation — the arriving
    /// flow id only survives this one call, and the join needs it.
    fn move_token_across_flow(&self, def: &ProcessDefinition, mut token: Token, flow_id: &str, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let flow = graph::flow(def, flow_id)?;
        let target_id = flow.target.clone();
        let target = graph::element(def, &target_id)?;
        if graph::is_join_gateway(target) {
            return self.exec_join(def, token, &target_id, flow_id, now);
        }
        token.advance_to(target_id, now);
        self.gateway.save_token(&token)?;
        Ok(vec![(token.token_id.clone(), SchedulerReason::SignalReady { variables: VariableMap::new() })])
    }

    /// A token's arrival at a join: merge its variables onto the instance
    /// scope, destroy it, and record the arrival (§4.E parallelGateway/
    /// inclusiveGateway join semantics).
    fn exec_join(&self, def: &ProcessDefinition, arriving: Token, join_id: &str, flow_id: &str, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let instance_id = arriving.instance_id.clone();
        let parent_token_id = arriving.token_id.clone();
        let arriving_vars = arriving.variables.clone();

        let mut arriving = arriving;
        arriving.terminate(TokenState::Completed, now);
        self.gateway.save_token(&arriving)?;

        self.merge_into_instance(&instance_id, &arriving_vars, now)?;
        self.record_join_arrival(def, &instance_id, join_id, flow_id, Some(parent_token_id), now)
    }

    /// Record one arrival at `join_id`, creating its `JoinState` on first
    /// arrival (falling back to the element's full `incoming` set if no
    /// fork pre-registered a narrower requirement). Once satisfied, spawn
    /// the single merged continuation token.
    fn record_join_arrival(
        &self,
        def: &ProcessDefinition,
        instance_id: &InstanceId,
        join_id: &str,
        flow_id: &str,
        parent_token_id: Option<TokenId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEvent>, ExecutorError> {
        let join_state_id = JoinState::composite_id(instance_id, join_id);
        let mut state = match self.gateway.get_join_state(join_state_id.as_str())? {
            Some(state) => state,
            None => {
                let element = graph::element(def, join_id)?;
                let required: std::collections::BTreeSet<FlowId> = element.incoming.iter().cloned().collect();
                JoinState::new(instance_id.clone(), join_id.to_string(), required, now)
            }
        };
        let satisfied = state.arrive(flow_id);
        self.gateway.save_join_state(&state)?;
        if !satisfied {
            return Ok(vec![]);
        }
        self.gateway.delete_join_state(join_state_id.as_str())?;

        let instance_vars = self.gateway.get_instance(instance_id.as_str())?.map(|i| i.variables).unwrap_or_default();
        let mut merged = Token::new_at(instance_id.clone(), join_id.to_string(), parent_token_id, now);
        merged.variables = instance_vars;
        self.gateway.save_token(&merged)?;
        Ok(vec![(merged.token_id.clone(), SchedulerReason::SignalReady { variables: VariableMap::new() })])
    }

    /// Fork into every flow in `activated`: pre-register join requirements
    /// for whichever joins those branches reach, destroy the forking
    /// token, and spawn one child per branch (§4.E parallelGateway,
    /// inclusiveGateway after condition evaluation).
    fn exec_gateway_fork(&self, def: &ProcessDefinition, token: Token, activated: Vec<FlowId>, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let instance_id = token.instance_id.clone();
        let variables = token.variables.clone();
        let parent_token_id = token.token_id.clone();

        let requirements = graph::resolve_join_requirements(def, &activated);
        for (join_id, required) in &requirements {
            let join_state_id = JoinState::composite_id(&instance_id, join_id);
            if self.gateway.get_join_state(join_state_id.as_str())?.is_none() {
                let state = JoinState::new(instance_id.clone(), join_id.clone(), required.clone(), now);
                self.gateway.save_join_state(&state)?;
            }
        }

        let mut forking = token;
        forking.terminate(TokenState::Completed, now);
        self.gateway.save_token(&forking)?;

        let mut continuations = Vec::new();
        for flow_id in activated {
            let flow = graph::flow(def, &flow_id)?;
            let target = graph::element(def, &flow.target)?.clone();
            if graph::is_join_gateway(&target) {
                self.merge_into_instance(&instance_id, &variables, now)?;
                let joined = self.record_join_arrival(def, &instance_id, &target.id, &flow_id, Some(parent_token_id.clone()), now)?;
                continuations.extend(joined);
            } else {
                let mut child = Token::new_at(instance_id.clone(), target.id.clone(), Some(parent_token_id.clone()), now);
                child.variables = variables.clone();
                self.gateway.save_token(&child)?;
                continuations.push((child.token_id.clone(), SchedulerReason::SignalReady { variables: VariableMap::new() }));
            }
        }
        Ok(continuations)
    }

    // ---- element-specific handlers ----

    fn exec_end_event(&self, mut token: Token, terminate: bool, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let instance_id = token.instance_id.clone();
        if terminate {
            for sibling in self.gateway.list_tokens_by_instance(instance_id.as_str())? {
                if sibling.token_id != token.token_id && matches!(sibling.state, TokenState::Active | TokenState::Waiting) {
                    self.cancel_token(&sibling, now)?;
                }
            }
        }
        token.terminate(TokenState::Completed, now);
        self.gateway.save_token(&token)?;

        let remaining = self
            .gateway
            .list_tokens_by_instance(instance_id.as_str())?
            .into_iter()
            .any(|t| matches!(t.state, TokenState::Active | TokenState::Waiting));
        if !remaining {
            if let Some(mut instance) = self.gateway.get_instance(instance_id.as_str())? {
                if !instance.state.is_terminal() {
                    instance.finish(InstanceState::Completed, now);
                    self.gateway.save_instance(&instance)?;
                }
            }
            self.locks.forget(&instance_id);
        }
        Ok(vec![])
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_service_task(
        &self,
        def: &ProcessDefinition,
        mut token: Token,
        element: &ElementRecord,
        job_type: &str,
        retries: u32,
        was_waiting: bool,
        reason: &SchedulerReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEvent>, ExecutorError> {
        if !was_waiting {
            let job = self.jobs.create(
                NewJob {
                    job_type: job_type.to_string(),
                    process_instance_id: token.instance_id.clone(),
                    element_id: element.id.clone(),
                    token_id: token.token_id.clone(),
                    variables: token.variables.clone(),
                    custom_headers: VariableMap::new(),
                    max_retries: retries,
                },
                now,
            )?;
            self.install_boundary_catchers(def, &token, element, now)?;
            token.park(WaitHandle::Job(job.job_key.to_string()), now);
            self.gateway.save_token(&token)?;
            return Ok(vec![]);
        }

        let SchedulerReason::JobCallback(cb) = reason else {
            return Ok(vec![]);
        };
        match cb.status {
            JobStatus::Completed => {
                if let Some(vars) = &cb.variables {
                    merge_variables(&mut token.variables, vars);
                }
                self.cancel_sibling_boundary_catchers(def, &token, element, now)?;
                self.advance_single_outgoing(def, token, element, now)
            }
            JobStatus::Failed => {
                let incident_id = self.open_incident_for(IncidentFilter {
                    status: Some(IncidentStatus::Open),
                    incident_type: Some(IncidentType::JobFailure),
                    job_key: Some(cb.job_key.clone()),
                    ..Default::default()
                })?;
                token.park(WaitHandle::Incident(incident_id.to_string()), now);
                self.gateway.save_token(&token)?;
                Ok(vec![])
            }
            JobStatus::ErrorThrown => {
                if let Some(vars) = &cb.variables {
                    merge_variables(&mut token.variables, vars);
                }
                let error_code = cb.error_code.clone().unwrap_or_default();
                let matched = def.boundary_events_for(&element.id).into_iter().find(|b| {
                    matches!(&b.element_type, ElementType::BoundaryEvent { error_ref: Some(code), .. } if code == &error_code)
                });
                match matched {
                    Some(boundary) => {
                        let boundary_id = boundary.id.clone();
                        let outgoing = boundary.outgoing.first().cloned();
                        self.cancel_sibling_boundary_catchers(def, &token, element, now)?;
                        token.terminate(TokenState::Canceled, now);
                        self.gateway.save_token(&token)?;
                        let Some(flow_id) = outgoing else { return Ok(vec![]) };
                        let mut caught = Token::new_at(token.instance_id.clone(), boundary_id, Some(token.token_id.clone()), now);
                        caught.variables = token.variables.clone();
                        self.gateway.save_token(&caught)?;
                        self.move_token_across_flow(def, caught, &flow_id, now)
                    }
                    None => {
                        let incident_id = self.raise_incident(
                            NewIncident::new(IncidentType::BpmnError, cb.error_message.clone().unwrap_or_default())
                                .instance(token.instance_id.clone())
                                .element(element.id.clone())
                                .token(token.token_id.clone()),
                            now,
                        )?;
                        token.park(WaitHandle::Incident(incident_id.to_string()), now);
                        self.gateway.save_token(&token)?;
                        Ok(vec![])
                    }
                }
            }
            _ => Ok(vec![]),
        }
    }

    fn exec_user_task(&self, def: &ProcessDefinition, mut token: Token, element: &ElementRecord, was_waiting: bool, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        if !was_waiting {
            token.park(WaitHandle::UserTask, now);
            self.gateway.save_token(&token)?;
            return Ok(vec![]);
        }
        self.advance_single_outgoing(def, token, element, now)
    }

    fn exec_exclusive_gateway(&self, def: &ProcessDefinition, mut token: Token, element: &ElementRecord, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let scope = self.variable_scope(&token);
        let mut chosen = None;
        let mut default_flow = None;
        for flow_id in &element.outgoing {
            let flow = graph::flow(def, flow_id)?;
            if flow.is_default {
                default_flow = Some(flow_id.clone());
                continue;
            }
            match graph::flow_condition_true(self.evaluator.as_ref(), flow, &scope) {
                Ok(true) => {
                    chosen = Some(flow_id.clone());
                    break;
                }
                Ok(false) => continue,
                Err(err) => {
                    let incident_id = self.raise_incident(
                        NewIncident::new(IncidentType::ExpressionError, err.to_string())
                            .instance(token.instance_id.clone())
                            .element(element.id.clone())
                            .token(token.token_id.clone()),
                        now,
                    )?;
                    token.park(WaitHandle::Incident(incident_id.to_string()), now);
                    self.gateway.save_token(&token)?;
                    return Ok(vec![]);
                }
            }
        }
        let Some(flow_id) = chosen.or(default_flow) else {
            let incident_id = self.raise_incident(
                NewIncident::new(
                    IncidentType::ExpressionError,
                    format!("no flow condition was true and no default flow exists at exclusive gateway {}", element.id),
                )
                .instance(token.instance_id.clone())
                .element(element.id.clone())
                .token(token.token_id.clone()),
                now,
            )?;
            token.park(WaitHandle::Incident(incident_id.to_string()), now);
            self.gateway.save_token(&token)?;
            return Ok(vec![]);
        };
        self.move_token_across_flow(def, token, &flow_id, now)
    }

    fn exec_inclusive_gateway(&self, def: &ProcessDefinition, mut token: Token, element: &ElementRecord, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let scope = self.variable_scope(&token);
        let mut activated = Vec::new();
        let mut default_flow = None;
        for flow_id in &element.outgoing {
            let flow = graph::flow(def, flow_id)?;
            if flow.is_default {
                default_flow = Some(flow_id.clone());
                continue;
            }
            match graph::flow_condition_true(self.evaluator.as_ref(), flow, &scope) {
                Ok(true) => activated.push(flow_id.clone()),
                Ok(false) => {}
                Err(err) => {
                    let incident_id = self.raise_incident(
                        NewIncident::new(IncidentType::ExpressionError, err.to_string())
                            .instance(token.instance_id.clone())
                            .element(element.id.clone())
                            .token(token.token_id.clone()),
                        now,
                    )?;
                    token.park(WaitHandle::Incident(incident_id.to_string()), now);
                    self.gateway.save_token(&token)?;
                    return Ok(vec![]);
                }
            }
        }
        if activated.is_empty() {
            if let Some(flow_id) = default_flow {
                activated.push(flow_id);
            }
        }
        if activated.is_empty() {
            let incident_id = self.raise_incident(
                NewIncident::new(
                    IncidentType::ExpressionError,
                    format!("no flow condition was true and no default flow exists at inclusive gateway {}", element.id),
                )
                .instance(token.instance_id.clone())
                .element(element.id.clone())
                .token(token.token_id.clone()),
                now,
            )?;
            token.park(WaitHandle::Incident(incident_id.to_string()), now);
            self.gateway.save_token(&token)?;
            return Ok(vec![]);
        }
        self.exec_gateway_fork(def, token, activated, now)
    }

    fn exec_event_based_gateway(&self, def: &ProcessDefinition, token: Token, element: &ElementRecord, was_waiting: bool, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        if was_waiting {
            // The gateway element itself is only ever visited once, on
            // fork; its catchers live at the outgoing catch events.
            return Ok(vec![]);
        }

        let instance_id = token.instance_id.clone();
        let variables = token.variables.clone();
        let parent_token_id = token.token_id.clone();
        let race_id = GatewayRace::composite_id(&instance_id, &element.id);

        let mut siblings = Vec::new();
        for flow_id in &element.outgoing {
            let flow = graph::flow(def, flow_id)?;
            let target = graph::element(def, &flow.target)?.clone();
            let mut catcher = Token::new_at(instance_id.clone(), target.id.clone(), Some(parent_token_id.clone()), now);
            catcher.variables = variables.clone();
            catcher.variables.insert(RACE_MARKER_KEY.to_string(), Value::String(race_id.to_string()));

            let handle = match &target.element_type {
                ElementType::IntermediateCatchEvent { timer_definition: Some(timer_def), .. } => {
                    self.install_timer_catcher(&mut catcher, &target, timer_def, now)?;
                    catcher.waiting_for.clone().expect("timer catcher always parks")
                }
                ElementType::IntermediateCatchEvent { message_ref: Some(message_ref), .. } => {
                    self.install_message_catcher(def, &mut catcher, &target, message_ref, now)?;
                    catcher.waiting_for.clone().expect("message catcher always parks")
                }
                _ => {
                    return Err(ExecutorError::ElementNotFound(format!(
                        "event-based gateway outgoing {} is not a timer/message catch event",
                        target.id
                    )));
                }
            };
            siblings.push(RaceSibling { token_id: catcher.token_id.clone(), element_id: target.id.clone(), handle });
        }

        let race = GatewayRace::new(instance_id.clone(), element.id.clone(), siblings, now);
        self.gateway.save_gateway_race(&race)?;

        let mut forking = token;
        forking.terminate(TokenState::Completed, now);
        self.gateway.save_token(&forking)?;
        Ok(vec![])
    }

    fn exec_intermediate_catch(&self, def: &ProcessDefinition, mut token: Token, element: &ElementRecord, was_waiting: bool, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let ElementType::IntermediateCatchEvent { message_ref, timer_definition } = &element.element_type else {
            unreachable!("dispatched only for IntermediateCatchEvent elements")
        };

        if was_waiting {
            self.maybe_resolve_gateway_race(&token, now)?;
            token.variables.remove(RACE_MARKER_KEY);
            return self.advance_single_outgoing(def, token, element, now);
        }

        if let Some(timer_def) = timer_definition {
            self.install_timer_catcher(&mut token, element, timer_def, now)?;
        } else if let Some(message_ref) = message_ref {
            self.install_message_catcher(def, &mut token, element, message_ref, now)?;
        } else {
            return Err(ExecutorError::ElementNotFound(format!(
                "intermediateCatchEvent {} has neither a timer nor a message definition",
                element.id
            )));
        }
        Ok(vec![])
    }

    fn exec_boundary_fire(&self, def: &ProcessDefinition, token: Token, element: &ElementRecord, was_waiting: bool, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        if !was_waiting {
            // Catchers are installed directly by `install_boundary_catchers`;
            // a fresh arrival here would mean a token reached a boundary
            // event through a sequence flow, which the graph shape forbids.
            return Ok(vec![]);
        }
        let ElementType::BoundaryEvent { cancel_activity, .. } = &element.element_type else {
            unreachable!("dispatched only for BoundaryEvent elements")
        };
        if *cancel_activity {
            if let Some(parent_id) = token.parent_token_id.clone() {
                if let Some(host) = self.gateway.get_token(parent_id.as_str())? {
                    if matches!(host.state, TokenState::Active | TokenState::Waiting) {
                        self.cancel_token(&host, now)?;
                    }
                }
            }
        }
        self.advance_single_outgoing(def, token, element, now)
    }

    fn exec_throw_event(&self, def: &ProcessDefinition, token: Token, element: &ElementRecord, now: DateTime<Utc>) -> Result<Vec<InboxEvent>, ExecutorError> {
        let ElementType::IntermediateThrowEvent { message_ref } = &element.element_type else {
            unreachable!("dispatched only for IntermediateThrowEvent elements")
        };
        if let Some(message_ref) = message_ref {
            let message_name = def.resolve_message_name(message_ref).to_string();
            let correlation_key = self
                .variable_scope(&token)
                .get_path("correlationKey")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default();
            self.messages.publish(
                NewMessage {
                    name: message_name,
                    correlation_key,
                    variables: token.variables.clone(),
                    ttl: None,
                },
                now,
            )?;
        }
        self.advance_single_outgoing(def, token, element, now)
    }

    // ---- catcher installation ----

    /// Install a timer or message catcher for every boundary event
    /// attached to `activity`, skipping `error_ref` boundaries — those
    /// are matched synchronously against `JobStatus::ErrorThrown` instead
    /// of through an installed catcher.
    fn install_boundary_catchers(&self, def: &ProcessDefinition, host: &Token, activity: &ElementRecord, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        for boundary in def.boundary_events_for(&activity.id) {
            let ElementType::BoundaryEvent { timer_definition, message_ref, error_ref, .. } = &boundary.element_type else {
                continue;
            };
            if error_ref.is_some() {
                continue;
            }
            let mut catcher = Token::new_at(host.instance_id.clone(), boundary.id.clone(), Some(host.token_id.clone()), now);
            catcher.variables = host.variables.clone();
            if let Some(timer_def) = timer_definition {
                self.install_timer_catcher(&mut catcher, boundary, timer_def, now)?;
            } else if let Some(message_ref) = message_ref {
                self.install_message_catcher(def, &mut catcher, boundary, message_ref, now)?;
            }
        }
        Ok(())
    }

    fn install_timer_catcher(&self, token: &mut Token, element: &ElementRecord, timer_def: &TimerDefinition, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        match self.timewheel.add(
            NewTimer {
                element_id: element.id.clone(),
                process_instance_id: token.instance_id.clone(),
                token_id: token.token_id.clone(),
                timer_type: timer_def.kind,
                expression: timer_def.expression.clone(),
            },
            now,
        ) {
            Ok(record) => {
                token.park(WaitHandle::Timer(record.timer_id.to_string()), now);
                self.gateway.save_token(token)?;
                Ok(())
            }
            Err(TimerError::InvalidExpression { .. }) => {
                let incident_id = self.open_incident_for(IncidentFilter {
                    status: Some(IncidentStatus::Open),
                    incident_type: Some(IncidentType::TimerError),
                    instance_id: Some(token.instance_id.clone()),
                    element_id: Some(element.id.clone()),
                    ..Default::default()
                })?;
                token.park(WaitHandle::Incident(incident_id.to_string()), now);
                self.gateway.save_token(token)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Park `token` on the message handle *before* subscribing: if
    /// `MessageBus::subscribe` finds a matching buffered message it
    /// delivers synchronously within that call, reloading and resuming
    /// whatever is already persisted for this token. Parking first means
    /// that synchronous resume always finds the right `waiting_for` tag.
    fn install_message_catcher(&self, def: &ProcessDefinition, token: &mut Token, element: &ElementRecord, message_ref: &str, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let message_name = def.resolve_message_name(message_ref).to_string();
        let correlation_key = def.messages.get(message_ref).and_then(|m| m.correlation_key.clone());

        token.park(WaitHandle::Message(message_name.clone()), now);
        self.gateway.save_token(token)?;

        self.messages.subscribe(
            NewSubscription {
                process_definition_key: def.process_key(),
                element_id: element.id.clone(),
                message_name,
                correlation_key,
                token_id: Some(token.token_id.clone()),
            },
            now,
        )?;
        Ok(())
    }

    /// If `token` is the winner of an event-based-gateway race, cancel
    /// every sibling's timer/subscription/token and drop the race record.
    fn maybe_resolve_gateway_race(&self, token: &Token, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let Some(Value::String(race_id)) = token.variables.get(RACE_MARKER_KEY) else {
            return Ok(());
        };
        let Some(race) = self.gateway.get_gateway_race(race_id)? else {
            return Ok(());
        };
        for loser in race.losers(&token.token_id) {
            match &loser.handle {
                WaitHandle::Timer(timer_id) => {
                    let _ = self.timewheel.cancel(timer_id);
                }
                WaitHandle::Message(_) => {
                    if let Ok(subs) = self.gateway.list_all_subscriptions() {
                        for sub in subs {
                            if sub.is_active && sub.token_id.as_ref() == Some(&loser.token_id) {
                                let _ = self.messages.unsubscribe(sub.subscription_id.as_str());
                            }
                        }
                    }
                }
                WaitHandle::Job(_) | WaitHandle::UserTask | WaitHandle::Incident(_) => {}
            }
            if let Some(mut loser_token) = self.gateway.get_token(loser.token_id.as_str())? {
                loser_token.terminate(TokenState::Canceled, now);
                self.gateway.save_token(&loser_token)?;
            }
        }
        self.gateway.delete_gateway_race(race.race_id.as_str())?;
        Ok(())
    }
}
