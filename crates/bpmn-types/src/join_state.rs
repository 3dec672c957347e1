use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, JoinStateId};
use crate::process::FlowId;

/// Tracks arrivals at a `parallelGateway`/`inclusiveGateway` join (§4.E
/// "track arrived incoming flow ids on a join-state record keyed by
/// `(instance_id, gateway_element_id)`"). `join_state_id` is the
/// deterministic composite `"{instance_id}:{gateway_element_id}"` so a
/// join always resolves to the same record without a secondary index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinState {
    pub join_state_id: JoinStateId,
    pub instance_id: InstanceId,
    pub gateway_element_id: String,
    pub required: BTreeSet<FlowId>,
    pub arrived: BTreeSet<FlowId>,
    pub created_at: DateTime<Utc>,
}

impl JoinState {
    pub fn composite_id(instance_id: &InstanceId, gateway_element_id: &str) -> JoinStateId {
        JoinStateId::from_raw(format!("{instance_id}:{gateway_element_id}"))
    }

    pub fn new(
        instance_id: InstanceId,
        gateway_element_id: impl Into<String>,
        required: BTreeSet<FlowId>,
        now: DateTime<Utc>,
    ) -> Self {
        let gateway_element_id = gateway_element_id.into();
        Self {
            join_state_id: Self::composite_id(&instance_id, &gateway_element_id),
            instance_id,
            gateway_element_id,
            required,
            arrived: BTreeSet::new(),
            created_at: now,
        }
    }

    /// Record an arrival; returns `true` once every required flow has
    /// arrived (join satisfied). Calling this again after satisfaction
    /// idempotently returns `true` without admitting new arrivals beyond
    /// the required set ("wait for exactly the forked set, never more").
    pub fn arrive(&mut self, flow_id: &str) -> bool {
        if self.required.contains(flow_id) {
            self.arrived.insert(flow_id.to_string());
        }
        self.is_satisfied()
    }

    pub fn is_satisfied(&self) -> bool {
        !self.required.is_empty() && self.required == self.arrived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_satisfied_only_once_every_required_flow_arrives() {
        let mut required = BTreeSet::new();
        required.insert("f1".to_string());
        required.insert("f2".to_string());
        let mut state = JoinState::new(InstanceId::generate(), "gw-1", required, Utc::now());

        assert!(!state.arrive("f1"));
        assert!(state.arrive("f2"));
    }

    #[test]
    fn arrival_outside_required_set_is_ignored() {
        let mut required = BTreeSet::new();
        required.insert("f1".to_string());
        let mut state = JoinState::new(InstanceId::generate(), "gw-1", required, Utc::now());

        assert!(!state.arrive("stray"));
        assert!(state.arrive("f1"));
    }

    #[test]
    fn composite_id_is_deterministic() {
        let instance_id = InstanceId::generate();
        let a = JoinState::composite_id(&instance_id, "gw-1");
        let b = JoinState::composite_id(&instance_id, "gw-1");
        assert_eq!(a, b);
    }
}
