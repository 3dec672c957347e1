use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::hash::content_hash_hex;

pub type ElementId = String;
pub type FlowId = String;

/// A `(process_id, version)` pair rendered as the gateway's primary key,
/// per §3.1: `"{process_id}:v{version}"`.
pub fn process_key(process_id: &str, version: u64) -> String {
    format!("{process_id}:v{version}")
}

/// Element kinds the executor dispatches on. New kinds are a new variant
/// plus a new entry in `bpmn_engine`'s dispatch table (Design Notes §9
/// "Polymorphism over element types") — never a new top-level type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ElementType {
    StartEvent {
        message_ref: Option<String>,
    },
    EndEvent {
        terminate: bool,
    },
    Task,
    ServiceTask {
        job_type: String,
        retries: u32,
    },
    UserTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    IntermediateCatchEvent {
        message_ref: Option<String>,
        timer_definition: Option<TimerDefinition>,
    },
    IntermediateThrowEvent {
        message_ref: Option<String>,
    },
    BoundaryEvent {
        attached_to_ref: ElementId,
        cancel_activity: bool,
        error_ref: Option<String>,
        timer_definition: Option<TimerDefinition>,
        message_ref: Option<String>,
    },
    SequenceFlow,
}

impl ElementType {
    pub fn name(&self) -> &'static str {
        match self {
            ElementType::StartEvent { .. } => "startEvent",
            ElementType::EndEvent { .. } => "endEvent",
            ElementType::Task => "task",
            ElementType::ServiceTask { .. } => "serviceTask",
            ElementType::UserTask => "userTask",
            ElementType::ExclusiveGateway => "exclusiveGateway",
            ElementType::ParallelGateway => "parallelGateway",
            ElementType::InclusiveGateway => "inclusiveGateway",
            ElementType::EventBasedGateway => "eventBasedGateway",
            ElementType::IntermediateCatchEvent { .. } => "intermediateCatchEvent",
            ElementType::IntermediateThrowEvent { .. } => "intermediateThrowEvent",
            ElementType::BoundaryEvent { .. } => "boundaryEvent",
            ElementType::SequenceFlow => "sequenceFlow",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    Duration,
    Date,
    Cycle,
}

/// Raw, unparsed timer expression carried on an element (§3.1, §6.1
/// `timerDefinition{type,expression}`). `bpmn-timewheel` parses
/// `expression` at schedule time per the ISO-8601 grammar in §4.B.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerDefinition {
    pub kind: TimerKind,
    pub expression: String,
}

/// One element in the normalized graph (§3.1, §6.1). Flows cross-reference
/// elements by string id only, never by in-memory pointer (Design Notes §9).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub id: ElementId,
    pub name: Option<String>,
    pub element_type: ElementType,
    pub incoming: Vec<FlowId>,
    pub outgoing: Vec<FlowId>,
}

/// A `sequenceFlow` entry (§3.1 `flows`). `condition` is a FEEL-or-literal
/// expression string evaluated by the out-of-scope expression evaluator
/// (§6.2); `None` means the flow is unconditional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub source: ElementId,
    pub target: ElementId,
    pub condition: Option<String>,
    /// Whether this flow is the gateway's default ("else") branch.
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDefinition {
    pub name: String,
    /// `zeebe:subscription`-style correlation key template (§4.E
    /// intermediateCatchEvent), literal or leading-`=` FEEL expression.
    pub correlation_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorDefinition {
    pub code: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub name: String,
}

/// An immutable, versioned process definition (§3.1).
///
/// Invariant: a `(process_id, version)` pair is never mutated after
/// creation. Reparsing identical content is meant to reuse the existing
/// version rather than mint a new one — but deciding that is the
/// responsibility of whatever assigns `version` before calling
/// `register_process` (a BPMN XML parser, typically). Nothing in this
/// workspace currently re-hashes an incoming definition and looks up
/// `list_process_versions` to enforce it: `save_process` persists
/// whatever `(process_id, version, content_hash)` it's handed.
/// `compute_content_hash` is provided for that caller to use, not called
/// from anywhere in this repo.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub process_id: String,
    pub version: u64,
    pub content_hash: String,
    pub elements: HashMap<ElementId, ElementRecord>,
    pub flows: HashMap<FlowId, Flow>,
    pub messages: HashMap<String, MessageDefinition>,
    pub errors: HashMap<String, ErrorDefinition>,
    pub signals: HashMap<String, SignalDefinition>,
}

impl ProcessDefinition {
    pub fn process_key(&self) -> String {
        process_key(&self.process_id, self.version)
    }

    /// Recompute the content hash for `process_id` over its elements and
    /// flows, in a stable (sorted-by-id) order so the same graph always
    /// hashes identically regardless of map iteration order.
    pub fn compute_content_hash(process_id: &str, elements_json: &str, flows_json: &str) -> String {
        content_hash_hex(&[process_id.as_bytes(), elements_json.as_bytes(), flows_json.as_bytes()])
    }

    /// Find the boundary events attached to `activity_id`, in definition
    /// order — used by §4.E serviceTask/userTask error and interrupt
    /// handling to locate attached catchers.
    pub fn boundary_events_for(&self, activity_id: &str) -> Vec<&ElementRecord> {
        self.elements
            .values()
            .filter(|el| matches!(&el.element_type, ElementType::BoundaryEvent { attached_to_ref, .. } if attached_to_ref == activity_id))
            .collect()
    }

    /// Resolve a message reference (literal `messageRef` or a name already
    /// present in the message table) to its canonical name, per §4.E
    /// intermediateCatchEvent.
    pub fn resolve_message_name<'a>(&'a self, message_ref: &'a str) -> &'a str {
        self.messages
            .get(message_ref)
            .map(|m| m.name.as_str())
            .unwrap_or(message_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_key_format() {
        assert_eq!(process_key("order-process", 3), "order-process:v3");
    }

    #[test]
    fn boundary_events_for_filters_by_attached_to() {
        let mut elements = HashMap::new();
        elements.insert(
            "task-1".to_string(),
            ElementRecord {
                id: "task-1".to_string(),
                name: None,
                element_type: ElementType::ServiceTask {
                    job_type: "email".to_string(),
                    retries: 3,
                },
                incoming: vec![],
                outgoing: vec![],
            },
        );
        elements.insert(
            "boundary-1".to_string(),
            ElementRecord {
                id: "boundary-1".to_string(),
                name: None,
                element_type: ElementType::BoundaryEvent {
                    attached_to_ref: "task-1".to_string(),
                    cancel_activity: true,
                    error_ref: Some("DENIED".to_string()),
                    timer_definition: None,
                    message_ref: None,
                },
                incoming: vec![],
                outgoing: vec![],
            },
        );
        let def = ProcessDefinition {
            process_id: "p".to_string(),
            version: 1,
            content_hash: "h".to_string(),
            elements,
            flows: HashMap::new(),
            messages: HashMap::new(),
            errors: HashMap::new(),
            signals: HashMap::new(),
        };

        let boundaries = def.boundary_events_for("task-1");
        assert_eq!(boundaries.len(), 1);
        assert_eq!(boundaries[0].id, "boundary-1");
        assert!(def.boundary_events_for("task-2").is_empty());
    }
}
