//! Process-graph helpers shared by the element executors (§4.E).

use std::collections::{BTreeSet, HashMap};

use bpmn_types::{
    ElementId, ElementRecord, ElementType, ExpressionError, ExpressionEvaluator, Flow, FlowId,
    ProcessDefinition, Value,
};

use crate::error::ExecutorError;

pub fn element<'a>(def: &'a ProcessDefinition, element_id: &str) -> Result<&'a ElementRecord, ExecutorError> {
    def.elements.get(element_id).ok_or_else(|| ExecutorError::ElementNotFound(element_id.to_string()))
}

pub fn flow<'a>(def: &'a ProcessDefinition, flow_id: &str) -> Result<&'a Flow, ExecutorError> {
    def.flows.get(flow_id).ok_or_else(|| ExecutorError::ElementNotFound(flow_id.to_string()))
}

pub fn start_event(def: &ProcessDefinition) -> Option<&ElementRecord> {
    def.elements.values().find(|e| matches!(e.element_type, ElementType::StartEvent { .. }))
}

/// A parallel/inclusive gateway with more than one incoming flow is a
/// join (§4.E); with a single incoming flow it's just a pass-through fork
/// continuation and never waits for siblings.
pub fn is_join_gateway(element: &ElementRecord) -> bool {
    matches!(element.element_type, ElementType::ParallelGateway | ElementType::InclusiveGateway) && element.incoming.len() > 1
}

/// Evaluate a flow's condition (`None` is unconditional true) against
/// `scope`. A leading `=` marks a FEEL expression (§6.2 Design Notes);
/// anything else is passed to the evaluator verbatim.
pub fn flow_condition_true(
    evaluator: &dyn ExpressionEvaluator,
    flow: &Flow,
    scope: &Value,
) -> Result<bool, ExpressionError> {
    let Some(condition) = flow.condition.as_deref() else {
        return Ok(true);
    };
    let expr = condition.strip_prefix('=').unwrap_or(condition);
    let value = evaluator.evaluate(expr, scope)?;
    Ok(value.as_bool().unwrap_or(false))
}

/// Walk forward from `start_flow` across single-outgoing elements until
/// reaching one with more than one incoming flow — a join. Returns the
/// join element's id and the specific incoming flow this walk arrived
/// through. A fork doesn't carry an explicit reference to its matching
/// join (the element schema has none); the graph shape supplies it.
pub fn walk_to_join(def: &ProcessDefinition, start_flow: &str) -> Option<(ElementId, FlowId)> {
    let mut current_flow = start_flow.to_string();
    let mut steps = 0usize;
    loop {
        steps += 1;
        if steps > def.flows.len() + 1 {
            return None; // cyclic or malformed graph; caller treats this as "no join found"
        }
        let f = def.flows.get(&current_flow)?;
        let target = def.elements.get(&f.target)?;
        if target.incoming.len() > 1 {
            return Some((target.id.clone(), current_flow));
        }
        current_flow = target.outgoing.first()?.clone();
    }
}

/// For a fork that activated `activated_outgoing`, compute the required
/// incoming-flow set per join element those branches reach (§4.E
/// parallelGateway/inclusiveGateway join semantics — the join fires once
/// a token has arrived on every flow its matching fork actually took).
pub fn resolve_join_requirements(
    def: &ProcessDefinition,
    activated_outgoing: &[FlowId],
) -> HashMap<ElementId, BTreeSet<FlowId>> {
    let mut out: HashMap<ElementId, BTreeSet<FlowId>> = HashMap::new();
    for flow_id in activated_outgoing {
        if let Some((join_id, incoming_flow)) = walk_to_join(def, flow_id) {
            out.entry(join_id).or_default().insert(incoming_flow);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmn_types::{ElementRecord, Flow};
    use std::collections::HashMap as StdHashMap;

    fn element_record(id: &str, element_type: ElementType, incoming: &[&str], outgoing: &[&str]) -> ElementRecord {
        ElementRecord {
            id: id.to_string(),
            name: None,
            element_type,
            incoming: incoming.iter().map(|s| s.to_string()).collect(),
            outgoing: outgoing.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn flow_record(id: &str, source: &str, target: &str) -> Flow {
        Flow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            is_default: false,
        }
    }

    /// fork --f1--> a --fa--> join   and   fork --f2--> b --fb--> join
    fn diamond() -> ProcessDefinition {
        let mut elements = StdHashMap::new();
        elements.insert(
            "fork".to_string(),
            element_record("fork", ElementType::ParallelGateway, &["in"], &["f1", "f2"]),
        );
        elements.insert("a".to_string(), element_record("a", ElementType::Task, &["f1"], &["fa"]));
        elements.insert("b".to_string(), element_record("b", ElementType::Task, &["f2"], &["fb"]));
        elements.insert(
            "join".to_string(),
            element_record("join", ElementType::ParallelGateway, &["fa", "fb"], &["out"]),
        );

        let mut flows = StdHashMap::new();
        flows.insert("f1".to_string(), flow_record("f1", "fork", "a"));
        flows.insert("f2".to_string(), flow_record("f2", "fork", "b"));
        flows.insert("fa".to_string(), flow_record("fa", "a", "join"));
        flows.insert("fb".to_string(), flow_record("fb", "b", "join"));

        ProcessDefinition {
            process_id: "diamond".to_string(),
            version: 1,
            content_hash: "deadbeef".to_string(),
            elements,
            flows,
            messages: StdHashMap::new(),
            errors: StdHashMap::new(),
            signals: StdHashMap::new(),
        }
    }

    #[test]
    fn walk_to_join_finds_the_shared_join_through_an_intermediate_task() {
        let def = diamond();
        let (join_id, incoming_flow) = walk_to_join(&def, "f1").unwrap();
        assert_eq!(join_id, "join");
        assert_eq!(incoming_flow, "fa");
    }

    #[test]
    fn resolve_join_requirements_unions_both_branches_at_the_same_join() {
        let def = diamond();
        let required = resolve_join_requirements(&def, &["f1".to_string(), "f2".to_string()]);
        assert_eq!(required.len(), 1);
        let flows = &required["join"];
        assert!(flows.contains("fa"));
        assert!(flows.contains("fb"));
    }

    #[test]
    fn walk_to_join_gives_up_on_a_malformed_graph() {
        let mut def = diamond();
        // point "a"'s outgoing at itself, so the walk never reaches the join.
        def.elements.get_mut("a").unwrap().outgoing = vec!["fa".to_string()];
        def.flows.get_mut("fa").unwrap().target = "a".to_string();
        assert_eq!(walk_to_join(&def, "f1"), None);
    }
}
