//! Structural validation of a parsed [`ProcessGraph`]: reachability and
//! cycle checks over flat per-scope flow graphs.

use super::ir::{NodeKind, ProcessGraph};
use crate::error::{EngineError, Result};
use std::collections::{BTreeSet, VecDeque};

pub fn validate(graph: &ProcessGraph) -> Result<()> {
    check_self_loops(graph)?;
    check_scopes_have_start_and_end(graph)?;
    check_reachability(graph)?;
    check_gateway_flows(graph)?;
    Ok(())
}

fn check_self_loops(graph: &ProcessGraph) -> Result<()> {
    for flow in graph.flows.values() {
        if flow.source == flow.target {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "sequenceFlow `{}` is a self-loop on node `{}`",
                flow.id, flow.source
            )));
        }
    }
    Ok(())
}

/// Every scope (the root process, plus each subprocess/transaction/event-subprocess)
/// must contain exactly one start event and at least one end event.
fn check_scopes_have_start_and_end(graph: &ProcessGraph) -> Result<()> {
    let mut scopes: BTreeSet<Option<String>> = BTreeSet::new();
    scopes.insert(None);
    for node in graph.nodes.values() {
        if matches!(
            node.kind,
            NodeKind::Subprocess { .. } | NodeKind::EventSubprocess { .. } | NodeKind::Transaction { .. }
        ) {
            scopes.insert(Some(node.id.clone()));
        }
    }

    for scope in &scopes {
        let scope_ref = scope.as_deref();
        let starts = graph
            .nodes
            .values()
            .filter(|n| n.parent_scope.as_deref() == scope_ref && matches!(n.kind, NodeKind::StartEvent { .. }))
            .count();
        let ends = graph
            .nodes
            .values()
            .filter(|n| n.parent_scope.as_deref() == scope_ref && matches!(n.kind, NodeKind::EndEvent { .. }))
            .count();

        let label = scope_ref.unwrap_or("<root>");
        if starts == 0 {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "scope `{label}` has no start event"
            )));
        }
        if starts > 1 {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "scope `{label}` has {starts} start events, expected exactly one"
            )));
        }
        if ends == 0 {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "scope `{label}` has no end event"
            )));
        }
    }
    Ok(())
}

/// BFS from each scope's start event over that scope's own flows. Nodes never
/// reached are dead code in the process — except boundary events (entered by
/// attachment, not sequence flow) and compensation-handler subprocesses
/// (entered only when compensation fires).
fn check_reachability(graph: &ProcessGraph) -> Result<()> {
    let mut scopes: BTreeSet<Option<String>> = BTreeSet::new();
    scopes.insert(None);
    for node in graph.nodes.values() {
        if matches!(
            node.kind,
            NodeKind::Subprocess { .. } | NodeKind::EventSubprocess { .. } | NodeKind::Transaction { .. }
        ) {
            scopes.insert(Some(node.id.clone()));
        }
    }

    for scope in &scopes {
        let scope_ref = scope.as_deref();
        let members: Vec<&str> = graph
            .nodes
            .values()
            .filter(|n| n.parent_scope.as_deref() == scope_ref)
            .map(|n| n.id.as_str())
            .collect();

        let start = match graph
            .nodes
            .values()
            .find(|n| n.parent_scope.as_deref() == scope_ref && matches!(n.kind, NodeKind::StartEvent { .. }))
        {
            Some(n) => n.id.as_str(),
            None => continue, // already reported by check_scopes_have_start_and_end
        };

        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        visited.insert(start);
        while let Some(current) = queue.pop_front() {
            for flow in graph.outgoing(current)? {
                if visited.insert(flow.target.as_str()) {
                    queue.push_back(flow.target.as_str());
                }
            }
        }

        for member in members {
            if visited.contains(member) {
                continue;
            }
            let node = graph.node(member)?;
            if matches!(node.kind, NodeKind::BoundaryEvent { .. }) {
                continue; // reached via attachment, not sequence flow
            }
            if matches!(node.kind, NodeKind::Subprocess { .. }) && is_compensation_handler(graph, member) {
                continue;
            }
            return Err(EngineError::ProcessGraphInvalid(format!(
                "node `{member}` is unreachable from its scope's start event"
            )));
        }
    }
    Ok(())
}

/// A subprocess/task is a compensation handler iff some compensation boundary
/// event or compensate-throw in the graph names it as the activity to run.
fn is_compensation_handler(graph: &ProcessGraph, node_id: &str) -> bool {
    use super::ir::EventDefinition;
    graph.nodes.values().any(|n| match &n.kind {
        NodeKind::BoundaryEvent {
            event_definition: EventDefinition::Compensation { .. },
            attached_to,
            ..
        } => attached_to == node_id,
        _ => false,
    })
}

/// Exclusive/inclusive gateways need at least one outgoing flow; parallel
/// gateways used as a join need at least one incoming flow.
fn check_gateway_flows(graph: &ProcessGraph) -> Result<()> {
    for node in graph.nodes.values() {
        if matches!(
            node.kind,
            NodeKind::ExclusiveGateway | NodeKind::InclusiveGateway | NodeKind::ParallelGateway
        ) && node.outgoing.is_empty()
        {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "gateway `{}` has no outgoing sequence flow",
                node.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parse_bpmn;

    fn wrap(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <process id="p1">
    {body}
  </process>
</definitions>"#
        )
    }

    #[test]
    fn rejects_self_loop() {
        let xml = wrap(
            r#"<startEvent id="s"/>
            <task id="t1"/>
            <endEvent id="e"/>
            <sequenceFlow id="f1" sourceRef="s" targetRef="t1"/>
            <sequenceFlow id="f2" sourceRef="t1" targetRef="t1"/>
            <sequenceFlow id="f3" sourceRef="t1" targetRef="e"/>"#,
        );
        let g = parse_bpmn(&xml).unwrap();
        assert!(validate(&g).is_err());
    }

    #[test]
    fn rejects_unreachable_node() {
        let xml = wrap(
            r#"<startEvent id="s"/>
            <task id="t1"/>
            <task id="orphan"/>
            <endEvent id="e"/>
            <sequenceFlow id="f1" sourceRef="s" targetRef="t1"/>
            <sequenceFlow id="f2" sourceRef="t1" targetRef="e"/>"#,
        );
        let g = parse_bpmn(&xml).unwrap();
        assert!(validate(&g).is_err());
    }

    #[test]
    fn accepts_gateway_loop() {
        let xml = wrap(
            r#"<startEvent id="s"/>
            <exclusiveGateway id="g" default="f_done"/>
            <task id="retry"/>
            <endEvent id="e"/>
            <sequenceFlow id="f1" sourceRef="s" targetRef="g"/>
            <sequenceFlow id="f_retry" sourceRef="g" targetRef="retry">
                <conditionExpression>${retry == true}</conditionExpression>
            </sequenceFlow>
            <sequenceFlow id="f_back" sourceRef="retry" targetRef="g"/>
            <sequenceFlow id="f_done" sourceRef="g" targetRef="e"/>"#,
        );
        let g = parse_bpmn(&xml).unwrap();
        assert!(validate(&g).is_ok());
    }
}
