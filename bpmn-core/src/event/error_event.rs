//! Error propagation: find the boundary event (if any) that should claim an
//! error thrown out of an activity.

use crate::graph::ir::{EventDefinition, Node, NodeKind, ProcessGraph};

/// The nearest boundary error event attached to `activity_id` that matches
/// `error_code` (an exact match wins over a catch-all `None` boundary; if
/// several catch-alls exist, the first by node id is used — BPMN forbids
/// more than one anyway).
pub fn find_boundary_for_error<'g>(
    graph: &'g ProcessGraph,
    activity_id: &str,
    error_code: Option<&str>,
) -> Option<&'g Node> {
    let boundaries: Vec<&Node> = graph
        .boundary_events(activity_id)
        .into_iter()
        .filter(|n| matches!(&n.kind, NodeKind::BoundaryEvent { event_definition: EventDefinition::Error { .. }, .. }))
        .collect();

    let exact = boundaries.iter().find(|n| match &n.kind {
        NodeKind::BoundaryEvent {
            event_definition: EventDefinition::Error { error_code: Some(code) },
            ..
        } => Some(code.as_str()) == error_code,
        _ => false,
    });
    if let Some(n) = exact {
        return Some(n);
    }

    boundaries
        .into_iter()
        .find(|n| matches!(&n.kind, NodeKind::BoundaryEvent { event_definition: EventDefinition::Error { error_code: None }, .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parse_bpmn;

    fn graph_with_boundary(error_ref_attr: &str) -> ProcessGraph {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <error id="err1" errorCode="INSUFFICIENT_FUNDS"/>
  <process id="p1">
    <startEvent id="s"/>
    <task id="t1"/>
    <endEvent id="e"/>
    <boundaryEvent id="b1" attachedToRef="t1">
      <errorEventDefinition {error_ref_attr}/>
    </boundaryEvent>
    <task id="handler"/>
    <endEvent id="e2"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="t1"/>
    <sequenceFlow id="f2" sourceRef="t1" targetRef="e"/>
    <sequenceFlow id="f3" sourceRef="b1" targetRef="handler"/>
    <sequenceFlow id="f4" sourceRef="handler" targetRef="e2"/>
  </process>
</definitions>"#
        );
        parse_bpmn(&xml).unwrap()
    }

    #[test]
    fn matches_exact_error_code() {
        let graph = graph_with_boundary(r#"errorRef="err1""#);
        let boundary = find_boundary_for_error(&graph, "t1", Some("INSUFFICIENT_FUNDS")).unwrap();
        assert_eq!(boundary.id, "b1");
    }

    #[test]
    fn catch_all_matches_any_code() {
        let graph = graph_with_boundary("");
        let boundary = find_boundary_for_error(&graph, "t1", Some("ANYTHING")).unwrap();
        assert_eq!(boundary.id, "b1");
    }

    #[test]
    fn no_boundary_returns_none() {
        let graph = graph_with_boundary(r#"errorRef="err1""#);
        assert!(find_boundary_for_error(&graph, "nonexistent", Some("X")).is_none());
    }
}
