//! Event subprocess matching: find the event subprocess nested directly in
//! a scope whose start-event trigger matches a fired timer, message,
//! signal, or error.

use crate::graph::ir::{EventDefinition, Node, NodeKind, ProcessGraph};

#[derive(Clone, Copy, Debug)]
pub enum Trigger<'a> {
    Timer,
    Message { name: &'a str },
    Signal { name: &'a str },
    Error { code: Option<&'a str> },
}

pub fn matching_event_subprocess<'g>(
    graph: &'g ProcessGraph,
    scope_id: Option<&str>,
    trigger: Trigger<'_>,
) -> Option<&'g Node> {
    graph.event_subprocesses_in(scope_id).into_iter().find(|n| {
        let NodeKind::EventSubprocess { event_definition, .. } = &n.kind else {
            return false;
        };
        match (event_definition, trigger) {
            (EventDefinition::Timer { .. }, Trigger::Timer) => true,
            (EventDefinition::Message { name, .. }, Trigger::Message { name: want }) => name == want,
            (EventDefinition::Signal { name }, Trigger::Signal { name: want }) => name == want,
            (EventDefinition::Error { error_code: None }, Trigger::Error { .. }) => true,
            (EventDefinition::Error { error_code: Some(code) }, Trigger::Error { code: Some(want) }) => code == want,
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parse_bpmn;

    #[test]
    fn matches_message_event_subprocess_in_scope() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <message id="m1" name="CancelOrder"/>
  <process id="p1">
    <startEvent id="s"/>
    <task id="t1"/>
    <endEvent id="e"/>
    <sequenceFlow id="f1" sourceRef="s" targetRef="t1"/>
    <sequenceFlow id="f2" sourceRef="t1" targetRef="e"/>
    <subProcess id="evsub1" triggeredByEvent="true">
      <startEvent id="evstart">
        <messageEventDefinition messageRef="m1"/>
      </startEvent>
      <endEvent id="evend"/>
      <sequenceFlow id="ef1" sourceRef="evstart" targetRef="evend"/>
    </subProcess>
  </process>
</definitions>"#;
        let graph = parse_bpmn(xml).unwrap();
        let found = matching_event_subprocess(&graph, None, Trigger::Message { name: "CancelOrder" });
        assert_eq!(found.unwrap().id, "evsub1");

        let none = matching_event_subprocess(&graph, None, Trigger::Message { name: "Other" });
        assert!(none.is_none());
    }
}
