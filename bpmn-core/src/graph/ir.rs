//! The process graph: an immutable, validated in-memory representation of a
//! parsed BPMN process. Node and Flow are sealed once the parser finishes;
//! nothing downstream mutates them.

use crate::error::{EngineError, Result};
use crate::types::{FlowId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    Duration,
    Date,
    Cycle,
}

/// The event definition attached to an intermediate or boundary event, or to
/// a timer/message start event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventDefinition {
    None,
    Timer {
        kind: TimerKind,
        /// Raw ISO-8601 expression (`PT5M`, a timestamp, or `R3/PT1S`). Parsed
        /// lazily when the timer is armed — malformed text surfaces as
        /// `TIMER_INVALID` at that point, not at parse time.
        expression: String,
    },
    Message {
        name: String,
        correlation_key: Option<String>,
    },
    Signal {
        name: String,
    },
    Error {
        /// `None` is a catch-all boundary.
        error_code: Option<String>,
    },
    Compensation {
        /// For an explicit compensation throw, the activity being compensated.
        /// `None` on a compensation boundary event (the activity is `attached_to`).
        activity_id: Option<String>,
    },
}

/// Node kind — one variant per BPMN element type this engine executes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    StartEvent {
        event_definition: EventDefinition,
    },
    EndEvent {
        terminate: bool,
        /// `EventDefinition::Error` marks this an end error event: reaching
        /// it throws a business error instead of completing normally.
        event_definition: EventDefinition,
    },
    IntermediateEvent {
        event_definition: EventDefinition,
        timeout_ms: Option<u64>,
    },
    Task,
    ScriptTask {
        script: String,
    },
    ServiceTask {
        task_type: String,
        properties: BTreeMap<String, String>,
    },
    ExclusiveGateway,
    InclusiveGateway,
    ParallelGateway,
    Subprocess {
        /// `parent_var -> subprocess_var` output mapping, applied on completion.
        output_vars: BTreeMap<String, String>,
    },
    EventSubprocess {
        event_definition: EventDefinition,
        interrupting: bool,
    },
    Transaction {
        output_vars: BTreeMap<String, String>,
        /// The id of this transaction's cancel end event, if it declares one.
        /// Reaching it (instead of the transaction's normal end event) runs
        /// reverse-order compensation over the transaction's own scope and
        /// exits without applying `output_vars`.
        cancel_end_event: Option<NodeId>,
    },
    BoundaryEvent {
        attached_to: NodeId,
        event_definition: EventDefinition,
        interrupting: bool,
        timeout_ms: Option<u64>,
    },
}

impl NodeKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            NodeKind::StartEvent { .. } => "StartEvent",
            NodeKind::EndEvent { .. } => "EndEvent",
            NodeKind::IntermediateEvent { .. } => "IntermediateEvent",
            NodeKind::Task => "Task",
            NodeKind::ScriptTask { .. } => "ScriptTask",
            NodeKind::ServiceTask { .. } => "ServiceTask",
            NodeKind::ExclusiveGateway => "ExclusiveGateway",
            NodeKind::InclusiveGateway => "InclusiveGateway",
            NodeKind::ParallelGateway => "ParallelGateway",
            NodeKind::Subprocess { .. } => "Subprocess",
            NodeKind::EventSubprocess { .. } => "EventSubprocess",
            NodeKind::Transaction { .. } => "Transaction",
            NodeKind::BoundaryEvent { .. } => "BoundaryEvent",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// The subprocess/transaction/event-subprocess node this element nests
    /// inside, if any. `None` is the root (top-level process) scope.
    pub parent_scope: Option<NodeId>,
    pub incoming: Vec<FlowId>,
    pub outgoing: Vec<FlowId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub source: NodeId,
    pub target: NodeId,
    pub condition: Option<String>,
    pub is_default: bool,
}

/// An immutable, validated process graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub nodes: BTreeMap<NodeId, Node>,
    pub flows: BTreeMap<FlowId, Flow>,
    pub start_node: NodeId,
}

impl ProcessGraph {
    pub fn node(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::NodeNotFound(id.to_string()))
    }

    pub fn flow(&self, id: &str) -> Result<&Flow> {
        self.flows
            .get(id)
            .ok_or_else(|| EngineError::FlowNotFound(id.to_string()))
    }

    pub fn outgoing(&self, node_id: &str) -> Result<Vec<&Flow>> {
        let node = self.node(node_id)?;
        Ok(node
            .outgoing
            .iter()
            .filter_map(|fid| self.flows.get(fid))
            .collect())
    }

    /// The unique StartEvent nested directly inside the given scope (the
    /// subprocess/transaction/event-subprocess node id).
    pub fn scope_start(&self, scope_id: &str) -> Result<&Node> {
        self.nodes
            .values()
            .find(|n| {
                n.parent_scope.as_deref() == Some(scope_id)
                    && matches!(n.kind, NodeKind::StartEvent { .. })
            })
            .ok_or_else(|| {
                EngineError::ProcessGraphInvalid(format!("scope {scope_id} has no start event"))
            })
    }

    /// All boundary events attached to the given activity node.
    pub fn boundary_events(&self, activity_id: &str) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(
                |n| matches!(&n.kind, NodeKind::BoundaryEvent { attached_to, .. } if attached_to == activity_id),
            )
            .collect()
    }

    /// All event-subprocesses nested directly inside the given scope.
    pub fn event_subprocesses_in(&self, scope_id: Option<&str>) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| {
                n.parent_scope.as_deref() == scope_id
                    && matches!(n.kind, NodeKind::EventSubprocess { .. })
            })
            .collect()
    }
}
