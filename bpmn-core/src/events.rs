//! Durable audit trail ([`RuntimeEvent`]) and the in-process [`EventBus`] used
//! to notify waiting collaborators (timers firing, messages arriving) without
//! polling.

use crate::types::{InstanceId, NodeId, ScopeId, Variable};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

/// The durable, append-only audit trail for a process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: InstanceId,
        definition_id: String,
    },
    TokenCreated {
        token_id: Uuid,
        node_id: NodeId,
    },
    TokenMoved {
        token_id: Uuid,
        from_node: NodeId,
        to_node: NodeId,
    },
    TokenConsumed {
        token_id: Uuid,
        node_id: NodeId,
    },
    GatewayTaken {
        gateway_id: NodeId,
        flows_taken: Vec<String>,
    },
    JoinArrived {
        join_id: NodeId,
        path_id: String,
    },
    JoinSatisfied {
        join_id: NodeId,
    },
    TimerArmed {
        timer_id: String,
        node_id: NodeId,
        fires_at: chrono::DateTime<chrono::Utc>,
    },
    TimerFired {
        timer_id: String,
        node_id: NodeId,
    },
    MessageSubscribed {
        message_name: String,
        node_id: NodeId,
    },
    MessageReceived {
        message_name: String,
        node_id: NodeId,
        correlation_value: Option<Variable>,
    },
    SignalBroadcast {
        signal_name: String,
        matched_subscribers: usize,
    },
    ServiceTaskStarted {
        node_id: NodeId,
        task_type: String,
    },
    ServiceTaskCompleted {
        node_id: NodeId,
        task_type: String,
    },
    ServiceTaskFailed {
        node_id: NodeId,
        task_type: String,
        message: String,
    },
    BoundaryFired {
        boundary_id: NodeId,
        attached_to: NodeId,
        interrupting: bool,
    },
    SubprocessEntered {
        scope_id: ScopeId,
    },
    SubprocessCompleted {
        scope_id: ScopeId,
    },
    CompensationTriggered {
        scope_id: ScopeId,
        handler_count: usize,
    },
    CompensationHandlerRun {
        activity_id: String,
        handler_id: String,
        ok: bool,
    },
    TransactionCancelled {
        scope_id: ScopeId,
        reason: String,
    },
    SagaStepCompleted {
        saga_id: String,
        action_id: String,
    },
    SagaCompensating {
        saga_id: String,
        failed_step: String,
    },
    SagaCompleted {
        saga_id: String,
    },
    InstanceCompleted,
    InstanceErrored {
        error_kind: String,
        message: String,
    },
    VariableSet {
        scope_id: Option<ScopeId>,
        name: String,
        value: Json,
    },
}

/// In-process pub/sub used by collaborators that need to wake on an external
/// condition (a timer firing, a message arriving) instead of polling the
/// store. Routing keys follow a dotted event-name scheme (`process.started`,
/// `process.timer_triggered`, ...).
#[derive(Clone)]
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<(String, RuntimeEvent)>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, routing_key: impl Into<String>, event: RuntimeEvent) {
        // No receivers is the common case outside of active waits; ignore the error.
        let _ = self.sender.send((routing_key.into(), event));
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<(String, RuntimeEvent)> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
