//! Compensation handler registry and ordering. Registration and
//! the resulting run order are delegated to [`StateManager`]; this module is
//! the thin, typed front door the executor calls through, plus the lookup
//! that maps a compensation boundary/throw event to its target activity.

use crate::error::Result;
use crate::events::{EventBus, RuntimeEvent};
use crate::graph::ir::{EventDefinition, Node, NodeKind, ProcessGraph};
use crate::state::StateManager;
use crate::types::{CompensationHandlerEntry, InstanceId, ScopeId};
use std::sync::Arc;

pub struct CompensationScope {
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
}

impl CompensationScope {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub async fn register(
        &self,
        instance_id: InstanceId,
        activity_id: String,
        handler_id: String,
        scope_id: ScopeId,
        execution_order: Option<i32>,
    ) -> Result<()> {
        self.store
            .register_compensation_handler(CompensationHandlerEntry {
                instance_id,
                activity_id,
                handler_id,
                scope_id,
                execution_order,
                registered_seq: 0,
            })
            .await
    }

    /// Handlers registered for `scope_id`, in the order they should run
    /// (explicit `execution_order` else registration order). Compensation
    /// never crosses into a nested transaction's own scope — callers pass
    /// the scope that actually owns the handlers, not an ancestor.
    pub async fn handlers_for(
        &self,
        instance_id: InstanceId,
        scope_id: &ScopeId,
    ) -> Result<Vec<CompensationHandlerEntry>> {
        let handlers = self.store.compensation_handlers(instance_id, scope_id).await?;
        if !handlers.is_empty() {
            self.events.publish(
                "process.compensation_triggered",
                RuntimeEvent::CompensationTriggered {
                    scope_id: scope_id.clone(),
                    handler_count: handlers.len(),
                },
            );
        }
        Ok(handlers)
    }

    pub async fn clear(&self, instance_id: InstanceId, scope_id: &ScopeId) -> Result<()> {
        self.store.clear_compensation_handlers(instance_id, scope_id).await
    }

    pub fn note_ran(&self, activity_id: &str, handler_id: &str, ok: bool) {
        self.events.publish(
            "process.compensation_handler_run",
            RuntimeEvent::CompensationHandlerRun {
                activity_id: activity_id.to_string(),
                handler_id: handler_id.to_string(),
                ok,
            },
        );
    }
}

/// Resolve an explicit compensation throw event to the activity it targets,
/// or `None` for "compensate the current scope" (the implicit form).
pub fn explicit_target(node: &Node) -> Option<&str> {
    match &node.kind {
        NodeKind::IntermediateEvent {
            event_definition: EventDefinition::Compensation { activity_id },
            ..
        } => activity_id.as_deref(),
        _ => None,
    }
}

/// The compensation boundary event (if any) attached to an activity — this
/// boundary's own node id is the `handler_id` registered for that activity
/// when the activity completes.
pub fn compensation_boundary_for<'g>(graph: &'g ProcessGraph, activity_id: &str) -> Option<&'g Node> {
    graph
        .boundary_events(activity_id)
        .into_iter()
        .find(|n| matches!(&n.kind, NodeKind::BoundaryEvent { event_definition: EventDefinition::Compensation { .. }, .. }))
}
