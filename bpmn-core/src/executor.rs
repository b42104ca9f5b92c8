//! NodeExecutor / Executor: drives tokens across the graph until every one
//! settles at an end event or a wait state, dispatching on the full
//! `NodeKind` set.

use crate::error::{EngineError, Result};
use crate::event::event_subprocess::{matching_event_subprocess, Trigger};
use crate::event::{compensation, error_event, EventHandler};
use crate::events::{EventBus, RuntimeEvent};
use crate::expr;
use crate::gateway::GatewayHandler;
use crate::graph::ir::{EventDefinition, Node, NodeKind, ProcessGraph};
use crate::script::ScriptExecutor;
use crate::service::{ServiceTaskContext, ServiceTaskRegistry};
use crate::state::{JoinArrival, StateManager};
use crate::subprocess::SubprocessManager;
use crate::token::TokenManager;
use crate::types::{
    ActivityLogEntry, InstanceId, InstanceStatus, NodeId, ProcessInstanceRecord, ScopeId, Token,
    TokenState, Variable,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Executor {
    graph: Arc<ProcessGraph>,
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
    services: Arc<ServiceTaskRegistry>,
    tokens: TokenManager,
    event_handler: EventHandler,
    subprocesses: SubprocessManager,
}

impl Executor {
    pub fn new(
        graph: Arc<ProcessGraph>,
        store: Arc<dyn StateManager>,
        events: Arc<EventBus>,
        services: Arc<ServiceTaskRegistry>,
    ) -> Self {
        Self {
            graph,
            store: store.clone(),
            events: events.clone(),
            services,
            tokens: TokenManager::new(store.clone(), events.clone()),
            event_handler: EventHandler::new(store.clone(), events.clone()),
            subprocesses: SubprocessManager::new(store, events),
        }
    }

    pub async fn start_instance(&self, definition_id: &str) -> Result<InstanceId> {
        let instance_id = uuid::Uuid::now_v7();
        self.store
            .create_instance(&ProcessInstanceRecord {
                instance_id,
                definition_id: definition_id.to_string(),
                version: 1,
                status: InstanceStatus::Running,
                started_at: Utc::now(),
                ended_at: None,
            })
            .await?;
        self.events.publish(
            "process.started",
            RuntimeEvent::InstanceStarted {
                instance_id,
                definition_id: definition_id.to_string(),
            },
        );
        let token = self.tokens.create_initial_token(instance_id, &self.graph.start_node).await?;
        self.arm_event_subprocess_triggers(instance_id, None).await?;
        self.log(instance_id, Some(token.node_id.clone()), "instance_started", "").await?;
        self.run_to_completion(instance_id).await?;
        Ok(instance_id)
    }

    /// Repeatedly dispatch every `Active` token until none remain (each one
    /// settled at an end event, in a `Waiting` state for an external trigger,
    /// or the instance errored out).
    pub async fn run_to_completion(&self, instance_id: InstanceId) -> Result<()> {
        loop {
            let active: Vec<Token> = self
                .store
                .tokens_in_instance(instance_id)
                .await?
                .into_iter()
                .filter(|t| t.state == TokenState::Active)
                .collect();
            if active.is_empty() {
                break;
            }
            for token in active {
                if let Err(err) = self.dispatch(token.clone()).await {
                    self.handle_dispatch_error(&token, err).await?;
                }
            }
        }
        self.maybe_complete_instance(instance_id).await
    }

    /// Pull due timers for this instance and advance whichever tokens/scopes
    /// they unblock, then drain the resulting active tokens.
    pub async fn poll_timers(&self, instance_id: InstanceId) -> Result<()> {
        let due = self.event_handler.timers.take_due(Utc::now()).await?;
        for timer in due.into_iter().filter(|t| t.instance_id == instance_id) {
            self.fire_timer(instance_id, timer).await?;
        }
        self.run_to_completion(instance_id).await
    }

    /// Deliver a message: wake every correlated subscriber and drain each
    /// affected instance.
    pub async fn deliver_message(&self, message_name: &str, correlation_value: Option<&Variable>) -> Result<()> {
        let matches = self.event_handler.messages.publish(message_name, correlation_value).await?;
        for sub in matches {
            self.wake_waiting_token(sub.instance_id, &sub.node_id).await?;
            self.run_to_completion(sub.instance_id).await?;
        }
        Ok(())
    }

    /// Broadcast a signal: wake every current subscriber and drain each
    /// affected instance.
    pub async fn deliver_signal(&self, signal_name: &str) -> Result<()> {
        let matches = self.event_handler.signals.broadcast(signal_name).await?;
        for sub in matches {
            self.wake_waiting_token(sub.instance_id, &sub.node_id).await?;
            self.run_to_completion(sub.instance_id).await?;
        }
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────────

    async fn dispatch(&self, token: Token) -> Result<()> {
        let node = self.graph.node(&token.node_id)?.clone();
        match &node.kind {
            NodeKind::StartEvent { .. } => self.pass_through(&token, &node).await,
            NodeKind::EndEvent { event_definition, .. } => {
                if let EventDefinition::Error { error_code } = event_definition {
                    return Err(EngineError::ThrownError {
                        end_event_id: node.id.clone(),
                        error_code: error_code.clone(),
                    });
                }
                self.handle_end_event(&token, &node).await
            }
            NodeKind::Task => {
                self.arm_boundary_watches(token.instance_id, &node).await?;
                self.on_activity_completed(&token, &node).await?;
                self.pass_through(&token, &node).await
            }
            NodeKind::ScriptTask { script } => {
                self.arm_boundary_watches(token.instance_id, &node).await?;
                self.handle_script_task(&token, &node, script).await
            }
            NodeKind::ServiceTask { task_type, properties } => {
                self.arm_boundary_watches(token.instance_id, &node).await?;
                self.handle_service_task(&token, &node, task_type, properties).await
            }
            NodeKind::ExclusiveGateway => self.handle_exclusive_gateway(&token, &node).await,
            NodeKind::InclusiveGateway => self.handle_inclusive_gateway(&token, &node).await,
            NodeKind::ParallelGateway => self.handle_parallel_gateway(&token, &node).await,
            NodeKind::Subprocess { .. } | NodeKind::Transaction { .. } => self.handle_scope_entry(&token, &node).await,
            NodeKind::EventSubprocess { .. } => self.handle_end_event(&token, &node).await,
            NodeKind::IntermediateEvent { event_definition, timeout_ms } => {
                self.handle_intermediate_event(&token, &node, event_definition, *timeout_ms).await
            }
            NodeKind::BoundaryEvent { .. } => Err(EngineError::ProcessGraphInvalid(format!(
                "token reached boundary event `{}` directly; boundary events are only entered by attachment",
                node.id
            ))),
        }
    }

    async fn handle_dispatch_error(&self, token: &Token, err: EngineError) -> Result<()> {
        // A CAS loser: some concurrent mover (most commonly an interrupting
        // boundary event) already moved this token on. Not a process failure.
        if matches!(err, EngineError::TokenState { .. }) {
            return Ok(());
        }
        self.cancel_boundary_watches(token.instance_id, &token.node_id).await.ok();

        if !err.is_claimable() {
            return self.fail_instance(token.instance_id, &err).await;
        }

        if let Some(boundary) = error_event::find_boundary_for_error(&self.graph, &token.node_id, err.error_code()) {
            self.tokens.update_state(token.id, TokenState::Active, TokenState::Error).await.ok();
            return self.fire_boundary(token, boundary).await;
        }

        let scope_id = token.scope_id.clone();
        if let Some(event_subprocess) =
            matching_event_subprocess(&self.graph, scope_id.as_deref(), Trigger::Error { code: err.error_code() })
        {
            self.tokens.update_state(token.id, TokenState::Active, TokenState::Error).await.ok();
            return self.trigger_event_subprocess(token.instance_id, event_subprocess).await;
        }

        self.fail_instance(token.instance_id, &err).await
    }

    async fn fail_instance(&self, instance_id: InstanceId, err: &EngineError) -> Result<()> {
        self.store.update_instance_status(instance_id, InstanceStatus::Error).await?;
        self.events.publish(
            "process.error",
            RuntimeEvent::InstanceErrored {
                error_kind: err.kind().to_string(),
                message: err.to_string(),
            },
        );
        Err(err.clone())
    }

    // ── Token movement helpers ───────────────────────────────────

    /// Move a token across a known flow, stamping the flow it rode in on so
    /// a downstream parallel/inclusive join can tell which incoming path
    /// this arrival corresponds to.
    async fn advance(&self, token: &Token, flow_id: &str) -> Result<Token> {
        let flow = self.graph.flow(flow_id)?.clone();
        let moved = self.tokens.move_token(token, &flow.target, token.scope_id.clone()).await?;
        self.stamp_via_flow(moved, flow_id).await
    }

    async fn stamp_via_flow(&self, mut token: Token, flow_id: &str) -> Result<Token> {
        token.data.insert("via_flow".to_string(), serde_json::Value::String(flow_id.to_string()));
        self.store.put_token(&token).await?;
        Ok(token)
    }

    async fn split_and_stamp(&self, token: &Token, flow_ids: &[String]) -> Result<()> {
        let targets: Vec<(NodeId, Option<ScopeId>)> = flow_ids
            .iter()
            .map(|fid| self.graph.flow(fid).map(|f| (f.target.clone(), token.scope_id.clone())))
            .collect::<Result<_>>()?;
        let children = self.tokens.split_token(token, &targets).await?;
        for (child, flow_id) in children.into_iter().zip(flow_ids.iter()) {
            self.stamp_via_flow(child, flow_id).await?;
        }
        Ok(())
    }

    async fn pass_through(&self, token: &Token, node: &Node) -> Result<()> {
        let Some(flow_id) = node.outgoing.first().cloned() else {
            return Ok(());
        };
        self.advance(token, &flow_id).await?;
        Ok(())
    }

    async fn handle_end_event(&self, token: &Token, node: &Node) -> Result<()> {
        let _ = node;
        let Some(scope_id) = token.scope_id.clone() else {
            self.tokens.consume_token(token.id).await?;
            return Ok(());
        };

        let scope_node = self.graph.node(&scope_id)?.clone();
        if matches!(scope_node.kind, NodeKind::EventSubprocess { .. }) {
            self.tokens.consume_token(token.id).await?;
            self.store.clear_compensation_handlers(token.instance_id, &scope_id).await?;
            self.store.clear_scope(token.instance_id, scope_id).await?;
            return Ok(());
        }

        if let NodeKind::Transaction { cancel_end_event: Some(cancel_id), .. } = &scope_node.kind {
            if *cancel_id == token.node_id {
                return self.handle_transaction_cancel(token, &scope_node, scope_id).await;
            }
        }

        self.store.clear_compensation_handlers(token.instance_id, &scope_id).await?;
        let output_vars = scope_output_vars(&scope_node);
        match scope_node.outgoing.first().cloned() {
            Some(flow_id) => {
                let flow = self.graph.flow(&flow_id)?.clone();
                let exited = self
                    .subprocesses
                    .complete(token, scope_id, scope_node.parent_scope.clone(), &flow.target, &output_vars)
                    .await?;
                self.stamp_via_flow(exited, &flow_id).await?;
                Ok(())
            }
            None => {
                self.tokens.consume_token(token.id).await?;
                self.store.clear_scope(token.instance_id, scope_id).await?;
                Ok(())
            }
        }
    }

    /// A transaction's cancel end event fired: run reverse-order
    /// compensation over everything the transaction completed, discard the
    /// transaction's scope without applying its `output_vars` mapping (it
    /// didn't succeed), then exit on the transaction's own outgoing flow.
    async fn handle_transaction_cancel(&self, token: &Token, scope_node: &Node, scope_id: ScopeId) -> Result<()> {
        self.run_compensation(token.instance_id, &scope_id).await?;
        self.tokens.update_state(token.id, TokenState::Active, TokenState::Completed).await.ok();
        self.subprocesses
            .cancel_transaction(token.instance_id, scope_id.clone(), "internal cancel end event".to_string())
            .await?;
        match scope_node.outgoing.first().cloned() {
            Some(flow_id) => {
                let flow = self.graph.flow(&flow_id)?.clone();
                let exited = Token::new(token.instance_id, flow.target.clone(), scope_node.parent_scope.clone());
                self.store.create_token(&exited).await?;
                self.stamp_via_flow(exited, &flow_id).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn handle_script_task(&self, token: &Token, node: &Node, script: &str) -> Result<()> {
        let scope = self.scope_vars(token).await?;
        let outcome = ScriptExecutor::execute(script, &scope)?;
        for (name, value) in outcome.assignments {
            self.store.set_variable(token.instance_id, token.scope_id.clone(), &name, value).await?;
        }
        self.on_activity_completed(token, node).await?;
        self.pass_through(token, node).await
    }

    async fn handle_service_task(
        &self,
        token: &Token,
        node: &Node,
        task_type: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        let scope = self.scope_vars(token).await?;
        self.events.publish(
            "process.service_task_started",
            RuntimeEvent::ServiceTaskStarted {
                node_id: node.id.clone(),
                task_type: task_type.to_string(),
            },
        );
        let ctx = ServiceTaskContext {
            node_id: &node.id,
            properties,
            variables: &scope,
        };
        match self.services.execute(task_type, ctx).await {
            Ok(outputs) => {
                for (name, value) in outputs {
                    self.store.set_variable(token.instance_id, token.scope_id.clone(), &name, value).await?;
                }
                self.events.publish(
                    "process.service_task_completed",
                    RuntimeEvent::ServiceTaskCompleted {
                        node_id: node.id.clone(),
                        task_type: task_type.to_string(),
                    },
                );
                self.on_activity_completed(token, node).await?;
                self.pass_through(token, node).await
            }
            Err(err) => {
                self.events.publish(
                    "process.service_task_failed",
                    RuntimeEvent::ServiceTaskFailed {
                        node_id: node.id.clone(),
                        task_type: task_type.to_string(),
                        message: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    /// An activity completed without error: cancel any boundary watches
    /// still pending for it, and register its compensation handler (if any)
    /// for later use should the enclosing scope be compensated.
    async fn on_activity_completed(&self, token: &Token, node: &Node) -> Result<()> {
        self.cancel_boundary_watches(token.instance_id, &node.id).await?;
        if let Some(boundary) = compensation::compensation_boundary_for(&self.graph, &node.id) {
            self.event_handler
                .compensation
                .register(
                    token.instance_id,
                    node.id.clone(),
                    boundary.id.clone(),
                    token.scope_id.clone().unwrap_or_default(),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_exclusive_gateway(&self, token: &Token, node: &Node) -> Result<()> {
        let scope = self.scope_vars(token).await?;
        let outgoing = self.graph.outgoing(&node.id)?;
        let chosen = GatewayHandler::exclusive_split(node, &outgoing, &scope)?;
        self.events.publish(
            "process.gateway_taken",
            RuntimeEvent::GatewayTaken {
                gateway_id: node.id.clone(),
                flows_taken: vec![chosen.clone()],
            },
        );
        self.advance(token, &chosen).await?;
        Ok(())
    }

    async fn handle_inclusive_gateway(&self, token: &Token, node: &Node) -> Result<()> {
        let scope = self.scope_vars(token).await?;
        let outgoing = self.graph.outgoing(&node.id)?;
        let chosen = GatewayHandler::inclusive_split(node, &outgoing, &scope)?;
        self.events.publish(
            "process.gateway_taken",
            RuntimeEvent::GatewayTaken {
                gateway_id: node.id.clone(),
                flows_taken: chosen.clone(),
            },
        );
        self.split_and_stamp(token, &chosen).await
    }

    async fn handle_parallel_gateway(&self, token: &Token, node: &Node) -> Result<()> {
        if node.incoming.len() > 1 {
            self.store.register_join(token.instance_id, &node.id, &node.incoming).await?;
            let path_id = token
                .data
                .get("via_flow")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| node.incoming.first().cloned().unwrap_or_default());
            let arrival = self.store.join_arrive(token.instance_id, &node.id, &path_id).await?;
            self.tokens.consume_token(token.id).await?;
            if arrival != JoinArrival::Satisfied {
                return Ok(());
            }
            self.events.publish("process.join_satisfied", RuntimeEvent::JoinSatisfied { join_id: node.id.clone() });
            self.store.reset_join(token.instance_id, &node.id).await?;
            let fresh = Token::new(token.instance_id, node.id.clone(), token.scope_id.clone());
            self.store.create_token(&fresh).await?;
            return self.parallel_fan_out(&fresh, node).await;
        }
        self.parallel_fan_out(token, node).await
    }

    async fn parallel_fan_out(&self, token: &Token, node: &Node) -> Result<()> {
        let outgoing = self.graph.outgoing(&node.id)?;
        let taken = GatewayHandler::parallel_split(&outgoing);
        self.events.publish(
            "process.gateway_taken",
            RuntimeEvent::GatewayTaken {
                gateway_id: node.id.clone(),
                flows_taken: taken.clone(),
            },
        );
        self.split_and_stamp(token, &taken).await
    }

    async fn handle_scope_entry(&self, token: &Token, node: &Node) -> Result<()> {
        let scope_start = self.graph.scope_start(&node.id)?;
        self.subprocesses.enter(token, &node.id, &scope_start.id).await?;
        self.arm_event_subprocess_triggers(token.instance_id, Some(node.id.as_str())).await?;
        Ok(())
    }

    async fn handle_intermediate_event(
        &self,
        token: &Token,
        node: &Node,
        event_definition: &EventDefinition,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        match event_definition {
            EventDefinition::None => self.pass_through(token, node).await,
            EventDefinition::Timer { kind, expression } => {
                self.tokens.update_state(token.id, TokenState::Active, TokenState::Waiting).await?;
                self.event_handler
                    .timers
                    .arm(
                        token.instance_id,
                        node.id.clone(),
                        to_timer_type(kind.clone()),
                        expression,
                        None,
                        true,
                        token.data.clone(),
                    )
                    .await?;
                Ok(())
            }
            EventDefinition::Message { name, correlation_key } => {
                self.tokens.update_state(token.id, TokenState::Active, TokenState::Waiting).await?;
                let correlation_value = match correlation_key {
                    Some(expr_src) => {
                        let scope = self.scope_vars(token).await?;
                        Some(to_variable(expr::evaluate(expr_src, &scope)?))
                    }
                    None => None,
                };
                self.event_handler
                    .messages
                    .subscribe(token.instance_id, node.id.clone(), name.clone(), correlation_value)
                    .await?;
                if let Some(ms) = timeout_ms {
                    self.event_handler
                        .timers
                        .arm(
                            token.instance_id,
                            node.id.clone(),
                            crate::types::TimerType::Duration,
                            &format!("PT{:.3}S", ms as f64 / 1000.0),
                            None,
                            true,
                            BTreeMap::new(),
                        )
                        .await?;
                }
                Ok(())
            }
            EventDefinition::Signal { name } => {
                self.tokens.update_state(token.id, TokenState::Active, TokenState::Waiting).await?;
                self.event_handler.signals.subscribe(token.instance_id, node.id.clone(), name.clone()).await?;
                Ok(())
            }
            EventDefinition::Error { .. } => Err(EngineError::ProcessGraphInvalid(format!(
                "intermediate throw event `{}` cannot carry an errorEventDefinition",
                node.id
            ))),
            EventDefinition::Compensation { activity_id } => {
                let target = activity_id
                    .clone()
                    .or_else(|| token.scope_id.clone())
                    .unwrap_or_default();
                self.run_compensation(token.instance_id, &target).await?;
                self.pass_through(token, node).await
            }
        }
    }

    async fn run_compensation(&self, instance_id: InstanceId, scope_id: &ScopeId) -> Result<()> {
        let handlers = self.event_handler.compensation.handlers_for(instance_id, scope_id).await?;
        for handler in handlers {
            let ok = self.run_one_compensation_handler(instance_id, scope_id, &handler.handler_id).await.is_ok();
            self.event_handler.compensation.note_ran(&handler.activity_id, &handler.handler_id, ok);
        }
        self.event_handler.compensation.clear(instance_id, scope_id).await
    }

    /// `boundary_id` is the compensation boundary event's own node id; its
    /// single outgoing flow leads to the activity that performs the undo.
    async fn run_one_compensation_handler(&self, instance_id: InstanceId, scope_id: &ScopeId, boundary_id: &str) -> Result<()> {
        let boundary = self.graph.node(boundary_id)?;
        let Some(flow_id) = boundary.outgoing.first() else {
            return Ok(());
        };
        let flow = self.graph.flow(flow_id)?;
        let handler_node = self.graph.node(&flow.target)?.clone();
        match &handler_node.kind {
            NodeKind::ServiceTask { task_type, properties } => {
                let scope = self.store.all_variables(instance_id, Some(scope_id.clone())).await?;
                let ctx = ServiceTaskContext {
                    node_id: &handler_node.id,
                    properties,
                    variables: &scope,
                };
                self.services.execute(task_type, ctx).await?;
            }
            NodeKind::ScriptTask { script } => {
                let scope = self.store.all_variables(instance_id, Some(scope_id.clone())).await?;
                let outcome = ScriptExecutor::execute(script, &scope)?;
                for (name, value) in outcome.assignments {
                    self.store.set_variable(instance_id, Some(scope_id.clone()), &name, value).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn fire_boundary(&self, activity_token: &Token, boundary: &Node) -> Result<()> {
        let NodeKind::BoundaryEvent { interrupting, .. } = &boundary.kind else {
            return Ok(());
        };
        self.events.publish(
            "process.boundary_fired",
            RuntimeEvent::BoundaryFired {
                boundary_id: boundary.id.clone(),
                attached_to: activity_token.node_id.clone(),
                interrupting: *interrupting,
            },
        );
        if *interrupting {
            self.tokens
                .update_state(activity_token.id, TokenState::Active, TokenState::Cancelled)
                .await
                .ok();
        }
        let fresh = Token::new(activity_token.instance_id, boundary.id.clone(), activity_token.scope_id.clone());
        self.store.create_token(&fresh).await?;
        self.pass_through(&fresh, boundary).await
    }

    async fn fire_timer(&self, instance_id: InstanceId, timer: crate::types::TimerState) -> Result<()> {
        if let Some(activity_id) = &timer.activity_id {
            let boundary = self.graph.node(&timer.node_id)?.clone();
            let activity_token = self
                .store
                .tokens_in_instance(instance_id)
                .await?
                .into_iter()
                .find(|t| &t.node_id == activity_id && t.state == TokenState::Active);
            if let Some(activity_token) = activity_token {
                return self.fire_boundary(&activity_token, &boundary).await;
            }
            return Ok(());
        }

        if let Some(event_subprocess) = self.event_subprocess_node(&timer.node_id) {
            return self.trigger_event_subprocess(instance_id, event_subprocess).await;
        }

        self.wake_waiting_token(instance_id, &timer.node_id).await
    }

    fn event_subprocess_node<'g>(&'g self, node_id: &str) -> Option<&'g Node> {
        self.graph
            .nodes
            .get(node_id)
            .filter(|n| matches!(n.kind, NodeKind::EventSubprocess { .. }))
    }

    async fn trigger_event_subprocess(&self, instance_id: InstanceId, node: &Node) -> Result<()> {
        let NodeKind::EventSubprocess { interrupting, .. } = &node.kind else {
            return Ok(());
        };
        if *interrupting {
            for sibling in self.store.tokens_in_instance(instance_id).await? {
                if sibling.scope_id == node.parent_scope && sibling.state == TokenState::Active {
                    self.tokens
                        .update_state(sibling.id, TokenState::Active, TokenState::Cancelled)
                        .await
                        .ok();
                }
            }
        } else {
            let parent_vars = self.store.all_variables(instance_id, node.parent_scope.clone()).await?;
            for (name, value) in parent_vars {
                self.store.set_variable(instance_id, Some(node.id.clone()), &name, value).await?;
            }
        }
        let scope_start = self.graph.scope_start(&node.id)?;
        let token = Token::new(instance_id, scope_start.id.clone(), Some(node.id.clone()));
        self.store.create_token(&token).await?;
        Ok(())
    }

    async fn wake_waiting_token(&self, instance_id: InstanceId, node_id: &str) -> Result<()> {
        if let Some(event_subprocess) = self.event_subprocess_node(node_id) {
            return self.trigger_event_subprocess(instance_id, event_subprocess).await;
        }
        if let Ok(node) = self.graph.node(node_id) {
            if let NodeKind::BoundaryEvent { attached_to, .. } = &node.kind {
                let boundary = node.clone();
                let activity_token = self
                    .store
                    .tokens_in_instance(instance_id)
                    .await?
                    .into_iter()
                    .find(|t| &t.node_id == attached_to && t.state == TokenState::Active);
                if let Some(activity_token) = activity_token {
                    return self.fire_boundary(&activity_token, &boundary).await;
                }
                return Ok(());
            }
        }
        let waiting = self
            .store
            .tokens_in_instance(instance_id)
            .await?
            .into_iter()
            .find(|t| t.node_id == node_id && t.state == TokenState::Waiting);
        if let Some(token) = waiting {
            self.tokens.update_state(token.id, TokenState::Waiting, TokenState::Active).await?;
            let node = self.graph.node(&token.node_id)?.clone();
            self.pass_through(&token, &node).await?;
        }
        Ok(())
    }

    /// Arm/subscribe every event-subprocess nested directly in `scope_id` so
    /// its start trigger can later wake it.
    async fn arm_event_subprocess_triggers(&self, instance_id: InstanceId, scope_id: Option<&str>) -> Result<()> {
        for node in self.graph.event_subprocesses_in(scope_id) {
            let NodeKind::EventSubprocess { event_definition, .. } = &node.kind else {
                continue;
            };
            match event_definition {
                EventDefinition::Timer { kind, expression } => {
                    self.event_handler
                        .timers
                        .arm(instance_id, node.id.clone(), to_timer_type(kind.clone()), expression, None, false, BTreeMap::new())
                        .await?;
                }
                EventDefinition::Message { name, .. } => {
                    self.event_handler.messages.subscribe(instance_id, node.id.clone(), name.clone(), None).await?;
                }
                EventDefinition::Signal { name } => {
                    self.event_handler.signals.subscribe(instance_id, node.id.clone(), name.clone()).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Arm every timer/message/signal boundary event attached to an activity
    /// just before it runs, so it can interrupt (or observe) that activity
    /// while the activity is in flight. Compensation and error boundaries
    /// need no arming: they're resolved on demand when they're needed.
    async fn arm_boundary_watches(&self, instance_id: InstanceId, node: &Node) -> Result<()> {
        for boundary in self.graph.boundary_events(&node.id) {
            let NodeKind::BoundaryEvent { event_definition, interrupting, .. } = &boundary.kind else {
                continue;
            };
            match event_definition {
                EventDefinition::Timer { kind, expression } => {
                    self.event_handler
                        .timers
                        .arm(
                            instance_id,
                            boundary.id.clone(),
                            to_timer_type(kind.clone()),
                            expression,
                            Some(node.id.clone()),
                            *interrupting,
                            BTreeMap::new(),
                        )
                        .await?;
                }
                EventDefinition::Message { name, .. } => {
                    self.event_handler
                        .messages
                        .subscribe(instance_id, boundary.id.clone(), name.clone(), None)
                        .await?;
                }
                EventDefinition::Signal { name } => {
                    self.event_handler.signals.subscribe(instance_id, boundary.id.clone(), name.clone()).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn cancel_boundary_watches(&self, instance_id: InstanceId, activity_id: &str) -> Result<()> {
        for boundary in self.graph.boundary_events(activity_id) {
            match &boundary.kind {
                NodeKind::BoundaryEvent {
                    event_definition: EventDefinition::Timer { .. },
                    ..
                } => {
                    for timer in self.store.timers_for_instance(instance_id).await? {
                        if timer.node_id == boundary.id {
                            self.event_handler.timers.cancel(&timer.timer_id).await.ok();
                        }
                    }
                }
                NodeKind::BoundaryEvent {
                    event_definition: EventDefinition::Message { .. },
                    ..
                } => {
                    self.store.unsubscribe_message(instance_id, &boundary.id).await.ok();
                }
                NodeKind::BoundaryEvent {
                    event_definition: EventDefinition::Signal { .. },
                    ..
                } => {
                    self.store.unsubscribe_signal(instance_id, &boundary.id).await.ok();
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn maybe_complete_instance(&self, instance_id: InstanceId) -> Result<()> {
        let remaining = self.store.tokens_in_instance(instance_id).await?;
        let unsettled = remaining
            .iter()
            .any(|t| matches!(t.state, TokenState::Active | TokenState::Waiting | TokenState::Suspended));
        if unsettled {
            return Ok(());
        }
        self.store.update_instance_status(instance_id, InstanceStatus::Completed).await?;
        self.events.publish("process.completed", RuntimeEvent::InstanceCompleted);
        Ok(())
    }

    /// Flatten a token's scope chain (innermost-first) into a single
    /// variable view, closer scopes shadowing ancestors.
    async fn scope_vars(&self, token: &Token) -> Result<BTreeMap<String, Variable>> {
        let mut chain = vec![token.scope_id.clone()];
        let mut current = token.scope_id.clone();
        while let Some(scope) = current {
            let node = self.graph.node(&scope)?;
            current = node.parent_scope.clone();
            chain.push(current.clone());
        }

        let mut merged = BTreeMap::new();
        for scope in chain.into_iter().rev() {
            let vars = self.store.all_variables(token.instance_id, scope).await?;
            merged.extend(vars);
        }
        Ok(merged)
    }

    async fn log(&self, instance_id: InstanceId, node_id: Option<String>, event_kind: &str, detail: &str) -> Result<()> {
        self.store
            .append_activity_log(ActivityLogEntry {
                instance_id,
                node_id,
                event_kind: event_kind.to_string(),
                detail: detail.to_string(),
                at: Utc::now(),
            })
            .await
    }
}

fn to_timer_type(kind: crate::graph::ir::TimerKind) -> crate::types::TimerType {
    match kind {
        crate::graph::ir::TimerKind::Duration => crate::types::TimerType::Duration,
        crate::graph::ir::TimerKind::Date => crate::types::TimerType::Date,
        crate::graph::ir::TimerKind::Cycle => crate::types::TimerType::Cycle,
    }
}

fn to_variable(value: expr::Value) -> Variable {
    match value {
        expr::Value::Null => Variable::Json(serde_json::Value::Null),
        expr::Value::Bool(b) => Variable::Boolean(b),
        expr::Value::Number(n) => Variable::Float(n),
        expr::Value::Str(s) => Variable::String(s),
    }
}

fn scope_output_vars(node: &Node) -> BTreeMap<String, String> {
    match &node.kind {
        NodeKind::Subprocess { output_vars } => output_vars.clone(),
        NodeKind::Transaction { output_vars, .. } => output_vars.clone(),
        _ => BTreeMap::new(),
    }
}
