//! Persistence trait for all BPMN runtime state.
//!
//! The engine and its collaborators operate exclusively through this trait;
//! [`memory::MemoryStateManager`] is the only implementation, used by both
//! the test suite and the CLI.

pub mod memory;

use crate::error::Result;
use crate::types::{
    ActivityLogEntry, CompensationHandlerEntry, InstanceId, InstanceStatus, MessageSubscription,
    NodeId, ProcessInstanceRecord, ScopeId, SignalSubscription, TimerState,
};
use crate::types::{Saga, Token, TokenState, Variable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The outcome of a join barrier arrival, returned by [`StateManager::join_arrive`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinArrival {
    /// Arrived, barrier not yet satisfied. `(arrived, expected)`.
    Pending(usize, usize),
    /// This arrival completed the barrier; caller should proceed past the join.
    Satisfied,
}

#[async_trait]
pub trait StateManager: Send + Sync {
    // ── Instance lifecycle ──

    async fn create_instance(&self, record: &ProcessInstanceRecord) -> Result<()>;
    async fn load_instance(&self, id: InstanceId) -> Result<ProcessInstanceRecord>;
    async fn update_instance_status(&self, id: InstanceId, status: InstanceStatus) -> Result<()>;

    // ── Tokens ──

    async fn create_token(&self, token: &Token) -> Result<()>;
    async fn get_token(&self, token_id: Uuid) -> Result<Token>;
    async fn tokens_in_instance(&self, instance_id: InstanceId) -> Result<Vec<Token>>;

    /// Compare-and-set: succeeds only if the token's current state equals
    /// `expected`. The loser of a race gets `TOKEN_STATE`.
    async fn cas_token_state(&self, token_id: Uuid, expected: TokenState, new: TokenState) -> Result<()>;

    /// Replace a token wholesale (used by move/split, which already did their
    /// own CAS check on the source token before calling this).
    async fn put_token(&self, token: &Token) -> Result<()>;
    async fn delete_token(&self, token_id: Uuid) -> Result<()>;

    // ── Scoped variables ──

    /// `scope_chain` is innermost-first; the first scope holding `name` wins
    /// (a scope's id is the enclosing node's id, so this is a parent-scope
    /// fallback chain).
    async fn get_variable(
        &self,
        instance_id: InstanceId,
        scope_chain: &[Option<ScopeId>],
        name: &str,
    ) -> Result<Option<Variable>>;

    async fn set_variable(
        &self,
        instance_id: InstanceId,
        scope_id: Option<ScopeId>,
        name: &str,
        value: Variable,
    ) -> Result<()>;

    async fn all_variables(
        &self,
        instance_id: InstanceId,
        scope_id: Option<ScopeId>,
    ) -> Result<BTreeMap<String, Variable>>;

    /// Remove every variable owned by a scope. Called when a subprocess
    /// instance completes, after its `output_vars` mapping has been applied.
    async fn clear_scope(&self, instance_id: InstanceId, scope_id: ScopeId) -> Result<()>;

    // ── Timers ──

    async fn save_timer(&self, timer: &TimerState) -> Result<()>;
    async fn delete_timer(&self, timer_id: &str) -> Result<()>;
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerState>>;
    async fn timers_for_instance(&self, instance_id: InstanceId) -> Result<Vec<TimerState>>;

    // ── Message / signal subscriptions ──

    async fn subscribe_message(&self, sub: MessageSubscription) -> Result<()>;
    async fn unsubscribe_message(&self, instance_id: InstanceId, node_id: &str) -> Result<()>;
    async fn find_message_subscribers(
        &self,
        message_name: &str,
        correlation_value: Option<&Variable>,
    ) -> Result<Vec<MessageSubscription>>;

    async fn subscribe_signal(&self, sub: SignalSubscription) -> Result<()>;
    async fn unsubscribe_signal(&self, instance_id: InstanceId, node_id: &str) -> Result<()>;
    async fn find_signal_subscribers(&self, signal_name: &str) -> Result<Vec<SignalSubscription>>;

    // ── Compensation handler registry ──

    async fn register_compensation_handler(&self, entry: CompensationHandlerEntry) -> Result<()>;

    /// Registered handlers for a scope, in the order compensation should run:
    /// explicit `execution_order` first (ascending), then registration order
    /// for ties — handlers with no explicit order compensate in the order
    /// their activities completed.
    async fn compensation_handlers(
        &self,
        instance_id: InstanceId,
        scope_id: &ScopeId,
    ) -> Result<Vec<CompensationHandlerEntry>>;

    async fn clear_compensation_handlers(&self, instance_id: InstanceId, scope_id: &ScopeId) -> Result<()>;

    // ── Parallel/inclusive join barriers ──

    /// Declare the set of incoming flow ids a join must see before it fires.
    /// Idempotent: re-registering the same join with the same set is a no-op.
    async fn register_join(&self, instance_id: InstanceId, join_id: &NodeId, expected_paths: &[String]) -> Result<()>;

    /// Record one incoming path's arrival. `JOIN_DUPLICATE` if `path_id` has
    /// already arrived for this join; `JOIN_UNREGISTERED` if `path_id` isn't
    /// among the join's expected paths.
    async fn join_arrive(&self, instance_id: InstanceId, join_id: &NodeId, path_id: &str) -> Result<JoinArrival>;

    async fn reset_join(&self, instance_id: InstanceId, join_id: &NodeId) -> Result<()>;

    // ── Sagas ──

    async fn save_saga(&self, saga: &Saga) -> Result<()>;
    async fn load_saga(&self, instance_id: InstanceId, saga_id: &str) -> Result<Saga>;

    // ── Activity log (audit trail) ──

    async fn append_activity_log(&self, entry: ActivityLogEntry) -> Result<()>;
    async fn activity_log(&self, instance_id: InstanceId) -> Result<Vec<ActivityLogEntry>>;
}
