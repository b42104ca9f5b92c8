//! Core data model: process graph primitives, tokens, variables, scopes,
//! timers, subscriptions, and the saga/compensation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type InstanceId = Uuid;
pub type NodeId = String;
pub type FlowId = String;
/// Node id of the enclosing subprocess/transaction/event-subprocess. `None` is the root scope.
pub type ScopeId = String;

// ─── Variables ─────────────────────────────────────────────────

/// A dynamically typed process variable. The type tag is part of the
/// contract — storage round-trips must preserve it (design notes §9).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Variable {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Variable {
    pub fn type_name(&self) -> &'static str {
        match self {
            Variable::String(_) => "string",
            Variable::Integer(_) => "integer",
            Variable::Float(_) => "float",
            Variable::Boolean(_) => "boolean",
            Variable::Date(_) => "date",
            Variable::Json(_) => "json",
        }
    }
}

// ─── Token ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Active,
    Suspended,
    Completed,
    Error,
    Cancelled,
    Compensation,
    Waiting,
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenState::Active => "ACTIVE",
            TokenState::Suspended => "SUSPENDED",
            TokenState::Completed => "COMPLETED",
            TokenState::Error => "ERROR",
            TokenState::Cancelled => "CANCELLED",
            TokenState::Compensation => "COMPENSATION",
            TokenState::Waiting => "WAITING",
        };
        write!(f, "{s}")
    }
}

/// A single unit of control flow at one node within an instance.
///
/// `data` is untyped, ad hoc token-local payload (message results, error
/// codes, compensation markers) — distinct from scoped [`Variable`]s, which
/// carry the type-tag contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub scope_id: Option<ScopeId>,
    pub state: TokenState,
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Token {
    pub fn new(instance_id: InstanceId, node_id: impl Into<NodeId>, scope_id: Option<ScopeId>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            node_id: node_id.into(),
            scope_id,
            state: TokenState::Active,
            data: BTreeMap::new(),
        }
    }

    /// A copy of this token relocated to a new node, preserving its data.
    pub fn moved_to(&self, node_id: impl Into<NodeId>, scope_id: Option<ScopeId>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: self.instance_id,
            node_id: node_id.into(),
            scope_id,
            state: TokenState::Active,
            data: self.data.clone(),
        }
    }
}

// ─── Scope / compensation ──────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompensationHandlerEntry {
    pub instance_id: InstanceId,
    pub activity_id: String,
    pub handler_id: String,
    pub scope_id: ScopeId,
    pub execution_order: Option<i32>,
    /// Monotonic registration order, used as the stable tie-break.
    pub registered_seq: u64,
}

// ─── Timers ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerType {
    Duration,
    Date,
    Cycle,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerState {
    pub timer_id: String,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub timer_type: TimerType,
    pub definition: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub token_data: BTreeMap<String, serde_json::Value>,
    pub activity_id: Option<String>,
    pub interrupting: bool,
}

// ─── Subscriptions ──────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSubscription {
    pub message_name: String,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    pub correlation_value: Option<Variable>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalSubscription {
    pub signal_name: String,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
}

// ─── Saga ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Active,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaStep {
    pub action_id: String,
    pub compensation_id: String,
    pub data: serde_json::Value,
    pub completed: bool,
    pub compensated: bool,
}

impl SagaStep {
    pub fn new(action_id: impl Into<String>, compensation_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            action_id: action_id.into(),
            compensation_id: compensation_id.into(),
            data,
            completed: false,
            compensated: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelStepGroup {
    pub steps: Vec<SagaStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Saga {
    pub saga_id: String,
    pub instance_id: InstanceId,
    pub steps: Vec<SagaStep>,
    pub parallel_groups: Vec<ParallelStepGroup>,
    pub status: SagaStatus,
}

impl Saga {
    pub fn new(saga_id: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            saga_id: saga_id.into(),
            instance_id,
            steps: Vec::new(),
            parallel_groups: Vec::new(),
            status: SagaStatus::Active,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaResult {
    pub status: SagaStatus,
    pub data: Option<serde_json::Value>,
}

// ─── Instance / relational-store abstractions ──────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Running,
    Completed,
    Suspended,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub instance_id: InstanceId,
    pub definition_id: String,
    pub version: u32,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub instance_id: InstanceId,
    pub node_id: Option<NodeId>,
    pub event_kind: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}
