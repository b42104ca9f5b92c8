//! Typed error taxonomy for the execution runtime.
//!
//! One variant per distinct failure kind the engine can raise. `EngineError`
//! is the `Result` error type for every public operation in this crate;
//! callers that need a normalized error document (kind + message + node id
//! + instance id) should use [`EngineError::kind`] and [`EngineError::node_id`].

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    #[error("process graph invalid: {0}")]
    ProcessGraphInvalid(String),

    #[error("invalid BPMN: {0}")]
    InvalidBpmn(String),

    #[error("duplicate node id: {0}")]
    DuplicateId(String),

    #[error("token state mismatch on {token_id}: expected {expected}, found {actual}")]
    TokenState {
        token_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("expression syntax error in `{expr}`: {reason}")]
    ExprSyntax { expr: String, reason: String },

    #[error("expression evaluation error: {0}")]
    ExprEval(String),

    #[error("message wait on `{name}` timed out after {timeout_ms}ms")]
    MessageTimeout { name: String, timeout_ms: u64 },

    #[error("signal payload invalid for `{name}`: {reason}")]
    SignalInvalidPayload { name: String, reason: String },

    #[error("invalid timer definition `{0}`")]
    TimerInvalid(String),

    #[error("gateway {gateway_id} has no matching path and no default flow")]
    GatewayNoPath { gateway_id: String },

    #[error("join {join_id} saw a duplicate arrival on path {path_id}")]
    JoinDuplicate { join_id: String, path_id: String },

    #[error("join {join_id} received an arrival from unregistered path {path_id}")]
    JoinUnregistered { join_id: String, path_id: String },

    #[error("service task `{task_type}` failed: {message}")]
    ServiceTaskFailed {
        task_type: String,
        message: String,
        error_code: Option<String>,
    },

    #[error("compensation failed for activity {activity_id}: {message}")]
    CompensationFailed { activity_id: String, message: String },

    #[error("business error thrown by end event `{end_event_id}`")]
    ThrownError {
        end_event_id: String,
        error_code: Option<String>,
    },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable kind for logs and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ProcessGraphInvalid(_) => "PROCESS_GRAPH_INVALID",
            EngineError::InvalidBpmn(_) => "INVALID_BPMN",
            EngineError::DuplicateId(_) => "DUPLICATE_ID",
            EngineError::TokenState { .. } => "TOKEN_STATE",
            EngineError::ExprSyntax { .. } => "EXPR_SYNTAX",
            EngineError::ExprEval(_) => "EXPR_EVAL",
            EngineError::MessageTimeout { .. } => "MESSAGE_TIMEOUT",
            EngineError::SignalInvalidPayload { .. } => "SIGNAL_INVALID_PAYLOAD",
            EngineError::TimerInvalid(_) => "TIMER_INVALID",
            EngineError::GatewayNoPath { .. } => "GATEWAY_NO_PATH",
            EngineError::JoinDuplicate { .. } => "JOIN_DUPLICATE",
            EngineError::JoinUnregistered { .. } => "JOIN_UNREGISTERED",
            EngineError::ServiceTaskFailed { .. } => "SERVICE_TASK_FAILED",
            EngineError::CompensationFailed { .. } => "COMPENSATION_FAILED",
            EngineError::ThrownError { .. } => "THROWN_ERROR",
            EngineError::NodeNotFound(_) => "NODE_NOT_FOUND",
            EngineError::FlowNotFound(_) => "FLOW_NOT_FOUND",
            EngineError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// True for errors an enclosing error boundary event may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            EngineError::ExprSyntax { .. }
                | EngineError::ExprEval(_)
                | EngineError::ServiceTaskFailed { .. }
                | EngineError::ThrownError { .. }
        )
    }

    /// The BPMN error code this error carries, if any. A boundary or event
    /// subprocess with an exact `errorCode` can only claim an error whose
    /// code matches; `None` here only ever matches a catch-all.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            EngineError::ServiceTaskFailed { error_code, .. } => error_code.as_deref(),
            EngineError::ThrownError { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }
}

/// A normalized error document surfaced to API responses.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorDocument {
    pub kind: String,
    pub message: String,
    pub node_id: Option<String>,
    pub instance_id: Option<Uuid>,
}

impl ErrorDocument {
    pub fn new(err: &EngineError, node_id: Option<String>, instance_id: Option<Uuid>) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            node_id,
            instance_id,
        }
    }
}
