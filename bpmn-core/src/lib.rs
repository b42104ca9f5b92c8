//! A BPMN 2.0 workflow execution engine: parses a process graph from BPMN
//! XML and drives it with a token-based interpreter — gateways, timer/
//! message/signal/error/compensation events, subprocesses and transactions,
//! and saga-style compensation orchestration, built around a
//! [`state::StateManager`] persistence seam.

pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod executor;
pub mod expr;
pub mod gateway;
pub mod graph;
pub mod saga;
pub mod script;
pub mod service;
pub mod state;
pub mod subprocess;
pub mod token;
pub mod types;

pub use config::Config;
pub use error::{EngineError, Result};
pub use events::{EventBus, RuntimeEvent};
pub use executor::Executor;
pub use graph::{parse_bpmn, ProcessGraph};
pub use service::{ServiceTask, ServiceTaskContext, ServiceTaskRegistry};
pub use state::{memory::MemoryStateManager, StateManager};
pub use types::{InstanceId, Token, TokenState, Variable};
