pub mod ir;
pub mod parser;
pub mod validator;

pub use ir::{EventDefinition, Flow, Node, NodeKind, ProcessGraph, TimerKind};
pub use parser::parse_bpmn;
pub use validator::validate;
