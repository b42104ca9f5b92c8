//! ScriptExecutor: runs scriptTask bodies in a tightly sandboxed subset of
//! the expression language. No general-purpose embedded scripting crate is
//! pulled in; scripts are a restricted sequence of `set_variable(name,
//! ${expr})` statements rather than an arbitrary language.

use crate::error::{EngineError, Result};
use crate::expr;
use crate::types::Variable;
use std::collections::BTreeMap;

/// The effect of running a script: variables it assigned, plus an optional
/// `result` value from a bare trailing expression.
#[derive(Debug, Default, Clone)]
pub struct ScriptOutcome {
    pub assignments: BTreeMap<String, Variable>,
    pub result: Option<Variable>,
}

pub struct ScriptExecutor;

impl ScriptExecutor {
    /// Execute a script body: one statement per line, each either
    /// `set_variable("name", ${expr})` or a bare `${expr}` (whose value
    /// becomes `result`). Blank lines and `#`-prefixed comments are skipped.
    pub fn execute(script: &str, scope: &BTreeMap<String, Variable>) -> Result<ScriptOutcome> {
        let mut outcome = ScriptOutcome::default();
        let mut working = scope.clone();

        for (line_no, raw_line) in script.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(args) = line.strip_prefix("set_variable(").and_then(|s| s.strip_suffix(')')) {
                let (name, expr_src) = split_set_variable_args(args).ok_or_else(|| EngineError::ExprSyntax {
                    expr: line.to_string(),
                    reason: format!("malformed set_variable call on line {}", line_no + 1),
                })?;
                let value = expr::evaluate(expr_src, &working)?;
                let variable = to_variable(value);
                working.insert(name.clone(), variable.clone());
                outcome.assignments.insert(name, variable);
            } else {
                let value = expr::evaluate(line, &working)?;
                outcome.result = Some(to_variable(value));
            }
        }
        Ok(outcome)
    }
}

fn split_set_variable_args(args: &str) -> Option<(String, &str)> {
    let comma = args.find(',')?;
    let name_part = args[..comma].trim();
    let name = name_part.trim_matches(|c| c == '"' || c == '\'').to_string();
    let expr_part = args[comma + 1..].trim();
    Some((name, expr_part))
}

fn to_variable(value: expr::Value) -> Variable {
    match value {
        expr::Value::Null => Variable::Json(serde_json::Value::Null),
        expr::Value::Bool(b) => Variable::Boolean(b),
        expr::Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Variable::Integer(n as i64)
            } else {
                Variable::Float(n)
            }
        }
        expr::Value::Str(s) => Variable::String(s),
    }
}
