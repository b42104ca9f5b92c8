//! GatewayHandler: exclusive, inclusive, and parallel gateway semantics.
//! Evaluation order follows the outgoing flow order recorded by the parser
//! (BPMN's own "first matching sequenceFlow wins" rule for exclusive
//! gateways).

use crate::error::{EngineError, Result};
use crate::expr;
use crate::graph::ir::{Flow, Node};
use crate::types::Variable;
use std::collections::BTreeMap;

pub struct GatewayHandler;

impl GatewayHandler {
    /// Exclusive split: first flow whose condition evaluates truthy wins; if
    /// none do, the flow marked `default` is taken; if there is no default
    /// either, `GATEWAY_NO_PATH`.
    pub fn exclusive_split(
        gateway: &Node,
        outgoing: &[&Flow],
        scope: &BTreeMap<String, Variable>,
    ) -> Result<String> {
        for flow in outgoing {
            if flow.is_default {
                continue;
            }
            if let Some(cond) = &flow.condition {
                if expr::evaluate_condition(cond, scope)? {
                    return Ok(flow.id.clone());
                }
            } else if outgoing.len() == 1 {
                return Ok(flow.id.clone());
            }
        }
        outgoing
            .iter()
            .find(|f| f.is_default)
            .map(|f| f.id.clone())
            .ok_or_else(|| EngineError::GatewayNoPath {
                gateway_id: gateway.id.clone(),
            })
    }

    /// Inclusive split: every flow whose condition evaluates truthy is taken.
    /// A `null`/missing condition result is treated as not-taken, same as
    /// `false`. If no conditional flow fires,
    /// the default flow alone is taken; with no default either, `GATEWAY_NO_PATH`.
    pub fn inclusive_split(
        gateway: &Node,
        outgoing: &[&Flow],
        scope: &BTreeMap<String, Variable>,
    ) -> Result<Vec<String>> {
        let mut taken = Vec::new();
        for flow in outgoing {
            if flow.is_default {
                continue;
            }
            match &flow.condition {
                Some(cond) if expr::evaluate_condition(cond, scope)? => taken.push(flow.id.clone()),
                Some(_) => {}
                None => taken.push(flow.id.clone()),
            }
        }
        if taken.is_empty() {
            if let Some(default) = outgoing.iter().find(|f| f.is_default) {
                return Ok(vec![default.id.clone()]);
            }
            return Err(EngineError::GatewayNoPath {
                gateway_id: gateway.id.clone(),
            });
        }
        Ok(taken)
    }

    /// Parallel split: every outgoing flow is taken unconditionally.
    pub fn parallel_split(outgoing: &[&Flow]) -> Vec<String> {
        outgoing.iter().map(|f| f.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ir::NodeKind;

    fn gw(id: &str, kind: NodeKind) -> Node {
        Node {
            id: id.to_string(),
            kind,
            parent_scope: None,
            incoming: vec![],
            outgoing: vec![],
        }
    }

    fn flow(id: &str, cond: Option<&str>, is_default: bool) -> Flow {
        Flow {
            id: id.to_string(),
            source: "g".to_string(),
            target: format!("{id}_target"),
            condition: cond.map(str::to_string),
            is_default,
        }
    }

    #[test]
    fn exclusive_picks_first_truthy() {
        let gateway = gw("g", NodeKind::ExclusiveGateway);
        let f1 = flow("f1", Some("${amount > 1000}"), false);
        let f2 = flow("f2", Some("${amount > 100}"), false);
        let f3 = flow("f3", None, true);
        let mut scope = BTreeMap::new();
        scope.insert("amount".to_string(), Variable::Integer(500));
        let chosen = GatewayHandler::exclusive_split(&gateway, &[&f1, &f2, &f3], &scope).unwrap();
        assert_eq!(chosen, "f2");
    }

    #[test]
    fn exclusive_falls_back_to_default() {
        let gateway = gw("g", NodeKind::ExclusiveGateway);
        let f1 = flow("f1", Some("${amount > 1000}"), false);
        let f3 = flow("f3", None, true);
        let mut scope = BTreeMap::new();
        scope.insert("amount".to_string(), Variable::Integer(1));
        let chosen = GatewayHandler::exclusive_split(&gateway, &[&f1, &f3], &scope).unwrap();
        assert_eq!(chosen, "f3");
    }

    #[test]
    fn exclusive_without_default_errors() {
        let gateway = gw("g", NodeKind::ExclusiveGateway);
        let f1 = flow("f1", Some("${amount > 1000}"), false);
        let mut scope = BTreeMap::new();
        scope.insert("amount".to_string(), Variable::Integer(1));
        let err = GatewayHandler::exclusive_split(&gateway, &[&f1], &scope).unwrap_err();
        assert_eq!(err.kind(), "GATEWAY_NO_PATH");
    }

    #[test]
    fn inclusive_takes_every_truthy_flow() {
        let gateway = gw("g", NodeKind::InclusiveGateway);
        let f1 = flow("f1", Some("${a}"), false);
        let f2 = flow("f2", Some("${b}"), false);
        let mut scope = BTreeMap::new();
        scope.insert("a".to_string(), Variable::Boolean(true));
        scope.insert("b".to_string(), Variable::Boolean(true));
        let taken = GatewayHandler::inclusive_split(&gateway, &[&f1, &f2], &scope).unwrap();
        assert_eq!(taken, vec!["f1".to_string(), "f2".to_string()]);
    }

    #[test]
    fn inclusive_null_condition_is_not_taken() {
        let gateway = gw("g", NodeKind::InclusiveGateway);
        let f1 = flow("f1", Some("${missing.deep}"), false);
        let f3 = flow("f3", None, true);
        let scope = BTreeMap::new();
        let taken = GatewayHandler::inclusive_split(&gateway, &[&f1, &f3], &scope).unwrap();
        assert_eq!(taken, vec!["f3".to_string()]);
    }

    #[test]
    fn parallel_takes_all_unconditionally() {
        let f1 = flow("f1", None, false);
        let f2 = flow("f2", None, false);
        assert_eq!(
            GatewayHandler::parallel_split(&[&f1, &f2]),
            vec!["f1".to_string(), "f2".to_string()]
        );
    }
}
