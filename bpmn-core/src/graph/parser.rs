//! Parse BPMN 2.0 XML (plus the custom extension namespace carrying script
//! bodies, timer expressions, and service-task properties) into a
//! [`ProcessGraph`]. Accepts both prefixed (`bpmn:task`) and default-namespace
//! forms — only the local (namespace-stripped) tag name is matched.

use super::ir::{EventDefinition, Flow, Node, NodeKind, ProcessGraph, TimerKind};
use crate::error::{EngineError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;

// ─── Minimal XML tree ───────────────────────────────────────────
//
// quick_xml is a streaming reader; we materialize a small DOM so the graph
// builder below can walk BPMN's nested subProcess/transaction structure by
// straightforward recursion instead of tracking a manual element stack.

#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attrs: BTreeMap<String, String>,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == local_name)
    }

    fn children_named<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == local_name)
    }
}

fn local_name(qname: &[u8]) -> String {
    let s = String::from_utf8_lossy(qname);
    match s.find(':') {
        Some(idx) => s[idx + 1..].to_string(),
        None => s.to_string(),
    }
}

fn attrs_of(e: &BytesStart) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for a in e.attributes() {
        let a = a.map_err(|err| EngineError::InvalidBpmn(format!("bad attribute: {err}")))?;
        let key = local_name(a.key.as_ref());
        let raw = String::from_utf8_lossy(&a.value).into_owned();
        let value = quick_xml::escape::unescape(&raw)
            .map(|s| s.into_owned())
            .unwrap_or(raw);
        map.insert(key, value);
    }
    Ok(map)
}

fn parse_xml_tree(xml: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut root = XmlElement {
        name: "#document".to_string(),
        ..Default::default()
    };
    let mut stack: Vec<XmlElement> = vec![];
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| EngineError::InvalidBpmn(format!("XML parse error: {e}")))?;
        match event {
            Event::Start(ref e) => {
                let elem = XmlElement {
                    name: local_name(e.name().as_ref()),
                    attrs: attrs_of(e)?,
                    children: Vec::new(),
                    text: String::new(),
                };
                stack.push(elem);
            }
            Event::Empty(ref e) => {
                let elem = XmlElement {
                    name: local_name(e.name().as_ref()),
                    attrs: attrs_of(e)?,
                    children: Vec::new(),
                    text: String::new(),
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None => root.children.push(elem),
                }
            }
            Event::End(_) => {
                let finished = stack
                    .pop()
                    .ok_or_else(|| EngineError::InvalidBpmn("unbalanced XML tags".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(finished),
                    None => root.children.push(finished),
                }
            }
            Event::Text(ref e) => {
                let text = e
                    .unescape()
                    .map_err(|err| EngineError::InvalidBpmn(format!("bad text: {err}")))?
                    .trim()
                    .to_string();
                if !text.is_empty() {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(EngineError::InvalidBpmn("unclosed XML element".to_string()));
    }
    Ok(root)
}

// ─── Graph building ──────────────────────────────────────────────

struct RawFlow {
    id: String,
    source: String,
    target: String,
    condition: Option<String>,
}

struct BuildCtx {
    nodes: BTreeMap<String, Node>,
    flows: Vec<RawFlow>,
    message_names: BTreeMap<String, String>,
    signal_names: BTreeMap<String, String>,
    error_codes: BTreeMap<String, String>,
    default_flow_of: BTreeMap<String, String>,
}

pub fn parse_bpmn(xml: &str) -> Result<ProcessGraph> {
    let root = parse_xml_tree(xml)?;
    let definitions = find_definitions(&root)?;

    let mut ctx = BuildCtx {
        nodes: BTreeMap::new(),
        flows: Vec::new(),
        message_names: BTreeMap::new(),
        signal_names: BTreeMap::new(),
        error_codes: BTreeMap::new(),
        default_flow_of: BTreeMap::new(),
    };

    for child in &definitions.children {
        match child.name.as_str() {
            "message" => {
                if let (Some(id), Some(name)) = (child.attr("id"), child.attr("name")) {
                    ctx.message_names.insert(id.to_string(), name.to_string());
                }
            }
            "signal" => {
                if let (Some(id), Some(name)) = (child.attr("id"), child.attr("name")) {
                    ctx.signal_names.insert(id.to_string(), name.to_string());
                }
            }
            "error" => {
                if let Some(id) = child.attr("id") {
                    let code = child.attr("errorCode").unwrap_or(id).to_string();
                    ctx.error_codes.insert(id.to_string(), code);
                }
            }
            _ => {}
        }
    }

    let process = definitions
        .child("process")
        .ok_or_else(|| EngineError::ProcessGraphInvalid("no <process> element".to_string()))?;

    walk_container(process, None, &mut ctx)?;

    // Second pass: wire edges, fill incoming/outgoing, mark default flows.
    for raw in &ctx.flows {
        if !ctx.nodes.contains_key(&raw.source) {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "sequenceFlow '{}' references unknown sourceRef '{}'",
                raw.id, raw.source
            )));
        }
        if !ctx.nodes.contains_key(&raw.target) {
            return Err(EngineError::ProcessGraphInvalid(format!(
                "sequenceFlow '{}' references unknown targetRef '{}'",
                raw.id, raw.target
            )));
        }
    }

    let mut flows = BTreeMap::new();
    for raw in ctx.flows {
        let is_default = ctx
            .default_flow_of
            .get(&raw.source)
            .map(|f| f == &raw.id)
            .unwrap_or(false);
        if let Some(n) = ctx.nodes.get_mut(&raw.source) {
            n.outgoing.push(raw.id.clone());
        }
        if let Some(n) = ctx.nodes.get_mut(&raw.target) {
            n.incoming.push(raw.id.clone());
        }
        flows.insert(
            raw.id.clone(),
            Flow {
                id: raw.id.clone(),
                source: raw.source,
                target: raw.target,
                condition: raw.condition,
                is_default,
            },
        );
    }

    let start_node = ctx
        .nodes
        .values()
        .find(|n| n.parent_scope.is_none() && matches!(n.kind, NodeKind::StartEvent { .. }))
        .map(|n| n.id.clone())
        .ok_or_else(|| EngineError::ProcessGraphInvalid("no top-level StartEvent".to_string()))?;

    Ok(ProcessGraph {
        nodes: ctx.nodes,
        flows,
        start_node,
    })
}

fn find_definitions(root: &XmlElement) -> Result<&XmlElement> {
    root.children
        .iter()
        .find(|c| c.name == "definitions")
        .ok_or_else(|| EngineError::InvalidBpmn("missing <definitions> root".to_string()))
}

fn walk_container(container: &XmlElement, parent_scope: Option<&str>, ctx: &mut BuildCtx) -> Result<()> {
    for child in &container.children {
        match child.name.as_str() {
            "startEvent" => add_node(ctx, parent_scope, start_event(child, ctx)?)?,
            "endEvent" => add_node(ctx, parent_scope, end_event(child, ctx)?)?,
            "task" | "userTask" | "manualTask" | "sendTask" | "receiveTask" | "businessRuleTask" => {
                add_node(ctx, parent_scope, plain_task(child)?)?
            }
            "scriptTask" => add_node(ctx, parent_scope, script_task(child)?)?,
            "serviceTask" => add_node(ctx, parent_scope, service_task(child)?)?,
            "exclusiveGateway" => {
                add_node(ctx, parent_scope, gateway_node(child, NodeKind::ExclusiveGateway)?)?
            }
            "parallelGateway" => {
                add_node(ctx, parent_scope, gateway_node(child, NodeKind::ParallelGateway)?)?
            }
            "inclusiveGateway" => {
                add_node(ctx, parent_scope, gateway_node(child, NodeKind::InclusiveGateway)?)?
            }
            "boundaryEvent" => add_node(ctx, parent_scope, boundary_event(child, ctx)?)?,
            "intermediateCatchEvent" | "intermediateThrowEvent" => {
                add_node(ctx, parent_scope, intermediate_event(child, ctx)?)?
            }
            "subProcess" => {
                let id = required_attr(child, "id")?;
                if child.attr("triggeredByEvent") == Some("true") {
                    let start = child.child("startEvent");
                    let interrupting = start
                        .and_then(|s| s.attr("isInterrupting"))
                        .map(|v| v != "false")
                        .unwrap_or(true);
                    let event_definition = start
                        .map(|s| event_definition_of(s, ctx))
                        .transpose()?
                        .unwrap_or(EventDefinition::None);
                    add_node(
                        ctx,
                        parent_scope,
                        Node {
                            id: id.clone(),
                            kind: NodeKind::EventSubprocess {
                                event_definition,
                                interrupting,
                            },
                            parent_scope: parent_scope.map(str::to_string),
                            incoming: Vec::new(),
                            outgoing: Vec::new(),
                        },
                    )?;
                } else {
                    let output_vars = output_vars_of(child);
                    add_node(
                        ctx,
                        parent_scope,
                        Node {
                            id: id.clone(),
                            kind: NodeKind::Subprocess { output_vars },
                            parent_scope: parent_scope.map(str::to_string),
                            incoming: Vec::new(),
                            outgoing: Vec::new(),
                        },
                    )?;
                }
                walk_container(child, Some(&id), ctx)?;
            }
            "transaction" => {
                let id = required_attr(child, "id")?;
                let output_vars = output_vars_of(child);
                let cancel_end_event = child
                    .children_named("endEvent")
                    .find(|e| e.child("cancelEventDefinition").is_some())
                    .and_then(|e| e.attr("id"))
                    .map(str::to_string);
                add_node(
                    ctx,
                    parent_scope,
                    Node {
                        id: id.clone(),
                        kind: NodeKind::Transaction {
                            output_vars,
                            cancel_end_event,
                        },
                        parent_scope: parent_scope.map(str::to_string),
                        incoming: Vec::new(),
                        outgoing: Vec::new(),
                    },
                )?;
                walk_container(child, Some(&id), ctx)?;
            }
            "sequenceFlow" => {
                let id = required_attr(child, "id")?;
                let source = required_attr(child, "sourceRef")?;
                let target = required_attr(child, "targetRef")?;
                let condition = child
                    .child("conditionExpression")
                    .map(|c| c.text.clone())
                    .filter(|t| !t.is_empty());
                ctx.flows.push(RawFlow {
                    id,
                    source,
                    target,
                    condition,
                });
            }
            _ => {}
        }

        if let Some(default) = child.attr("default") {
            if let Some(id) = child.attr("id") {
                ctx.default_flow_of.insert(id.to_string(), default.to_string());
            }
        }
    }
    Ok(())
}

fn add_node(ctx: &mut BuildCtx, parent_scope: Option<&str>, mut node: Node) -> Result<()> {
    node.parent_scope = parent_scope.map(str::to_string);
    if ctx.nodes.contains_key(&node.id) {
        return Err(EngineError::DuplicateId(node.id.clone()));
    }
    ctx.nodes.insert(node.id.clone(), node);
    Ok(())
}

fn required_attr(e: &XmlElement, name: &str) -> Result<String> {
    e.attr(name)
        .map(str::to_string)
        .ok_or_else(|| EngineError::InvalidBpmn(format!("<{}> missing required attribute `{name}`", e.name)))
}

fn start_event(e: &XmlElement, ctx: &BuildCtx) -> Result<Node> {
    let id = required_attr(e, "id")?;
    Ok(Node {
        id,
        kind: NodeKind::StartEvent {
            event_definition: event_definition_of(e, ctx)?,
        },
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn end_event(e: &XmlElement, ctx: &BuildCtx) -> Result<Node> {
    let id = required_attr(e, "id")?;
    let terminate = e.child("terminateEventDefinition").is_some();
    let event_definition = event_definition_of(e, ctx)?;
    Ok(Node {
        id,
        kind: NodeKind::EndEvent { terminate, event_definition },
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn plain_task(e: &XmlElement) -> Result<Node> {
    let id = required_attr(e, "id")?;
    Ok(Node {
        id,
        kind: NodeKind::Task,
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn script_body_of(e: &XmlElement) -> String {
    if let Some(s) = e.child("script") {
        return s.text.clone();
    }
    if let Some(ext) = e.child("extensionElements") {
        if let Some(s) = ext.child("script") {
            return s.text.clone();
        }
    }
    String::new()
}

fn script_task(e: &XmlElement) -> Result<Node> {
    let id = required_attr(e, "id")?;
    Ok(Node {
        id,
        kind: NodeKind::ScriptTask {
            script: script_body_of(e),
        },
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn snake_case(name: &str) -> String {
    let mut out = String::new();
    for (i, ch) in name.chars().enumerate() {
        if ch.is_whitespace() || ch == '-' {
            out.push('_');
        } else if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn properties_of(e: &XmlElement) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    if let Some(ext) = e.child("extensionElements") {
        for p in ext.children_named("property") {
            if let (Some(name), Some(value)) = (p.attr("name"), p.attr("value")) {
                props.insert(name.to_string(), value.to_string());
            }
        }
    }
    props
}

fn output_vars_of(e: &XmlElement) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if let Some(ext) = e.child("extensionElements") {
        if let Some(ov) = ext.child("outputVars") {
            for v in ov.children_named("var") {
                if let (Some(parent), Some(sub)) = (v.attr("parent"), v.attr("subprocess")) {
                    map.insert(parent.to_string(), sub.to_string());
                }
            }
        }
    }
    map
}

fn service_task(e: &XmlElement) -> Result<Node> {
    let id = required_attr(e, "id")?;
    let name = e.attr("name").unwrap_or_default().to_string();
    let props = properties_of(e);
    let task_type = e
        .child("extensionElements")
        .and_then(|ext| ext.child("taskType"))
        .map(|t| t.text.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| snake_case(&name));
    Ok(Node {
        id,
        kind: NodeKind::ServiceTask {
            task_type,
            properties: props,
        },
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn gateway_node(e: &XmlElement, kind: NodeKind) -> Result<Node> {
    let id = required_attr(e, "id")?;
    Ok(Node {
        id,
        kind,
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn timeout_ms_of(e: &XmlElement) -> Option<u64> {
    e.child("extensionElements")
        .and_then(|ext| ext.child("timeout"))
        .and_then(|t| t.text.parse::<u64>().ok())
}

fn event_definition_of(e: &XmlElement, ctx: &BuildCtx) -> Result<EventDefinition> {
    if let Some(timer) = e.child("timerEventDefinition") {
        if let Some(d) = timer.child("timeDuration") {
            return Ok(EventDefinition::Timer {
                kind: TimerKind::Duration,
                expression: d.text.clone(),
            });
        }
        if let Some(d) = timer.child("timeDate") {
            return Ok(EventDefinition::Timer {
                kind: TimerKind::Date,
                expression: d.text.clone(),
            });
        }
        if let Some(d) = timer.child("timeCycle") {
            return Ok(EventDefinition::Timer {
                kind: TimerKind::Cycle,
                expression: d.text.clone(),
            });
        }
        return Err(EngineError::InvalidBpmn(format!(
            "timerEventDefinition on `{}` has no timeDuration/timeDate/timeCycle",
            e.attr("id").unwrap_or("?")
        )));
    }
    if let Some(msg) = e.child("messageEventDefinition") {
        let message_ref = msg.attr("messageRef").unwrap_or_default();
        let name = ctx
            .message_names
            .get(message_ref)
            .cloned()
            .unwrap_or_else(|| message_ref.to_string());
        let correlation_key = e
            .child("extensionElements")
            .and_then(|ext| ext.child("correlationKey"))
            .map(|c| c.text.clone())
            .filter(|t| !t.is_empty());
        return Ok(EventDefinition::Message {
            name,
            correlation_key,
        });
    }
    if let Some(sig) = e.child("signalEventDefinition") {
        let signal_ref = sig.attr("signalRef").unwrap_or_default();
        let name = ctx
            .signal_names
            .get(signal_ref)
            .cloned()
            .unwrap_or_else(|| signal_ref.to_string());
        return Ok(EventDefinition::Signal { name });
    }
    if let Some(err) = e.child("errorEventDefinition") {
        let error_code = err.attr("errorRef").map(|r| {
            ctx.error_codes.get(r).cloned().unwrap_or_else(|| r.to_string())
        });
        return Ok(EventDefinition::Error { error_code });
    }
    if e.child("compensateEventDefinition").is_some() {
        let activity_id = e.attr("activityRef").map(str::to_string);
        return Ok(EventDefinition::Compensation { activity_id });
    }
    Ok(EventDefinition::None)
}

fn boundary_event(e: &XmlElement, ctx: &BuildCtx) -> Result<Node> {
    let id = required_attr(e, "id")?;
    let attached_to = required_attr(e, "attachedToRef")?;
    let interrupting = e
        .attr("cancelActivity")
        .map(|v| v != "false")
        .unwrap_or(true);
    let event_definition = event_definition_of(e, ctx)?;
    let timeout_ms = timeout_ms_of(e);
    Ok(Node {
        id,
        kind: NodeKind::BoundaryEvent {
            attached_to,
            event_definition,
            interrupting,
            timeout_ms,
        },
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}

fn intermediate_event(e: &XmlElement, ctx: &BuildCtx) -> Result<Node> {
    let id = required_attr(e, "id")?;
    let event_definition = event_definition_of(e, ctx)?;
    let timeout_ms = timeout_ms_of(e);
    Ok(Node {
        id,
        kind: NodeKind::IntermediateEvent {
            event_definition,
            timeout_ms,
        },
        parent_scope: None,
        incoming: Vec::new(),
        outgoing: Vec::new(),
    })
}
