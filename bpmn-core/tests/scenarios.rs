//! End-to-end scenarios driving a full `Executor` against literal BPMN XML
//! fixtures and a `MemoryStateManager`, the way a deployed engine would see
//! these processes: sequence flow, exclusive choice, parallel split/join,
//! message correlation, an interrupting timer boundary, and saga-style
//! compensation on failure.

use async_trait::async_trait;
use bpmn_core::graph::parse_bpmn;
use bpmn_core::types::{InstanceStatus, ProcessInstanceRecord};
use bpmn_core::{
    EngineError, EventBus, Executor, MemoryStateManager, Result, ServiceTask, ServiceTaskContext,
    ServiceTaskRegistry, StateManager, Token, TokenState, Variable,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn new_engine(xml: &str, services: ServiceTaskRegistry) -> (Executor, Arc<dyn StateManager>) {
    let graph = Arc::new(parse_bpmn(xml).expect("valid BPMN fixture"));
    let store: Arc<dyn StateManager> = Arc::new(MemoryStateManager::new());
    let events = Arc::new(EventBus::default());
    let executor = Executor::new(graph, store.clone(), events, Arc::new(services));
    (executor, store)
}

// ── 1. Plain sequence flow ──────────────────────────────────────────

#[tokio::test]
async fn sequence_flow_runs_start_to_end() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p1">
            <startEvent id="start"/>
            <scriptTask id="compute"><script>set_variable("total", ${19.99})</script></scriptTask>
            <endEvent id="end"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="compute"/>
            <sequenceFlow id="f2" sourceRef="compute" targetRef="end"/>
          </process>
        </definitions>
    "#;
    let (executor, store) = new_engine(xml, ServiceTaskRegistry::new());

    let instance_id = executor.start_instance("sequence-proc").await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    let vars = store.all_variables(instance_id, None).await.unwrap();
    assert_eq!(vars.get("total"), Some(&Variable::Float(19.99)));

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    let end = tokens.iter().find(|t| t.node_id == "end").expect("token reached end");
    assert_eq!(end.state, TokenState::Completed);
}

// ── 2. Exclusive gateway ─────────────────────────────────────────────

#[tokio::test]
async fn exclusive_gateway_takes_matching_condition_over_default() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p1">
            <startEvent id="start"/>
            <scriptTask id="setAmount"><script>set_variable("amount", ${1500})</script></scriptTask>
            <exclusiveGateway id="gw" default="fLow"/>
            <scriptTask id="highValue"><script>set_variable("branch", ${"high"})</script></scriptTask>
            <scriptTask id="lowValue"><script>set_variable("branch", ${"low"})</script></scriptTask>
            <endEvent id="endHigh"/>
            <endEvent id="endLow"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="setAmount"/>
            <sequenceFlow id="f2" sourceRef="setAmount" targetRef="gw"/>
            <sequenceFlow id="fHigh" sourceRef="gw" targetRef="highValue">
              <conditionExpression>${amount > 1000}</conditionExpression>
            </sequenceFlow>
            <sequenceFlow id="fLow" sourceRef="gw" targetRef="lowValue"/>
            <sequenceFlow id="f3" sourceRef="highValue" targetRef="endHigh"/>
            <sequenceFlow id="f4" sourceRef="lowValue" targetRef="endLow"/>
          </process>
        </definitions>
    "#;
    let (executor, store) = new_engine(xml, ServiceTaskRegistry::new());

    let instance_id = executor.start_instance("exclusive-proc").await.unwrap();

    let vars = store.all_variables(instance_id, None).await.unwrap();
    assert_eq!(vars.get("branch"), Some(&Variable::String("high".to_string())));

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(tokens.iter().any(|t| t.node_id == "endHigh" && t.state == TokenState::Completed));
    assert!(!tokens.iter().any(|t| t.node_id == "endLow"));
}

// ── 3. Parallel split and join ───────────────────────────────────────

#[tokio::test]
async fn parallel_gateway_splits_and_joins_once() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p1">
            <startEvent id="start"/>
            <parallelGateway id="split"/>
            <scriptTask id="taskA"><script>set_variable("a", ${1})</script></scriptTask>
            <scriptTask id="taskB"><script>set_variable("b", ${2})</script></scriptTask>
            <parallelGateway id="join"/>
            <endEvent id="done"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="split"/>
            <sequenceFlow id="f2" sourceRef="split" targetRef="taskA"/>
            <sequenceFlow id="f3" sourceRef="split" targetRef="taskB"/>
            <sequenceFlow id="f4" sourceRef="taskA" targetRef="join"/>
            <sequenceFlow id="f5" sourceRef="taskB" targetRef="join"/>
            <sequenceFlow id="f6" sourceRef="join" targetRef="done"/>
          </process>
        </definitions>
    "#;
    let (executor, store) = new_engine(xml, ServiceTaskRegistry::new());

    let instance_id = executor.start_instance("parallel-proc").await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    let vars = store.all_variables(instance_id, None).await.unwrap();
    assert_eq!(vars.get("a"), Some(&Variable::Integer(1)));
    assert_eq!(vars.get("b"), Some(&Variable::Integer(2)));

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    let done_tokens: Vec<_> = tokens.iter().filter(|t| t.node_id == "done").collect();
    assert_eq!(done_tokens.len(), 1, "join must fire exactly once");
    assert_eq!(done_tokens[0].state, TokenState::Completed);
}

// ── 4. Message correlation ───────────────────────────────────────────

#[tokio::test]
async fn message_catch_event_waits_then_wakes_on_correlated_delivery() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <message id="m1" name="OrderApproved"/>
          <process id="p1">
            <startEvent id="start"/>
            <scriptTask id="setOrder"><script>set_variable("orderId", ${"ORD-1"})</script></scriptTask>
            <intermediateCatchEvent id="waitApproval">
              <messageEventDefinition messageRef="m1"/>
              <extensionElements><correlationKey>${orderId}</correlationKey></extensionElements>
            </intermediateCatchEvent>
            <endEvent id="approved"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="setOrder"/>
            <sequenceFlow id="f2" sourceRef="setOrder" targetRef="waitApproval"/>
            <sequenceFlow id="f3" sourceRef="waitApproval" targetRef="approved"/>
          </process>
        </definitions>
    "#;
    let (executor, store) = new_engine(xml, ServiceTaskRegistry::new());

    let instance_id = executor.start_instance("message-proc").await.unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running, "waits for the message before completing");
    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(tokens.iter().any(|t| t.node_id == "waitApproval" && t.state == TokenState::Waiting));

    // A delivery with the wrong correlation value must not wake this instance.
    executor
        .deliver_message("OrderApproved", Some(&Variable::String("ORD-OTHER".to_string())))
        .await
        .unwrap();
    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);

    executor
        .deliver_message("OrderApproved", Some(&Variable::String("ORD-1".to_string())))
        .await
        .unwrap();

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(tokens.iter().any(|t| t.node_id == "approved" && t.state == TokenState::Completed));
}

// ── 5. Interrupting timer boundary event ─────────────────────────────

struct SlowTask {
    sleep_for: Duration,
}

#[async_trait]
impl ServiceTask for SlowTask {
    async fn execute(&self, _ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>> {
        tokio::time::sleep(self.sleep_for).await;
        Ok(BTreeMap::from([("called".to_string(), Variable::Boolean(true))]))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupting_timer_boundary_cancels_the_slow_activity() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p1">
            <startEvent id="start"/>
            <serviceTask id="call"><extensionElements><taskType>slow_call</taskType></extensionElements></serviceTask>
            <boundaryEvent id="timeout" attachedToRef="call" cancelActivity="true">
              <timerEventDefinition><timeDuration>PT0.02S</timeDuration></timerEventDefinition>
            </boundaryEvent>
            <endEvent id="done"/>
            <endEvent id="timedOut"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="call"/>
            <sequenceFlow id="f2" sourceRef="call" targetRef="done"/>
            <sequenceFlow id="f3" sourceRef="timeout" targetRef="timedOut"/>
          </process>
        </definitions>
    "#;
    let mut registry = ServiceTaskRegistry::new();
    registry.register("slow_call", Arc::new(SlowTask { sleep_for: Duration::from_millis(250) }));
    let (executor, store) = new_engine(xml, registry);
    let executor = Arc::new(executor);

    // start_instance only returns once the instance settles, so the instance
    // has to be seeded by hand to get an id back before the slow task's
    // dispatch (and its timer boundary) are actually in flight.
    let instance_id = uuid::Uuid::now_v7();
    store
        .create_instance(&ProcessInstanceRecord {
            instance_id,
            definition_id: "slow-proc".to_string(),
            version: 1,
            status: InstanceStatus::Running,
            started_at: chrono::Utc::now(),
            ended_at: None,
        })
        .await
        .unwrap();
    let start_token = Token::new(instance_id, "start".to_string(), None);
    store.create_token(&start_token).await.unwrap();

    let runner = executor.clone();
    let run_handle = tokio::spawn(async move { runner.run_to_completion(instance_id).await });

    // The boundary timer (20ms) is armed the moment "call" is dispatched and
    // is overdue well before the slow task (250ms) finishes.
    tokio::time::sleep(Duration::from_millis(120)).await;
    executor.poll_timers(instance_id).await.unwrap();

    run_handle.await.unwrap().unwrap();

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(
        tokens.iter().any(|t| t.node_id == "timedOut" && t.state == TokenState::Completed),
        "the boundary's path must have run"
    );
    assert!(
        tokens.iter().any(|t| t.node_id == "call" && t.state == TokenState::Cancelled),
        "the slow activity must have been cancelled"
    );
    assert!(
        !tokens.iter().any(|t| t.node_id == "done"),
        "the activity's own outgoing flow must not also have fired"
    );
}

// ── 6. Saga-style compensation on failure ────────────────────────────

struct AlwaysSucceeds;

#[async_trait]
impl ServiceTask for AlwaysSucceeds {
    async fn execute(&self, _ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>> {
        Ok(BTreeMap::from([("charged".to_string(), Variable::Boolean(true))]))
    }
}

struct AlwaysFails {
    error_code: Option<String>,
}

#[async_trait]
impl ServiceTask for AlwaysFails {
    async fn execute(&self, _ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>> {
        Err(EngineError::ServiceTaskFailed {
            task_type: "charge_fails".to_string(),
            message: "payment gateway rejected the charge".to_string(),
            error_code: self.error_code.clone(),
        })
    }
}

struct Refund {
    ran: Arc<AtomicBool>,
}

#[async_trait]
impl ServiceTask for Refund {
    async fn execute(&self, _ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>> {
        self.ran.store(true, Ordering::SeqCst);
        Ok(BTreeMap::new())
    }
}

#[tokio::test]
async fn boundary_error_triggers_compensation_of_the_prior_activity() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p1">
            <startEvent id="start"/>
            <serviceTask id="chargeA"><extensionElements><taskType>charge</taskType></extensionElements></serviceTask>
            <boundaryEvent id="compA" attachedToRef="chargeA" cancelActivity="false">
              <compensateEventDefinition/>
            </boundaryEvent>
            <serviceTask id="refund"><extensionElements><taskType>refund</taskType></extensionElements></serviceTask>
            <serviceTask id="chargeB"><extensionElements><taskType>charge_fails</taskType></extensionElements></serviceTask>
            <boundaryEvent id="errB" attachedToRef="chargeB" cancelActivity="true">
              <errorEventDefinition/>
            </boundaryEvent>
            <intermediateThrowEvent id="compensateAll"><compensateEventDefinition/></intermediateThrowEvent>
            <endEvent id="normalEnd"/>
            <endEvent id="compensatedEnd"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="chargeA"/>
            <sequenceFlow id="f2" sourceRef="chargeA" targetRef="chargeB"/>
            <sequenceFlow id="f3" sourceRef="chargeB" targetRef="normalEnd"/>
            <sequenceFlow id="f4" sourceRef="compA" targetRef="refund"/>
            <sequenceFlow id="f5" sourceRef="errB" targetRef="compensateAll"/>
            <sequenceFlow id="f6" sourceRef="compensateAll" targetRef="compensatedEnd"/>
          </process>
        </definitions>
    "#;
    let refunded = Arc::new(AtomicBool::new(false));
    let mut registry = ServiceTaskRegistry::new();
    registry.register("charge", Arc::new(AlwaysSucceeds));
    registry.register("charge_fails", Arc::new(AlwaysFails { error_code: None }));
    registry.register("refund", Arc::new(Refund { ran: refunded.clone() }));
    let (executor, store) = new_engine(xml, registry);

    let instance_id = executor.start_instance("saga-proc").await.unwrap();

    assert!(refunded.load(Ordering::SeqCst), "the compensation handler for chargeA must have run");

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(tokens.iter().any(|t| t.node_id == "compensatedEnd" && t.state == TokenState::Completed));
    assert!(
        !tokens.iter().any(|t| t.node_id == "normalEnd"),
        "the failed activity's own success path must not have fired"
    );
}

// ── 7. Exact error code wins over a catch-all boundary ───────────────

#[tokio::test]
async fn exact_error_code_boundary_is_preferred_over_catch_all() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <error id="errInsufficientFunds" errorCode="INSUFFICIENT_FUNDS"/>
          <process id="p1">
            <startEvent id="start"/>
            <serviceTask id="charge"><extensionElements><taskType>charge_fails</taskType></extensionElements></serviceTask>
            <boundaryEvent id="catchAll" attachedToRef="charge" cancelActivity="true">
              <errorEventDefinition/>
            </boundaryEvent>
            <boundaryEvent id="catchExact" attachedToRef="charge" cancelActivity="true">
              <errorEventDefinition errorRef="errInsufficientFunds"/>
            </boundaryEvent>
            <endEvent id="normalEnd"/>
            <endEvent id="catchAllEnd"/>
            <endEvent id="exactEnd"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="charge"/>
            <sequenceFlow id="f2" sourceRef="charge" targetRef="normalEnd"/>
            <sequenceFlow id="f3" sourceRef="catchAll" targetRef="catchAllEnd"/>
            <sequenceFlow id="f4" sourceRef="catchExact" targetRef="exactEnd"/>
          </process>
        </definitions>
    "#;
    let mut registry = ServiceTaskRegistry::new();
    registry.register(
        "charge_fails",
        Arc::new(AlwaysFails { error_code: Some("INSUFFICIENT_FUNDS".to_string()) }),
    );
    let (executor, store) = new_engine(xml, registry);

    let instance_id = executor.start_instance("exact-code-proc").await.unwrap();

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(
        tokens.iter().any(|t| t.node_id == "exactEnd" && t.state == TokenState::Completed),
        "the exact-error-code boundary must claim the error over the catch-all"
    );
    assert!(!tokens.iter().any(|t| t.node_id == "catchAllEnd"));
    assert!(!tokens.iter().any(|t| t.node_id == "normalEnd"));
}

// ── 8. Transaction cancel end event runs compensation, skips output_vars ──

struct Reserve;

#[async_trait]
impl ServiceTask for Reserve {
    async fn execute(&self, _ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>> {
        Ok(BTreeMap::new())
    }
}

struct UndoReserve {
    ran: Arc<AtomicBool>,
}

#[async_trait]
impl ServiceTask for UndoReserve {
    async fn execute(&self, _ctx: ServiceTaskContext<'_>) -> Result<BTreeMap<String, Variable>> {
        self.ran.store(true, Ordering::SeqCst);
        Ok(BTreeMap::new())
    }
}

#[tokio::test]
async fn transaction_cancel_end_event_compensates_and_skips_output_vars() {
    let xml = r#"
        <definitions xmlns="http://www.omg.org/spec/BPMN/20100524/MODEL">
          <process id="p1">
            <startEvent id="start"/>
            <scriptTask id="setFlag"><script>set_variable("shouldCancel", ${true})</script></scriptTask>
            <transaction id="txn">
              <startEvent id="txnStart"/>
              <serviceTask id="reserve"><extensionElements><taskType>reserve</taskType></extensionElements></serviceTask>
              <boundaryEvent id="compReserve" attachedToRef="reserve" cancelActivity="false">
                <compensateEventDefinition/>
              </boundaryEvent>
              <serviceTask id="undoReserve"><extensionElements><taskType>undo_reserve</taskType></extensionElements></serviceTask>
              <exclusiveGateway id="check" default="toSuccess"/>
              <scriptTask id="setConfirmed"><script>set_variable("confirmed", ${true})</script></scriptTask>
              <endEvent id="txnSuccess"/>
              <endEvent id="txnCancelled"><cancelEventDefinition/></endEvent>
              <extensionElements>
                <outputVars><var parent="confirmationId" subprocess="confirmed"/></outputVars>
              </extensionElements>
              <sequenceFlow id="tf1" sourceRef="txnStart" targetRef="reserve"/>
              <sequenceFlow id="tf2" sourceRef="reserve" targetRef="check"/>
              <sequenceFlow id="tf3" sourceRef="check" targetRef="txnCancelled">
                <conditionExpression>${shouldCancel}</conditionExpression>
              </sequenceFlow>
              <sequenceFlow id="toSuccess" sourceRef="check" targetRef="setConfirmed"/>
              <sequenceFlow id="tf4" sourceRef="setConfirmed" targetRef="txnSuccess"/>
              <sequenceFlow id="compFlow" sourceRef="compReserve" targetRef="undoReserve"/>
            </transaction>
            <endEvent id="after"/>
            <sequenceFlow id="f1" sourceRef="start" targetRef="setFlag"/>
            <sequenceFlow id="f2" sourceRef="setFlag" targetRef="txn"/>
            <sequenceFlow id="f3" sourceRef="txn" targetRef="after"/>
          </process>
        </definitions>
    "#;
    let undone = Arc::new(AtomicBool::new(false));
    let mut registry = ServiceTaskRegistry::new();
    registry.register("reserve", Arc::new(Reserve));
    registry.register("undo_reserve", Arc::new(UndoReserve { ran: undone.clone() }));
    let (executor, store) = new_engine(xml, registry);

    let instance_id = executor.start_instance("txn-proc").await.unwrap();

    assert!(undone.load(Ordering::SeqCst), "cancelling the transaction must compensate the reservation");

    let instance = store.load_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);

    let tokens = store.tokens_in_instance(instance_id).await.unwrap();
    assert!(tokens.iter().any(|t| t.node_id == "after" && t.state == TokenState::Completed));
    assert!(
        !tokens.iter().any(|t| t.node_id == "txnSuccess"),
        "the transaction's normal success path must not also have fired"
    );

    let vars = store.all_variables(instance_id, None).await.unwrap();
    assert!(
        vars.get("confirmationId").is_none(),
        "a cancelled transaction must not apply its output_vars mapping"
    );
}
