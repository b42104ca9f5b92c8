//! In-memory [`StateManager`], the only backend: a single `RwLock<Inner>`
//! guarding plain collections, one lock acquisition per call.

use super::{JoinArrival, StateManager};
use crate::error::{EngineError, Result};
use crate::types::{
    ActivityLogEntry, CompensationHandlerEntry, InstanceId, InstanceStatus, MessageSubscription,
    NodeId, ProcessInstanceRecord, Saga, ScopeId, SignalSubscription, TimerState, Token, TokenState,
    Variable,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

struct JoinBarrier {
    expected: BTreeSet<String>,
    arrived: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<InstanceId, ProcessInstanceRecord>,
    tokens: HashMap<Uuid, Token>,
    variables: HashMap<(InstanceId, Option<ScopeId>), BTreeMap<String, Variable>>,
    timers: HashMap<String, TimerState>,
    message_subs: Vec<MessageSubscription>,
    signal_subs: Vec<SignalSubscription>,
    compensation_handlers: HashMap<(InstanceId, ScopeId), Vec<CompensationHandlerEntry>>,
    compensation_seq: u64,
    joins: HashMap<(InstanceId, NodeId), JoinBarrier>,
    sagas: HashMap<(InstanceId, String), Saga>,
    activity_log: HashMap<InstanceId, Vec<ActivityLogEntry>>,
}

/// In-memory implementation of [`StateManager`]. Not durable across process
/// restarts — the Postgres backend (behind the `postgres` feature) is the
/// production choice.
pub struct MemoryStateManager {
    inner: RwLock<Inner>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn create_instance(&self, record: &ProcessInstanceRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(record.instance_id, record.clone());
        Ok(())
    }

    async fn load_instance(&self, id: InstanceId) -> Result<ProcessInstanceRecord> {
        let r = self.inner.read().await;
        r.instances
            .get(&id)
            .cloned()
            .ok_or(EngineError::InstanceNotFound(id))
    }

    async fn update_instance_status(&self, id: InstanceId, status: InstanceStatus) -> Result<()> {
        let mut w = self.inner.write().await;
        let inst = w
            .instances
            .get_mut(&id)
            .ok_or(EngineError::InstanceNotFound(id))?;
        inst.status = status;
        if matches!(status, InstanceStatus::Completed | InstanceStatus::Error) {
            inst.ended_at = Some(now());
        }
        Ok(())
    }

    async fn create_token(&self, token: &Token) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_token(&self, token_id: Uuid) -> Result<Token> {
        let r = self.inner.read().await;
        r.tokens.get(&token_id).cloned().ok_or_else(|| EngineError::TokenState {
            token_id,
            expected: "<any>".to_string(),
            actual: "<missing>".to_string(),
        })
    }

    async fn tokens_in_instance(&self, instance_id: InstanceId) -> Result<Vec<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn cas_token_state(&self, token_id: Uuid, expected: TokenState, new: TokenState) -> Result<()> {
        let mut w = self.inner.write().await;
        let token = w.tokens.get_mut(&token_id).ok_or_else(|| EngineError::TokenState {
            token_id,
            expected: expected.to_string(),
            actual: "<missing>".to_string(),
        })?;
        if token.state != expected {
            return Err(EngineError::TokenState {
                token_id,
                expected: expected.to_string(),
                actual: token.state.to_string(),
            });
        }
        token.state = new;
        Ok(())
    }

    async fn put_token(&self, token: &Token) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn delete_token(&self, token_id: Uuid) -> Result<()> {
        let mut w = self.inner.write().await;
        w.tokens.remove(&token_id);
        Ok(())
    }

    async fn get_variable(
        &self,
        instance_id: InstanceId,
        scope_chain: &[Option<ScopeId>],
        name: &str,
    ) -> Result<Option<Variable>> {
        let r = self.inner.read().await;
        for scope in scope_chain {
            if let Some(vars) = r.variables.get(&(instance_id, scope.clone())) {
                if let Some(v) = vars.get(name) {
                    return Ok(Some(v.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn set_variable(
        &self,
        instance_id: InstanceId,
        scope_id: Option<ScopeId>,
        name: &str,
        value: Variable,
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        w.variables
            .entry((instance_id, scope_id))
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn all_variables(
        &self,
        instance_id: InstanceId,
        scope_id: Option<ScopeId>,
    ) -> Result<BTreeMap<String, Variable>> {
        let r = self.inner.read().await;
        Ok(r.variables.get(&(instance_id, scope_id)).cloned().unwrap_or_default())
    }

    async fn clear_scope(&self, instance_id: InstanceId, scope_id: ScopeId) -> Result<()> {
        let mut w = self.inner.write().await;
        w.variables.remove(&(instance_id, Some(scope_id)));
        Ok(())
    }

    async fn save_timer(&self, timer: &TimerState) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timers.insert(timer.timer_id.clone(), timer.clone());
        Ok(())
    }

    async fn delete_timer(&self, timer_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timers.remove(timer_id);
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerState>> {
        let r = self.inner.read().await;
        Ok(r.timers.values().filter(|t| t.end_time <= now).cloned().collect())
    }

    async fn timers_for_instance(&self, instance_id: InstanceId) -> Result<Vec<TimerState>> {
        let r = self.inner.read().await;
        Ok(r.timers
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn subscribe_message(&self, sub: MessageSubscription) -> Result<()> {
        let mut w = self.inner.write().await;
        w.message_subs.push(sub);
        Ok(())
    }

    async fn unsubscribe_message(&self, instance_id: InstanceId, node_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.message_subs
            .retain(|s| !(s.instance_id == instance_id && s.node_id == node_id));
        Ok(())
    }

    async fn find_message_subscribers(
        &self,
        message_name: &str,
        correlation_value: Option<&Variable>,
    ) -> Result<Vec<MessageSubscription>> {
        let r = self.inner.read().await;
        Ok(r.message_subs
            .iter()
            .filter(|s| {
                s.message_name == message_name
                    && match (&s.correlation_value, correlation_value) {
                        (Some(expected), Some(actual)) => expected == actual,
                        (None, _) => true,
                        (Some(_), None) => false,
                    }
            })
            .cloned()
            .collect())
    }

    async fn subscribe_signal(&self, sub: SignalSubscription) -> Result<()> {
        let mut w = self.inner.write().await;
        w.signal_subs.push(sub);
        Ok(())
    }

    async fn unsubscribe_signal(&self, instance_id: InstanceId, node_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.signal_subs
            .retain(|s| !(s.instance_id == instance_id && s.node_id == node_id));
        Ok(())
    }

    async fn find_signal_subscribers(&self, signal_name: &str) -> Result<Vec<SignalSubscription>> {
        let r = self.inner.read().await;
        Ok(r.signal_subs
            .iter()
            .filter(|s| s.signal_name == signal_name)
            .cloned()
            .collect())
    }

    async fn register_compensation_handler(&self, mut entry: CompensationHandlerEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        w.compensation_seq += 1;
        entry.registered_seq = w.compensation_seq;
        w.compensation_handlers
            .entry((entry.instance_id, entry.scope_id.clone()))
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn compensation_handlers(
        &self,
        instance_id: InstanceId,
        scope_id: &ScopeId,
    ) -> Result<Vec<CompensationHandlerEntry>> {
        let r = self.inner.read().await;
        let mut handlers = r
            .compensation_handlers
            .get(&(instance_id, scope_id.clone()))
            .cloned()
            .unwrap_or_default();
        handlers.sort_by(|a, b| match (a.execution_order, b.execution_order) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.registered_seq.cmp(&b.registered_seq),
        });
        Ok(handlers)
    }

    async fn clear_compensation_handlers(&self, instance_id: InstanceId, scope_id: &ScopeId) -> Result<()> {
        let mut w = self.inner.write().await;
        w.compensation_handlers.remove(&(instance_id, scope_id.clone()));
        Ok(())
    }

    async fn register_join(&self, instance_id: InstanceId, join_id: &NodeId, expected_paths: &[String]) -> Result<()> {
        let mut w = self.inner.write().await;
        w.joins
            .entry((instance_id, join_id.clone()))
            .or_insert_with(|| JoinBarrier {
                expected: expected_paths.iter().cloned().collect(),
                arrived: BTreeSet::new(),
            });
        Ok(())
    }

    async fn join_arrive(&self, instance_id: InstanceId, join_id: &NodeId, path_id: &str) -> Result<JoinArrival> {
        let mut w = self.inner.write().await;
        let barrier = w
            .joins
            .get_mut(&(instance_id, join_id.clone()))
            .ok_or_else(|| EngineError::JoinUnregistered {
                join_id: join_id.clone(),
                path_id: path_id.to_string(),
            })?;
        if !barrier.expected.contains(path_id) {
            return Err(EngineError::JoinUnregistered {
                join_id: join_id.clone(),
                path_id: path_id.to_string(),
            });
        }
        if !barrier.arrived.insert(path_id.to_string()) {
            return Err(EngineError::JoinDuplicate {
                join_id: join_id.clone(),
                path_id: path_id.to_string(),
            });
        }
        if barrier.arrived.len() >= barrier.expected.len() {
            Ok(JoinArrival::Satisfied)
        } else {
            Ok(JoinArrival::Pending(barrier.arrived.len(), barrier.expected.len()))
        }
    }

    async fn reset_join(&self, instance_id: InstanceId, join_id: &NodeId) -> Result<()> {
        let mut w = self.inner.write().await;
        w.joins.remove(&(instance_id, join_id.clone()));
        Ok(())
    }

    async fn save_saga(&self, saga: &Saga) -> Result<()> {
        let mut w = self.inner.write().await;
        w.sagas.insert((saga.instance_id, saga.saga_id.clone()), saga.clone());
        Ok(())
    }

    async fn load_saga(&self, instance_id: InstanceId, saga_id: &str) -> Result<Saga> {
        let r = self.inner.read().await;
        r.sagas
            .get(&(instance_id, saga_id.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::Storage(format!("no saga `{saga_id}` for instance {instance_id}")))
    }

    async fn append_activity_log(&self, entry: ActivityLogEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        w.activity_log.entry(entry.instance_id).or_default().push(entry);
        Ok(())
    }

    async fn activity_log(&self, instance_id: InstanceId) -> Result<Vec<ActivityLogEntry>> {
        let r = self.inner.read().await;
        Ok(r.activity_log.get(&instance_id).cloned().unwrap_or_default())
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_instance() -> ProcessInstanceRecord {
        ProcessInstanceRecord {
            instance_id: Uuid::new_v4(),
            definition_id: "order-process".to_string(),
            version: 1,
            status: InstanceStatus::Running,
            started_at: now(),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn instance_round_trip() {
        let store = MemoryStateManager::new();
        let inst = new_instance();
        store.create_instance(&inst).await.unwrap();
        let loaded = store.load_instance(inst.instance_id).await.unwrap();
        assert_eq!(loaded.definition_id, "order-process");
    }

    #[tokio::test]
    async fn missing_instance_errors() {
        let store = MemoryStateManager::new();
        let err = store.load_instance(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "INSTANCE_NOT_FOUND");
    }

    #[tokio::test]
    async fn token_cas_rejects_stale_expectation() {
        let store = MemoryStateManager::new();
        let token = Token::new(Uuid::new_v4(), "task1", None);
        store.create_token(&token).await.unwrap();

        store
            .cas_token_state(token.id, TokenState::Active, TokenState::Completed)
            .await
            .unwrap();

        let err = store
            .cas_token_state(token.id, TokenState::Active, TokenState::Completed)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TOKEN_STATE");
    }

    #[tokio::test]
    async fn variable_parent_fallback_chain() {
        let store = MemoryStateManager::new();
        let instance_id = Uuid::new_v4();
        store
            .set_variable(instance_id, None, "order_id", Variable::String("o-1".to_string()))
            .await
            .unwrap();
        store
            .set_variable(instance_id, Some("sub1".to_string()), "item", Variable::Integer(3))
            .await
            .unwrap();

        let chain = vec![Some("sub1".to_string()), None];
        let item = store.get_variable(instance_id, &chain, "item").await.unwrap();
        assert_eq!(item, Some(Variable::Integer(3)));
        let order_id = store.get_variable(instance_id, &chain, "order_id").await.unwrap();
        assert_eq!(order_id, Some(Variable::String("o-1".to_string())));
        let missing = store.get_variable(instance_id, &chain, "nope").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn join_detects_duplicate_and_unregistered_arrivals() {
        let store = MemoryStateManager::new();
        let instance_id = Uuid::new_v4();
        let join_id = "gw1".to_string();
        store
            .register_join(instance_id, &join_id, &["f1".to_string(), "f2".to_string()])
            .await
            .unwrap();

        let first = store.join_arrive(instance_id, &join_id, "f1").await.unwrap();
        assert_eq!(first, JoinArrival::Pending(1, 2));

        let dup = store.join_arrive(instance_id, &join_id, "f1").await.unwrap_err();
        assert_eq!(dup.kind(), "JOIN_DUPLICATE");

        let unreg = store.join_arrive(instance_id, &join_id, "f9").await.unwrap_err();
        assert_eq!(unreg.kind(), "JOIN_UNREGISTERED");

        let second = store.join_arrive(instance_id, &join_id, "f2").await.unwrap();
        assert_eq!(second, JoinArrival::Satisfied);
    }

    #[tokio::test]
    async fn compensation_handlers_ordered_by_registration_on_ties() {
        let store = MemoryStateManager::new();
        let instance_id = Uuid::new_v4();
        let scope_id = "proc".to_string();
        for activity in ["a1", "a2", "a3"] {
            store
                .register_compensation_handler(CompensationHandlerEntry {
                    instance_id,
                    activity_id: activity.to_string(),
                    handler_id: format!("{activity}_compensate"),
                    scope_id: scope_id.clone(),
                    execution_order: None,
                    registered_seq: 0,
                })
                .await
                .unwrap();
        }
        let ordered = store.compensation_handlers(instance_id, &scope_id).await.unwrap();
        let ids: Vec<_> = ordered.iter().map(|h| h.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2", "a3"]);
    }
}
