//! SubprocessManager: enter/exit/complete for subprocess and transaction
//! scopes, over the arbitrary `parent_scope` chain this crate's graph
//! supports (not just a fixed root/subprocess nesting).

use crate::error::Result;
use crate::events::{EventBus, RuntimeEvent};
use crate::state::StateManager;
use crate::types::{InstanceId, NodeId, ScopeId, Token};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct SubprocessManager {
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
}

impl SubprocessManager {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Move a token into a subprocess/transaction/event-subprocess, creating
    /// its scope. The new token starts at the scope's own start event, with
    /// `scope_id` set to the subprocess node's id.
    pub async fn enter(&self, token: &Token, subprocess_id: &NodeId, scope_start_node: &NodeId) -> Result<Token> {
        self.store
            .cas_token_state(token.id, crate::types::TokenState::Active, crate::types::TokenState::Completed)
            .await?;
        let entered = token.moved_to(scope_start_node.clone(), Some(subprocess_id.clone()));
        self.store.create_token(&entered).await?;
        self.events.publish(
            "process.subprocess_entered",
            RuntimeEvent::SubprocessEntered {
                scope_id: subprocess_id.clone(),
            },
        );
        Ok(entered)
    }

    /// Complete a subprocess at its end event: apply the `output_vars`
    /// mapping (subprocess var -> parent var) into the enclosing scope, purge
    /// every variable the subprocess owned, consume the token, and place a
    /// fresh token at `next_task_id` in the enclosing scope.
    pub async fn complete(
        &self,
        token: &Token,
        scope_id: ScopeId,
        parent_scope: Option<ScopeId>,
        next_task_id: &NodeId,
        output_vars: &BTreeMap<String, String>,
    ) -> Result<Token> {
        if !output_vars.is_empty() {
            let subprocess_vars = self.store.all_variables(token.instance_id, Some(scope_id.clone())).await?;
            for (parent_var, subprocess_var) in output_vars {
                if let Some(value) = subprocess_vars.get(subprocess_var) {
                    self.store
                        .set_variable(token.instance_id, parent_scope.clone(), parent_var, value.clone())
                        .await?;
                }
            }
        }

        self.store
            .cas_token_state(token.id, crate::types::TokenState::Active, crate::types::TokenState::Completed)
            .await?;
        self.store.clear_scope(token.instance_id, scope_id.clone()).await?;

        let exited = token.moved_to(next_task_id.clone(), parent_scope);
        self.store.create_token(&exited).await?;
        self.events.publish(
            "process.subprocess_completed",
            RuntimeEvent::SubprocessCompleted { scope_id },
        );
        Ok(exited)
    }

    /// Cancel a transaction scope (internal cancel end event fired): purge
    /// its variables and tokens without running the normal completion path.
    /// The caller is responsible for driving compensation before calling
    /// this — compensation never crosses the transaction boundary
    /// automatically.
    pub async fn cancel_transaction(&self, instance_id: InstanceId, scope_id: ScopeId, reason: String) -> Result<()> {
        self.store.clear_scope(instance_id, scope_id.clone()).await?;
        self.events.publish(
            "process.transaction_cancelled",
            RuntimeEvent::TransactionCancelled { scope_id, reason },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStateManager;
    use crate::types::Variable;

    #[tokio::test]
    async fn complete_maps_outputs_and_purges_scope() {
        let store: Arc<dyn StateManager> = Arc::new(MemoryStateManager::new());
        let events = Arc::new(EventBus::default());
        let mgr = SubprocessManager::new(store.clone(), events);

        let instance_id = uuid::Uuid::new_v4();
        store
            .set_variable(instance_id, Some("sub1".to_string()), "approved", Variable::Boolean(true))
            .await
            .unwrap();

        let token = Token::new(instance_id, "sub_end", Some("sub1".to_string()));
        let mut output_vars = BTreeMap::new();
        output_vars.insert("order_approved".to_string(), "approved".to_string());

        let exited = mgr
            .complete(&token, "sub1".to_string(), None, &"after_sub".to_string(), &output_vars)
            .await
            .unwrap();
        assert_eq!(exited.node_id, "after_sub");
        assert_eq!(exited.scope_id, None);

        let parent_vars = store.all_variables(instance_id, None).await.unwrap();
        assert_eq!(parent_vars.get("order_approved"), Some(&Variable::Boolean(true)));

        let leftover = store.all_variables(instance_id, Some("sub1".to_string())).await.unwrap();
        assert!(leftover.is_empty());
    }
}
