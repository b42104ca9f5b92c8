//! Message correlation and wait/receive semantics. A catching
//! message event subscribes, then either the event bus wakes it when a
//! matching message is published, or it times out if the node carries a
//! boundary timeout.

use crate::error::{EngineError, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::state::StateManager;
use crate::types::{InstanceId, MessageSubscription, NodeId, Variable};
use std::sync::Arc;
use std::time::Duration;

pub struct MessageManager {
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
}

impl MessageManager {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub async fn subscribe(
        &self,
        instance_id: InstanceId,
        node_id: NodeId,
        message_name: String,
        correlation_value: Option<Variable>,
    ) -> Result<()> {
        self.store
            .subscribe_message(MessageSubscription {
                message_name: message_name.clone(),
                instance_id,
                node_id: node_id.clone(),
                correlation_value,
            })
            .await?;
        self.events
            .publish("process.message_subscribed", RuntimeEvent::MessageSubscribed { message_name, node_id });
        Ok(())
    }

    /// Block until a matching message is published or `timeout_ms` elapses.
    /// `None` means wait indefinitely (no boundary timer attached). Callers
    /// must call this immediately after `subscribe` — the wake-up rides the
    /// broadcast bus, not the subscription record, so a publish landing
    /// between the two calls would be missed.
    pub async fn wait_for_message(
        &self,
        instance_id: InstanceId,
        node_id: &str,
        message_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let mut receiver = self.events.subscribe();
        let wait = async {
            loop {
                match receiver.recv().await {
                    Ok((_, RuntimeEvent::MessageReceived {
                        message_name: received_name,
                        node_id: received_node,
                        ..
                    })) if received_name == message_name && received_node == node_id => return Ok(()),
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::Storage("event bus closed while waiting".to_string()))
                    }
                }
            }
        };

        match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), wait)
                .await
                .map_err(|_| EngineError::MessageTimeout {
                    name: message_name.to_string(),
                    timeout_ms: ms,
                })?,
            None => wait.await,
        }?;

        self.store.unsubscribe_message(instance_id, node_id).await
    }

    /// Publish a message, returning every subscription it correlated to.
    /// Each matched subscriber is unsubscribed (a message is consumed once).
    pub async fn publish(
        &self,
        message_name: &str,
        correlation_value: Option<&Variable>,
    ) -> Result<Vec<MessageSubscription>> {
        let matches = self.store.find_message_subscribers(message_name, correlation_value).await?;
        for m in &matches {
            self.store.unsubscribe_message(m.instance_id, &m.node_id).await?;
            self.events.publish(
                "process.message_received",
                RuntimeEvent::MessageReceived {
                    message_name: message_name.to_string(),
                    node_id: m.node_id.clone(),
                    correlation_value: correlation_value.cloned(),
                },
            );
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStateManager;

    #[tokio::test]
    async fn subscribe_then_publish_correlates() {
        let store: Arc<dyn StateManager> = Arc::new(MemoryStateManager::new());
        let events = Arc::new(EventBus::default());
        let mgr = MessageManager::new(store.clone(), events);

        let instance_id = uuid::Uuid::new_v4();
        let correlation = Variable::String("order-42".to_string());
        mgr.subscribe(instance_id, "catch1".to_string(), "OrderPaid".to_string(), Some(correlation.clone()))
            .await
            .unwrap();

        let matches = mgr.publish("OrderPaid", Some(&correlation)).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].node_id, "catch1");

        // Consumed — publishing again should correlate to nothing.
        let second = mgr.publish("OrderPaid", Some(&correlation)).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn wait_times_out_without_a_message() {
        let store: Arc<dyn StateManager> = Arc::new(MemoryStateManager::new());
        let events = Arc::new(EventBus::default());
        let mgr = MessageManager::new(store, events);

        let instance_id = uuid::Uuid::new_v4();
        mgr.subscribe(instance_id, "catch1".to_string(), "Never".to_string(), None)
            .await
            .unwrap();
        let err = mgr
            .wait_for_message(instance_id, "catch1", "Never", Some(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "MESSAGE_TIMEOUT");
    }
}
