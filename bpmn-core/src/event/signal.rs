//! Signal broadcast. Unlike messages, signals are not correlated — a
//! broadcast wakes every current subscriber across every instance.

use crate::error::Result;
use crate::events::{EventBus, RuntimeEvent};
use crate::state::StateManager;
use crate::types::{InstanceId, NodeId, SignalSubscription};
use std::sync::Arc;

pub struct SignalManager {
    store: Arc<dyn StateManager>,
    events: Arc<EventBus>,
}

impl SignalManager {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub async fn subscribe(&self, instance_id: InstanceId, node_id: NodeId, signal_name: String) -> Result<()> {
        self.store
            .subscribe_signal(SignalSubscription {
                signal_name,
                instance_id,
                node_id,
            })
            .await
    }

    /// Broadcast a signal, unsubscribing and returning every matched catcher.
    pub async fn broadcast(&self, signal_name: &str) -> Result<Vec<SignalSubscription>> {
        let matches = self.store.find_signal_subscribers(signal_name).await?;
        for m in &matches {
            self.store.unsubscribe_signal(m.instance_id, &m.node_id).await?;
        }
        self.events.publish(
            "process.signal_broadcast",
            RuntimeEvent::SignalBroadcast {
                signal_name: signal_name.to_string(),
                matched_subscribers: matches.len(),
            },
        );
        Ok(matches)
    }
}
