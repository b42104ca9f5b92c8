//! EventHandler: start/end/intermediate/boundary event machinery, composed
//! from the focused submodules below.

pub mod compensation;
pub mod error_event;
pub mod event_subprocess;
pub mod message;
pub mod signal;
pub mod timer;

use crate::events::EventBus;
use crate::state::StateManager;
use compensation::CompensationScope;
use message::MessageManager;
use signal::SignalManager;
use std::sync::Arc;
use timer::TimerManager;

/// Groups the event collaborators the executor needs, one of each per engine
/// instance (they're cheap `Arc`-wrapped handles, not per-instance state).
pub struct EventHandler {
    pub timers: TimerManager,
    pub messages: MessageManager,
    pub signals: SignalManager,
    pub compensation: CompensationScope,
}

impl EventHandler {
    pub fn new(store: Arc<dyn StateManager>, events: Arc<EventBus>) -> Self {
        Self {
            timers: TimerManager::new(store.clone(), events.clone()),
            messages: MessageManager::new(store.clone(), events.clone()),
            signals: SignalManager::new(store.clone(), events.clone()),
            compensation: CompensationScope::new(store, events),
        }
    }
}
