//! Shared context handed to every engine system.

use std::sync::Arc;

use conveyor_run_backend::RunBackend;
use conveyor_shared_store::SharedStore;

use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::run_lock::RunLocker;
use crate::run_queue::RunQueue;

/// Built once per engine and cloned into each system's constructor.
#[derive(Clone)]
pub struct SystemResources {
    pub backend: Arc<dyn RunBackend>,
    pub store: Arc<dyn SharedStore>,
    pub events: EventBus,
    pub run_lock: RunLocker,
    pub run_queue: RunQueue,
    pub config: Arc<EngineConfig>,
}

impl SystemResources {
    pub fn new(
        backend: Arc<dyn RunBackend>,
        store: Arc<dyn SharedStore>,
        config: EngineConfig,
    ) -> Self {
        let run_queue = RunQueue::new(store.clone(), config.run_queue.clone());
        let run_lock = RunLocker::new(
            store.clone(),
            run_queue.keys().clone(),
            config.run_lock.clone(),
        );
        Self {
            backend,
            store,
            events: EventBus::default(),
            run_lock,
            run_queue,
            config: Arc::new(config),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}
