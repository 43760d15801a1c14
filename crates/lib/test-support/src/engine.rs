use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use conveyor::attempts::StartedAttempt;
use conveyor::config::{EngineConfig, ReleaseConcurrencyConfig, RunLockConfig};
use conveyor::dequeue::DequeuedMessage;
use conveyor::{RunEngine, TriggerRequest};
use conveyor_backend_memory::{MemoryBackend, MemorySharedStore};
use conveyor_run_core::{EnvironmentType, QueueId, RuntimeEnvironment, TaskQueue, TaskRun};

/// Short lock timings and sweeps so tests never wait on production defaults.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        run_lock: RunLockConfig {
            timeout: Duration::from_secs(2),
            lease_duration: Duration::from_secs(10),
            retry_delay: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(5),
        },
        release_concurrency: ReleaseConcurrencyConfig {
            poll_interval: Duration::from_millis(20),
            releasings_poll_interval: Duration::from_millis(50),
            ..ReleaseConcurrencyConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub fn environment(id: &str, environment_type: EnvironmentType, limit: u32) -> RuntimeEnvironment {
    RuntimeEnvironment {
        id: id.to_string(),
        organization_id: "org_1".to_string(),
        project_id: "proj_1".to_string(),
        environment_type,
        maximum_concurrency_limit: limit,
    }
}

/// An engine over fresh in-memory backends.
pub struct EngineHarness {
    pub engine: RunEngine,
    pub backend: MemoryBackend,
    pub store: MemorySharedStore,
    worker_queues: AtomicUsize,
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let backend = MemoryBackend::new();
        let store = MemorySharedStore::new();
        let engine = RunEngine::new(Arc::new(backend.clone()), Arc::new(store.clone()), config);
        Self {
            engine,
            backend,
            store,
            worker_queues: AtomicUsize::new(0),
        }
    }

    pub async fn register_environment(
        &self,
        id: &str,
        environment_type: EnvironmentType,
        limit: u32,
    ) -> RuntimeEnvironment {
        let environment = environment(id, environment_type, limit);
        self.engine
            .register_environment(&environment)
            .await
            .expect("register environment");
        environment
    }

    pub async fn register_queue(
        &self,
        environment: &RuntimeEnvironment,
        name: &str,
        concurrency_limit: Option<u32>,
        release_concurrency_on_waitpoint: bool,
    ) -> TaskQueue {
        let queue = TaskQueue {
            id: QueueId::new(),
            name: name.to_string(),
            environment_id: environment.id.clone(),
            concurrency_limit,
            release_concurrency_on_waitpoint,
        };
        self.engine
            .register_queue(environment, &queue)
            .await
            .expect("register queue");
        queue
    }

    pub async fn trigger(&self, environment: &RuntimeEnvironment) -> TaskRun {
        self.engine
            .trigger(TriggerRequest::new(environment.id.clone(), "my-task"))
            .await
            .expect("trigger")
    }

    /// Triggers onto a worker queue no other run shares, so the run can be
    /// picked up without draining anyone else's work.
    pub async fn trigger_isolated(
        &self,
        environment: &RuntimeEnvironment,
        queue: Option<&TaskQueue>,
    ) -> TaskRun {
        let worker_queue = format!(
            "worker-{}",
            self.worker_queues.fetch_add(1, Ordering::SeqCst)
        );
        let mut request =
            TriggerRequest::new(environment.id.clone(), "my-task").with_worker_queue(worker_queue);
        if let Some(queue) = queue {
            request = request.with_queue(queue.id);
        }
        self.engine.trigger(request).await.expect("trigger")
    }

    /// Dispatch rounds until one moves nothing. Returns the total dispatched.
    pub async fn dispatch_all(&self) -> usize {
        let task = self.engine.fair_dispatch_task();
        let mut total = 0;
        loop {
            let report = task.dispatch_round().await.expect("dispatch round");
            if report.total() == 0 {
                return total;
            }
            total += report.total();
        }
    }

    pub async fn dequeue(&self, run: &TaskRun) -> DequeuedMessage {
        self.dispatch_all().await;
        self.engine
            .dequeue_from_worker_queue(&run.worker_queue)
            .await
            .expect("dequeue")
            .expect("a dequeued message")
    }

    /// Dispatch, dequeue and start the run's attempt.
    pub async fn start(&self, run: &TaskRun) -> StartedAttempt {
        let message = self.dequeue(run).await;
        assert_eq!(message.run.id, run.id, "worker queue held another run");
        self.engine
            .start_run_attempt(run.id, message.snapshot.id)
            .await
            .expect("start attempt")
    }
}
