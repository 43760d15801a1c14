use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use conveyor_backend_memory::{MemoryBackend, MemorySharedStore};
use conveyor_run_backend::{CreateSnapshotRecord, RunBackend};
use conveyor_run_core::{
    EnvironmentType, ExecutionStatus, QueueId, RunId, RunStatus, RuntimeEnvironment,
    SnapshotMetadata, TaskQueue, TaskRun,
};

use crate::config::{EngineConfig, RunLockConfig};
use crate::resources::SystemResources;

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        run_lock: RunLockConfig {
            timeout: Duration::from_secs(2),
            lease_duration: Duration::from_secs(10),
            retry_delay: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    }
}

pub(crate) fn environment(environment_type: EnvironmentType, limit: u32) -> RuntimeEnvironment {
    RuntimeEnvironment {
        id: format!("env_{}", environment_type.as_str().to_lowercase()),
        organization_id: "org_1".to_string(),
        project_id: "proj_1".to_string(),
        environment_type,
        maximum_concurrency_limit: limit,
    }
}

pub(crate) struct Fixture {
    pub backend: MemoryBackend,
    pub store: MemorySharedStore,
    pub resources: SystemResources,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let backend = MemoryBackend::new();
        let store = MemorySharedStore::new();
        let resources =
            SystemResources::new(Arc::new(backend.clone()), Arc::new(store.clone()), config);
        Self {
            backend,
            store,
            resources,
        }
    }

    pub async fn seed_queue(
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
        self.backend.upsert_queue(&queue).await.expect("upsert queue");
        queue
    }

    pub async fn seed_run(&self, environment_type: EnvironmentType) -> TaskRun {
        self.seed_run_in(&environment(environment_type, 10), None).await
    }

    /// Creates the run with its RUN_CREATED snapshot.
    pub async fn seed_run_in(
        &self,
        environment: &RuntimeEnvironment,
        queue: Option<&TaskQueue>,
    ) -> TaskRun {
        self.backend
            .upsert_environment(environment)
            .await
            .expect("upsert environment");
        self.resources
            .run_queue
            .update_env_concurrency_limit(environment)
            .await
            .expect("env limit");

        let now = Utc::now();
        let run = TaskRun {
            id: RunId::new(),
            status: RunStatus::Pending,
            attempt_number: None,
            task_identifier: "my-task".to_string(),
            queue: queue.map_or_else(|| "task/my-task".to_string(), |queue| queue.name.clone()),
            concurrency_key: None,
            worker_queue: "main".to_string(),
            machine_preset: None,
            organization_id: environment.organization_id.clone(),
            project_id: environment.project_id.clone(),
            environment_id: environment.id.clone(),
            environment_type: environment.environment_type,
            locked_queue_id: queue.map(|queue| queue.id),
            created_at: now,
            updated_at: now,
        };
        self.backend.create_run(&run).await.expect("create run");
        self.backend
            .create_snapshot(&CreateSnapshotRecord {
                run_id: run.id,
                expected_previous: None,
                execution_status: ExecutionStatus::RunCreated,
                run_status: run.status,
                description: "Run was created".to_string(),
                attempt_number: None,
                completed_waitpoints: Vec::new(),
                checkpoint_id: None,
                worker_id: None,
                runner_id: None,
                metadata: SnapshotMetadata::default(),
            })
            .await
            .expect("initial snapshot");
        run
    }
}
