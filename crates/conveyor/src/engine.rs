//! The public surface: one handle over every subsystem, sharing one
//! [`SystemResources`].

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use conveyor_run_backend::RunBackend;
use conveyor_run_core::{
    CheckpointInput, ExecutionSnapshot, ExecutionStatus, QueueDescriptor, QueueId, RunId,
    RunStatus, RuntimeEnvironment, SnapshotId, TaskQueue, TaskRun, TenantDescriptor, Waitpoint,
    WaitpointId,
};
use conveyor_shared_store::{RefillOutcome, SharedStore};

use crate::attempts::{AttemptOutcome, RunAttemptSystem, StartedAttempt};
use crate::checkpoint::{CheckpointSystem, ContinueRunExecutionResult, CreateCheckpointResult};
use crate::config::EngineConfig;
use crate::dequeue::{DequeueSystem, DequeuedMessage};
use crate::enqueue::{EnqueueRun, EnqueueSystem};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::fair_queue::{DrrScheduler, EnvironmentCapacity, FairDispatchTask, TenantQueues};
use crate::release_concurrency::{
    ReleaseConcurrencySweeper, ReleaseConcurrencySystem, ReleaseDecision,
};
use crate::resources::SystemResources;
use crate::snapshots::ExecutionSnapshotSystem;
use crate::waitpoints::WaitpointSystem;

/// A run to create and queue.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub environment_id: String,
    pub task_identifier: String,
    /// Locks the run to a registered queue. Without one the run goes to
    /// `task/<task_identifier>`.
    pub queue_id: Option<QueueId>,
    pub concurrency_key: Option<String>,
    pub worker_queue: String,
    pub machine_preset: Option<String>,
    /// Not dequeued before this time.
    pub available_at_ms: Option<i64>,
}

impl TriggerRequest {
    pub fn new(environment_id: impl Into<String>, task_identifier: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            task_identifier: task_identifier.into(),
            queue_id: None,
            concurrency_key: None,
            worker_queue: "main".to_string(),
            machine_preset: None,
            available_at_ms: None,
        }
    }

    pub fn with_queue(mut self, queue_id: QueueId) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn with_worker_queue(mut self, worker_queue: impl Into<String>) -> Self {
        self.worker_queue = worker_queue.into();
        self
    }
}

#[derive(Clone)]
pub struct RunEngine {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
    enqueue: EnqueueSystem,
    dequeue: DequeueSystem,
    attempts: RunAttemptSystem,
    checkpoints: CheckpointSystem,
    release: ReleaseConcurrencySystem,
    waitpoints: WaitpointSystem,
    scheduler: DrrScheduler,
}

impl RunEngine {
    pub fn new(
        backend: Arc<dyn RunBackend>,
        store: Arc<dyn SharedStore>,
        config: EngineConfig,
    ) -> Self {
        Self::from_resources(SystemResources::new(backend, store, config))
    }

    pub fn from_resources(resources: SystemResources) -> Self {
        let snapshots = ExecutionSnapshotSystem::new(resources.clone());
        let enqueue = EnqueueSystem::new(resources.clone(), snapshots.clone());
        let release = ReleaseConcurrencySystem::new(resources.clone(), snapshots.clone());
        let scheduler = DrrScheduler::new(
            resources.store.clone(),
            resources.run_queue.keys(),
            resources.config.fair_queue.clone(),
            Arc::new(EnvironmentCapacity::new(resources.run_queue.clone())),
        );
        Self {
            dequeue: DequeueSystem::new(resources.clone(), snapshots.clone()),
            attempts: RunAttemptSystem::new(resources.clone(), snapshots.clone(), enqueue.clone()),
            checkpoints: CheckpointSystem::new(
                resources.clone(),
                snapshots.clone(),
                enqueue.clone(),
                release.clone(),
            ),
            waitpoints: WaitpointSystem::new(
                resources.clone(),
                snapshots.clone(),
                enqueue.clone(),
                release.clone(),
            ),
            resources,
            snapshots,
            enqueue,
            release,
            scheduler,
        }
    }

    pub fn resources(&self) -> &SystemResources {
        &self.resources
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.resources.events.subscribe()
    }

    /// Store an environment and publish its concurrency limit to the run queue.
    pub async fn register_environment(&self, environment: &RuntimeEnvironment) -> EngineResult<()> {
        self.resources.backend.upsert_environment(environment).await?;
        self.resources
            .run_queue
            .update_env_concurrency_limit(environment)
            .await
    }

    /// Store a queue and publish (or clear) its concurrency limit.
    pub async fn register_queue(
        &self,
        environment: &RuntimeEnvironment,
        queue: &TaskQueue,
    ) -> EngineResult<()> {
        self.resources.backend.upsert_queue(queue).await?;
        let descriptor = QueueDescriptor {
            organization_id: environment.organization_id.clone(),
            project_id: environment.project_id.clone(),
            environment_id: environment.id.clone(),
            queue: queue.name.clone(),
            concurrency_key: None,
        };
        match queue.concurrency_limit {
            Some(limit) => {
                self.resources
                    .run_queue
                    .update_queue_concurrency_limit(&descriptor, limit)
                    .await
            }
            None => {
                self.resources
                    .run_queue
                    .remove_queue_concurrency_limit(&descriptor)
                    .await
            }
        }
    }

    /// Create a run with its RUN_CREATED snapshot and queue it.
    #[tracing::instrument(skip_all, fields(environment_id = %request.environment_id, task = %request.task_identifier))]
    pub async fn trigger(&self, request: TriggerRequest) -> EngineResult<TaskRun> {
        let environment = self
            .resources
            .backend
            .get_environment(&request.environment_id)
            .await?
            .ok_or_else(|| EngineError::EnvironmentNotFound(request.environment_id.clone()))?;

        let queue = match request.queue_id {
            Some(queue_id) => Some(
                self.resources
                    .backend
                    .get_queue(queue_id)
                    .await?
                    .ok_or_else(|| EngineError::integrity(format!("queue {queue_id} not found")))?,
            ),
            None => None,
        };

        let now = Utc::now();
        let run = TaskRun {
            id: RunId::new(),
            status: RunStatus::Pending,
            attempt_number: None,
            task_identifier: request.task_identifier.clone(),
            queue: queue.as_ref().map_or_else(
                || format!("task/{}", request.task_identifier),
                |queue| queue.name.clone(),
            ),
            concurrency_key: request.concurrency_key,
            worker_queue: request.worker_queue,
            machine_preset: request.machine_preset,
            organization_id: environment.organization_id.clone(),
            project_id: environment.project_id.clone(),
            environment_id: environment.id.clone(),
            environment_type: environment.environment_type,
            locked_queue_id: queue.as_ref().map(|queue| queue.id),
            created_at: now,
            updated_at: now,
        };
        self.resources.backend.create_run(&run).await?;
        self.snapshots.create_initial_snapshot(&run).await?;
        self.resources
            .run_queue
            .update_env_concurrency_limit(&environment)
            .await?;

        let mut enqueue = EnqueueRun::new(run.clone(), ExecutionStatus::Queued, "Run was queued");
        if let Some(timestamp_ms) = request.available_at_ms {
            enqueue = enqueue.available_at(timestamp_ms);
        }
        self.resources
            .run_lock
            .lock(run.id, |guard| async move {
                self.enqueue.enqueue_run(&guard, enqueue).await
            })
            .await?;

        info!(run_id = %run.id, queue = %run.queue, "run triggered");
        Ok(run)
    }

    #[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
    pub async fn create_checkpoint(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
        checkpoint: CheckpointInput,
    ) -> EngineResult<CreateCheckpointResult> {
        self.checkpoints
            .create_checkpoint(run_id, snapshot_id, checkpoint)
            .await
    }

    #[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
    pub async fn continue_run_execution(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<ContinueRunExecutionResult> {
        self.checkpoints
            .continue_run_execution(run_id, snapshot_id)
            .await
    }

    #[tracing::instrument(skip_all, fields(snapshot_id = %snapshot.id))]
    pub async fn release_concurrency_for_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> EngineResult<ReleaseDecision> {
        self.release.release_concurrency_for_snapshot(snapshot).await
    }

    pub async fn consume_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
    ) -> EngineResult<bool> {
        self.release.consume_token(tenant, releaser_id).await
    }

    pub async fn return_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
    ) -> EngineResult<f64> {
        self.release.return_token(tenant, releaser_id).await
    }

    pub async fn refill_tokens_for_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> EngineResult<RefillOutcome> {
        self.release.refill_tokens_for_snapshot(snapshot).await
    }

    /// Scan the master queue and run one DRR selection over it.
    #[tracing::instrument(skip_all)]
    pub async fn select_queues(&self) -> EngineResult<Vec<TenantQueues>> {
        let entries = self
            .resources
            .run_queue
            .scan_master_queue(self.resources.config.run_queue.master_queue_scan_limit)
            .await?;
        self.scheduler.select_queues(&entries).await
    }

    pub async fn record_processed(&self, tenant_id: &str, count: u32) -> EngineResult<f64> {
        self.scheduler.record_processed(tenant_id, count).await
    }

    pub async fn record_processed_batch(
        &self,
        processed: &[(String, u32)],
    ) -> EngineResult<Vec<f64>> {
        self.scheduler.record_processed_batch(processed).await
    }

    #[tracing::instrument(skip_all, fields(%worker_queue))]
    pub async fn dequeue_from_worker_queue(
        &self,
        worker_queue: &str,
    ) -> EngineResult<Option<DequeuedMessage>> {
        self.dequeue.dequeue_from_worker_queue(worker_queue).await
    }

    #[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
    pub async fn start_run_attempt(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<StartedAttempt> {
        self.attempts.start_run_attempt(run_id, snapshot_id).await
    }

    #[tracing::instrument(skip_all, fields(%run_id, %snapshot_id))]
    pub async fn complete_run_attempt(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
        outcome: AttemptOutcome,
    ) -> EngineResult<ExecutionSnapshot> {
        self.attempts
            .complete_run_attempt(run_id, snapshot_id, outcome)
            .await
    }

    #[tracing::instrument(skip_all, fields(%run_id))]
    pub async fn cancel_run(&self, run_id: RunId, reason: &str) -> EngineResult<ExecutionSnapshot> {
        self.attempts.cancel_run(run_id, reason).await
    }

    pub async fn create_waitpoint(&self, tenant: &TenantDescriptor) -> EngineResult<Waitpoint> {
        self.waitpoints.create_waitpoint(tenant).await
    }

    #[tracing::instrument(skip_all, fields(%run_id, waitpoints = waitpoint_ids.len()))]
    pub async fn block_run_with_waitpoints(
        &self,
        run_id: RunId,
        waitpoint_ids: &[WaitpointId],
    ) -> EngineResult<ExecutionSnapshot> {
        self.waitpoints
            .block_run_with_waitpoints(run_id, waitpoint_ids)
            .await
    }

    #[tracing::instrument(skip_all, fields(%waitpoint_id))]
    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: WaitpointId,
        output: Option<serde_json::Value>,
        output_is_error: bool,
    ) -> EngineResult<Waitpoint> {
        self.waitpoints
            .complete_waitpoint(waitpoint_id, output, output_is_error)
            .await
    }

    pub async fn latest_snapshot(&self, run_id: RunId) -> EngineResult<ExecutionSnapshot> {
        self.snapshots.get_latest_execution_snapshot(run_id).await
    }

    /// The run's snapshots, newest first.
    pub async fn snapshot_chain(&self, run_id: RunId) -> EngineResult<Vec<ExecutionSnapshot>> {
        self.snapshots.get_execution_snapshot_chain(run_id).await
    }

    pub async fn get_run(&self, run_id: RunId) -> EngineResult<TaskRun> {
        self.resources
            .backend
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    pub fn release_concurrency_sweeper(&self) -> ReleaseConcurrencySweeper {
        ReleaseConcurrencySweeper {
            system: Arc::new(self.release.clone()),
            config: self.resources.config.release_concurrency.clone(),
        }
    }

    pub fn fair_dispatch_task(&self) -> FairDispatchTask {
        FairDispatchTask {
            scheduler: self.scheduler.clone(),
            run_queue: self.resources.run_queue.clone(),
        }
    }

    /// Start the release sweeper and the fair dispatch loop. Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn_background_tasks(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeper = self.release_concurrency_sweeper();
        let dispatch = self.fair_dispatch_task();
        vec![
            tokio::spawn(sweeper.run(shutdown.clone().cancelled_owned())),
            tokio::spawn(dispatch.run(shutdown.clone().cancelled_owned())),
        ]
    }
}
