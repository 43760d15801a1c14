use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use conveyor_backends_core::{BackendError, BackendResult};
use conveyor_run_backend::{
    BlockingState, CompleteWaitpointRecord, CreateCheckpointRecord, CreateSnapshotRecord,
    RunBackend, RunStatusUpdate,
};
use conveyor_run_core::{
    CheckpointId, ExecutionSnapshot, QueueId, RunId, RuntimeEnvironment, SnapshotId, TaskQueue,
    TaskRun, TaskRunCheckpoint, TenantDescriptor, Waitpoint, WaitpointId, WaitpointStatus,
};

#[derive(Default)]
struct SnapshotStore {
    by_id: HashMap<SnapshotId, ExecutionSnapshot>,
    by_run: HashMap<RunId, Vec<SnapshotId>>,
}

/// Relational store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    runs: Arc<Mutex<HashMap<RunId, TaskRun>>>,
    environments: Arc<Mutex<HashMap<String, RuntimeEnvironment>>>,
    queues: Arc<Mutex<HashMap<QueueId, TaskQueue>>>,
    snapshots: Arc<Mutex<SnapshotStore>>,
    checkpoints: Arc<Mutex<HashMap<CheckpointId, TaskRunCheckpoint>>>,
    waitpoints: Arc<Mutex<HashMap<WaitpointId, Waitpoint>>>,
    blocking: Arc<Mutex<HashMap<RunId, Vec<WaitpointId>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<TaskRun> {
        self.runs.lock().expect("runs poisoned").values().cloned().collect()
    }

    pub fn checkpoints(&self) -> Vec<TaskRunCheckpoint> {
        self.checkpoints
            .lock()
            .expect("checkpoints poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshots for a run in creation order.
    pub fn snapshots_for(&self, run_id: RunId) -> Vec<ExecutionSnapshot> {
        let guard = self.snapshots.lock().expect("snapshots poisoned");
        guard
            .by_run
            .get(&run_id)
            .map(|ids| ids.iter().filter_map(|id| guard.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    fn blocking_state_locked(
        run_id: RunId,
        rows: &[WaitpointId],
        waitpoints: &HashMap<WaitpointId, Waitpoint>,
    ) -> BlockingState {
        let (completed, pending): (Vec<WaitpointId>, Vec<WaitpointId>) =
            rows.iter().copied().partition(|id| {
                waitpoints
                    .get(id)
                    .is_some_and(|waitpoint| waitpoint.status == WaitpointStatus::Completed)
            });
        BlockingState {
            run_id,
            pending,
            completed,
        }
    }
}

#[async_trait::async_trait]
impl RunBackend for MemoryBackend {
    async fn create_run(&self, run: &TaskRun) -> BackendResult<()> {
        let mut guard = self.runs.lock().expect("runs poisoned");
        if guard.contains_key(&run.id) {
            return Err(BackendError::Conflict(format!("run {} already exists", run.id)));
        }
        guard.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> BackendResult<Option<TaskRun>> {
        Ok(self.runs.lock().expect("runs poisoned").get(&run_id).cloned())
    }

    async fn update_run_status(&self, update: &RunStatusUpdate) -> BackendResult<TaskRun> {
        let mut guard = self.runs.lock().expect("runs poisoned");
        let run = guard
            .get_mut(&update.run_id)
            .ok_or_else(|| BackendError::message(format!("run {} not found", update.run_id)))?;
        run.status = update.status;
        if let Some(attempt_number) = update.attempt_number {
            run.attempt_number = Some(attempt_number);
        }
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn upsert_environment(&self, environment: &RuntimeEnvironment) -> BackendResult<()> {
        self.environments
            .lock()
            .expect("environments poisoned")
            .insert(environment.id.clone(), environment.clone());
        Ok(())
    }

    async fn get_environment(
        &self,
        environment_id: &str,
    ) -> BackendResult<Option<RuntimeEnvironment>> {
        Ok(self
            .environments
            .lock()
            .expect("environments poisoned")
            .get(environment_id)
            .cloned())
    }

    async fn upsert_queue(&self, queue: &TaskQueue) -> BackendResult<()> {
        self.queues
            .lock()
            .expect("queues poisoned")
            .insert(queue.id, queue.clone());
        Ok(())
    }

    async fn get_queue(&self, queue_id: QueueId) -> BackendResult<Option<TaskQueue>> {
        Ok(self.queues.lock().expect("queues poisoned").get(&queue_id).cloned())
    }

    async fn create_snapshot(
        &self,
        record: &CreateSnapshotRecord,
    ) -> BackendResult<ExecutionSnapshot> {
        let run = self
            .runs
            .lock()
            .expect("runs poisoned")
            .get(&record.run_id)
            .cloned()
            .ok_or_else(|| BackendError::message(format!("run {} not found", record.run_id)))?;

        let mut guard = self.snapshots.lock().expect("snapshots poisoned");
        let latest = guard
            .by_run
            .get(&record.run_id)
            .and_then(|ids| ids.last())
            .copied();
        if latest != record.expected_previous {
            return Err(BackendError::Conflict(format!(
                "run {} latest snapshot is {:?}, expected {:?}",
                record.run_id, latest, record.expected_previous
            )));
        }

        let snapshot = ExecutionSnapshot {
            id: SnapshotId::new(),
            run_id: record.run_id,
            execution_status: record.execution_status,
            run_status: record.run_status,
            description: record.description.clone(),
            attempt_number: record.attempt_number,
            previous_snapshot_id: record.expected_previous,
            completed_waitpoints: record.completed_waitpoints.clone(),
            checkpoint_id: record.checkpoint_id,
            worker_id: record.worker_id.clone(),
            runner_id: record.runner_id.clone(),
            organization_id: run.organization_id,
            project_id: run.project_id,
            environment_id: run.environment_id,
            environment_type: run.environment_type,
            metadata: record.metadata.clone(),
            created_at: Utc::now(),
        };
        guard.by_id.insert(snapshot.id, snapshot.clone());
        guard.by_run.entry(snapshot.run_id).or_default().push(snapshot.id);
        Ok(snapshot)
    }

    async fn get_snapshot(
        &self,
        snapshot_id: SnapshotId,
    ) -> BackendResult<Option<ExecutionSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .expect("snapshots poisoned")
            .by_id
            .get(&snapshot_id)
            .cloned())
    }

    async fn get_latest_snapshot(
        &self,
        run_id: RunId,
    ) -> BackendResult<Option<ExecutionSnapshot>> {
        let guard = self.snapshots.lock().expect("snapshots poisoned");
        Ok(guard
            .by_run
            .get(&run_id)
            .and_then(|ids| ids.last())
            .and_then(|id| guard.by_id.get(id))
            .cloned())
    }

    async fn list_snapshots(&self, run_id: RunId) -> BackendResult<Vec<ExecutionSnapshot>> {
        Ok(self.snapshots_for(run_id))
    }

    async fn create_checkpoint(
        &self,
        record: &CreateCheckpointRecord,
    ) -> BackendResult<TaskRunCheckpoint> {
        let checkpoint = TaskRunCheckpoint {
            id: CheckpointId::new(),
            run_id: record.run.id,
            checkpoint_type: record.input.checkpoint_type,
            location: record.input.location.clone(),
            image_ref: record.input.image_ref.clone(),
            reason: record.input.reason.clone(),
            organization_id: record.run.organization_id.clone(),
            project_id: record.run.project_id.clone(),
            environment_id: record.run.environment_id.clone(),
            created_at: Utc::now(),
        };
        self.checkpoints
            .lock()
            .expect("checkpoints poisoned")
            .insert(checkpoint.id, checkpoint.clone());
        Ok(checkpoint)
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
    ) -> BackendResult<Option<TaskRunCheckpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .expect("checkpoints poisoned")
            .get(&checkpoint_id)
            .cloned())
    }

    async fn create_waitpoint(&self, tenant: &TenantDescriptor) -> BackendResult<Waitpoint> {
        let waitpoint = Waitpoint {
            id: WaitpointId::new(),
            status: WaitpointStatus::Pending,
            output: None,
            output_is_error: false,
            completed_at: None,
            organization_id: tenant.organization_id.clone(),
            project_id: tenant.project_id.clone(),
            environment_id: tenant.environment_id.clone(),
            created_at: Utc::now(),
        };
        self.waitpoints
            .lock()
            .expect("waitpoints poisoned")
            .insert(waitpoint.id, waitpoint.clone());
        Ok(waitpoint)
    }

    async fn get_waitpoint(&self, waitpoint_id: WaitpointId) -> BackendResult<Option<Waitpoint>> {
        Ok(self
            .waitpoints
            .lock()
            .expect("waitpoints poisoned")
            .get(&waitpoint_id)
            .cloned())
    }

    async fn complete_waitpoint(
        &self,
        record: &CompleteWaitpointRecord,
    ) -> BackendResult<(Waitpoint, Vec<RunId>)> {
        let waitpoint = {
            let mut guard = self.waitpoints.lock().expect("waitpoints poisoned");
            let waitpoint = guard.get_mut(&record.waitpoint_id).ok_or_else(|| {
                BackendError::message(format!("waitpoint {} not found", record.waitpoint_id))
            })?;
            if waitpoint.status == WaitpointStatus::Pending {
                waitpoint.status = WaitpointStatus::Completed;
                waitpoint.output = record.output.clone();
                waitpoint.output_is_error = record.output_is_error;
                waitpoint.completed_at = Some(Utc::now());
            }
            waitpoint.clone()
        };
        let blocked_runs = self
            .blocking
            .lock()
            .expect("blocking poisoned")
            .iter()
            .filter(|(_, rows)| rows.contains(&record.waitpoint_id))
            .map(|(run_id, _)| *run_id)
            .collect();
        Ok((waitpoint, blocked_runs))
    }

    async fn block_run_with_waitpoints(
        &self,
        run_id: RunId,
        waitpoint_ids: &[WaitpointId],
    ) -> BackendResult<BlockingState> {
        let waitpoints = self.waitpoints.lock().expect("waitpoints poisoned");
        if let Some(missing) = waitpoint_ids.iter().find(|id| !waitpoints.contains_key(id)) {
            return Err(BackendError::message(format!("waitpoint {missing} not found")));
        }
        let mut blocking = self.blocking.lock().expect("blocking poisoned");
        let rows = blocking.entry(run_id).or_default();
        for id in waitpoint_ids {
            if !rows.contains(id) {
                rows.push(*id);
            }
        }
        Ok(Self::blocking_state_locked(run_id, rows, &waitpoints))
    }

    async fn blocking_state(&self, run_id: RunId) -> BackendResult<BlockingState> {
        let waitpoints = self.waitpoints.lock().expect("waitpoints poisoned");
        let blocking = self.blocking.lock().expect("blocking poisoned");
        let rows = blocking.get(&run_id).map(Vec::as_slice).unwrap_or_default();
        Ok(Self::blocking_state_locked(run_id, rows, &waitpoints))
    }

    async fn clear_blocking_waitpoints(&self, run_id: RunId) -> BackendResult<()> {
        self.blocking.lock().expect("blocking poisoned").remove(&run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use conveyor_run_core::{
        EnvironmentType, ExecutionStatus, RunStatus, SnapshotMetadata,
    };

    use super::*;

    fn sample_run() -> TaskRun {
        TaskRun {
            id: RunId::new(),
            status: RunStatus::Pending,
            attempt_number: None,
            task_identifier: "send-email".to_string(),
            queue: "task/send-email".to_string(),
            concurrency_key: None,
            worker_queue: "main".to_string(),
            machine_preset: None,
            organization_id: "org_1".to_string(),
            project_id: "proj_1".to_string(),
            environment_id: "env_1".to_string(),
            environment_type: EnvironmentType::Production,
            locked_queue_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn snapshot_record(run_id: RunId, expected_previous: Option<SnapshotId>) -> CreateSnapshotRecord {
        CreateSnapshotRecord {
            run_id,
            expected_previous,
            execution_status: ExecutionStatus::Queued,
            run_status: RunStatus::Pending,
            description: "test".to_string(),
            attempt_number: None,
            completed_waitpoints: Vec::new(),
            checkpoint_id: None,
            worker_id: None,
            runner_id: None,
            metadata: SnapshotMetadata::default(),
        }
    }

    #[tokio::test]
    async fn create_snapshot_rejects_stale_previous() {
        let backend = MemoryBackend::new();
        let run = sample_run();
        backend.create_run(&run).await.expect("create run");

        let first = backend
            .create_snapshot(&snapshot_record(run.id, None))
            .await
            .expect("first snapshot");
        let second = backend
            .create_snapshot(&snapshot_record(run.id, Some(first.id)))
            .await
            .expect("second snapshot");
        assert_eq!(second.previous_snapshot_id, Some(first.id));

        let err = backend
            .create_snapshot(&snapshot_record(run.id, Some(first.id)))
            .await
            .expect_err("stale previous must conflict");
        assert!(err.is_conflict());
        assert_eq!(backend.snapshots_for(run.id).len(), 2);
    }

    #[tokio::test]
    async fn completing_waitpoint_unblocks_run() {
        let backend = MemoryBackend::new();
        let run = sample_run();
        backend.create_run(&run).await.expect("create run");
        let waitpoint = backend.create_waitpoint(&run.tenant()).await.expect("waitpoint");

        let state = backend
            .block_run_with_waitpoints(run.id, &[waitpoint.id])
            .await
            .expect("block");
        assert!(!state.is_unblocked());

        let (completed, runs) = backend
            .complete_waitpoint(&CompleteWaitpointRecord {
                waitpoint_id: waitpoint.id,
                output: Some(serde_json::json!({"ok": true})),
                output_is_error: false,
            })
            .await
            .expect("complete");
        assert_eq!(completed.status, WaitpointStatus::Completed);
        assert_eq!(runs, vec![run.id]);

        let state = backend.blocking_state(run.id).await.expect("state");
        assert!(state.is_unblocked());
        assert_eq!(state.completed, vec![waitpoint.id]);
    }
}
