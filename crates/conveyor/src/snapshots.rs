//! Execution snapshot chain.
//!
//! Snapshots are append-only. Every write goes through the backend's
//! conditional create with the latest id read under the run lock, so a writer
//! that lost its lease cannot fork the chain.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use conveyor_run_backend::CreateSnapshotRecord;
use conveyor_run_core::{
    CheckpointId, ExecutionSnapshot, ExecutionStatus, RunId, RunStatus, SnapshotId,
    SnapshotMetadata, TaskRun, WaitpointId,
};

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;

/// Fields of the snapshot to append.
#[derive(Debug, Clone)]
pub struct CreateSnapshot {
    pub execution_status: ExecutionStatus,
    pub run_status: RunStatus,
    pub description: String,
    pub attempt_number: Option<u32>,
    pub completed_waitpoints: Vec<WaitpointId>,
    pub checkpoint_id: Option<CheckpointId>,
    pub worker_id: Option<String>,
    pub runner_id: Option<String>,
    pub metadata: SnapshotMetadata,
}

impl CreateSnapshot {
    /// Snapshot carrying the run's current status and attempt.
    pub fn new(execution_status: ExecutionStatus, run: &TaskRun, description: impl Into<String>) -> Self {
        Self {
            execution_status,
            run_status: run.status,
            description: description.into(),
            attempt_number: run.attempt_number,
            completed_waitpoints: Vec::new(),
            checkpoint_id: None,
            worker_id: None,
            runner_id: None,
            metadata: SnapshotMetadata::default(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_id: Option<CheckpointId>) -> Self {
        self.checkpoint_id = checkpoint_id;
        self
    }

    pub fn with_completed_waitpoints(mut self, waitpoints: Vec<WaitpointId>) -> Self {
        self.completed_waitpoints = waitpoints;
        self
    }

    pub fn with_metadata(mut self, metadata: SnapshotMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_worker(mut self, worker_id: Option<String>, runner_id: Option<String>) -> Self {
        self.worker_id = worker_id;
        self.runner_id = runner_id;
        self
    }
}

#[derive(Clone)]
pub struct ExecutionSnapshotSystem {
    resources: SystemResources,
}

impl ExecutionSnapshotSystem {
    pub fn new(resources: SystemResources) -> Self {
        Self { resources }
    }

    /// The RUN_CREATED snapshot that starts a run's chain.
    pub async fn create_initial_snapshot(&self, run: &TaskRun) -> EngineResult<ExecutionSnapshot> {
        let snapshot = self
            .resources
            .backend
            .create_snapshot(&CreateSnapshotRecord {
                run_id: run.id,
                expected_previous: None,
                execution_status: ExecutionStatus::RunCreated,
                run_status: run.status,
                description: "Run was created".to_string(),
                attempt_number: run.attempt_number,
                completed_waitpoints: Vec::new(),
                checkpoint_id: None,
                worker_id: None,
                runner_id: None,
                metadata: SnapshotMetadata::default(),
            })
            .await?;
        self.emit_created(&snapshot);
        Ok(snapshot)
    }

    /// Append a snapshot after validating the transition from the latest one.
    pub async fn create_execution_snapshot(
        &self,
        guard: &RunLockGuard,
        run: &TaskRun,
        create: CreateSnapshot,
    ) -> EngineResult<ExecutionSnapshot> {
        guard.ensure_holds(run.id)?;
        let latest = self.get_latest_execution_snapshot(run.id).await?;
        if !latest
            .execution_status
            .can_transition_to(create.execution_status)
        {
            return Err(EngineError::validation(
                409,
                format!(
                    "Cannot move run {} from {} to {}",
                    run.id, latest.execution_status, create.execution_status
                ),
            ));
        }

        let record = CreateSnapshotRecord {
            run_id: run.id,
            expected_previous: Some(latest.id),
            execution_status: create.execution_status,
            run_status: create.run_status,
            description: create.description,
            attempt_number: create.attempt_number,
            completed_waitpoints: create.completed_waitpoints,
            checkpoint_id: create.checkpoint_id,
            worker_id: create.worker_id,
            runner_id: create.runner_id,
            metadata: create.metadata,
        };
        let snapshot = match self.resources.backend.create_snapshot(&record).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_conflict() => {
                return Err(EngineError::integrity(format!(
                    "snapshot chain for run {} changed while locked: {err}",
                    run.id
                )));
            }
            Err(err) => return Err(err.into()),
        };
        debug!(
            run_id = %run.id,
            snapshot_id = %snapshot.id,
            from = %latest.execution_status,
            to = %snapshot.execution_status,
            "execution snapshot created"
        );
        self.emit_created(&snapshot);
        Ok(snapshot)
    }

    pub async fn get_latest_execution_snapshot(
        &self,
        run_id: RunId,
    ) -> EngineResult<ExecutionSnapshot> {
        self.resources
            .backend
            .get_latest_snapshot(run_id)
            .await?
            .ok_or_else(|| EngineError::integrity(format!("run {run_id} has no execution snapshot")))
    }

    pub async fn get_snapshot(&self, snapshot_id: SnapshotId) -> EngineResult<ExecutionSnapshot> {
        self.resources
            .backend
            .get_snapshot(snapshot_id)
            .await?
            .ok_or(EngineError::SnapshotNotFound(snapshot_id))
    }

    /// The chain from the latest snapshot back to RUN_CREATED, latest first.
    pub async fn get_execution_snapshot_chain(
        &self,
        run_id: RunId,
    ) -> EngineResult<Vec<ExecutionSnapshot>> {
        let latest = self.get_latest_execution_snapshot(run_id).await?;
        let mut by_id: HashMap<SnapshotId, ExecutionSnapshot> = self
            .resources
            .backend
            .list_snapshots(run_id)
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.id, snapshot))
            .collect();

        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut next = Some(latest.id);
        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(EngineError::integrity(format!(
                    "snapshot chain for run {run_id} loops at {id}"
                )));
            }
            let snapshot = by_id.remove(&id).ok_or_else(|| {
                EngineError::integrity(format!(
                    "snapshot chain for run {run_id} references missing snapshot {id}"
                ))
            })?;
            next = snapshot.previous_snapshot_id;
            chain.push(snapshot);
        }

        if let Some(first) = chain.last()
            && first.execution_status != ExecutionStatus::RunCreated
        {
            return Err(EngineError::integrity(format!(
                "snapshot chain for run {run_id} starts at {}",
                first.execution_status
            )));
        }
        Ok(chain)
    }

    /// Snapshots created after `snapshot_id`, oldest first.
    pub async fn get_execution_snapshots_since(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<Vec<ExecutionSnapshot>> {
        let snapshots = self.resources.backend.list_snapshots(run_id).await?;
        let position = snapshots
            .iter()
            .position(|snapshot| snapshot.id == snapshot_id)
            .ok_or(EngineError::SnapshotNotFound(snapshot_id))?;
        Ok(snapshots.into_iter().skip(position + 1).collect())
    }

    fn emit_created(&self, snapshot: &ExecutionSnapshot) {
        self.resources.events.emit(EngineEvent::ExecutionSnapshotCreated {
            run_id: snapshot.run_id,
            snapshot_id: snapshot.id,
            execution_status: snapshot.execution_status,
            description: snapshot.description.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use conveyor_run_core::EnvironmentType;

    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn transitions_extend_the_chain() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let snapshots = ExecutionSnapshotSystem::new(fixture.resources.clone());

        let queued = fixture
            .resources
            .run_lock
            .lock(run.id, |guard| {
                let snapshots = snapshots.clone();
                let run = run.clone();
                async move {
                    snapshots
                        .create_execution_snapshot(
                            &guard,
                            &run,
                            CreateSnapshot::new(ExecutionStatus::Queued, &run, "Run was queued"),
                        )
                        .await
                }
            })
            .await
            .expect("queued");

        let chain = snapshots
            .get_execution_snapshot_chain(run.id)
            .await
            .expect("chain");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, queued.id);
        assert_eq!(chain[1].execution_status, ExecutionStatus::RunCreated);
        assert_eq!(queued.previous_snapshot_id, Some(chain[1].id));

        let since = snapshots
            .get_execution_snapshots_since(run.id, chain[1].id)
            .await
            .expect("since");
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, queued.id);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let snapshots = ExecutionSnapshotSystem::new(fixture.resources.clone());

        let err = fixture
            .resources
            .run_lock
            .lock(run.id, |guard| {
                let snapshots = snapshots.clone();
                let run = run.clone();
                async move {
                    snapshots
                        .create_execution_snapshot(
                            &guard,
                            &run,
                            CreateSnapshot::new(ExecutionStatus::Executing, &run, "skip ahead"),
                        )
                        .await
                }
            })
            .await
            .expect_err("RUN_CREATED cannot jump to EXECUTING");
        assert!(matches!(err, EngineError::ServiceValidation { status: 409, .. }));

        let latest = snapshots
            .get_latest_execution_snapshot(run.id)
            .await
            .expect("latest");
        assert_eq!(latest.execution_status, ExecutionStatus::RunCreated);
    }

    #[tokio::test]
    async fn guard_for_another_run_is_rejected() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let other = fixture.seed_run(EnvironmentType::Production).await;
        let snapshots = ExecutionSnapshotSystem::new(fixture.resources.clone());

        let err = fixture
            .resources
            .run_lock
            .lock(other.id, |guard| {
                let snapshots = snapshots.clone();
                let run = run.clone();
                async move {
                    snapshots
                        .create_execution_snapshot(
                            &guard,
                            &run,
                            CreateSnapshot::new(ExecutionStatus::Queued, &run, "wrong lock"),
                        )
                        .await
                }
            })
            .await
            .expect_err("guard mismatch");
        assert!(matches!(err, EngineError::Integrity(_)));
    }

    #[tokio::test]
    async fn missing_run_has_no_latest_snapshot() {
        let fixture = Fixture::new();
        let snapshots = ExecutionSnapshotSystem::new(fixture.resources.clone());
        let err = snapshots
            .get_latest_execution_snapshot(RunId::new())
            .await
            .expect_err("no snapshot");
        assert!(matches!(err, EngineError::Integrity(_)));
    }
}
