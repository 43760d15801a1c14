//! Attempt start/completion and cancellation.

use std::time::Duration;

use tracing::{info, warn};

use conveyor_run_backend::RunStatusUpdate;
use conveyor_run_core::{ExecutionSnapshot, ExecutionStatus, RunId, RunStatus, SnapshotId, TaskRun};

use crate::enqueue::{EnqueueRun, EnqueueSystem};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::now_ms;
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;
use crate::run_queue::NackResult;
use crate::snapshots::{CreateSnapshot, ExecutionSnapshotSystem};

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    /// `retry_delay` of `None` fails the run for good.
    Failure {
        error: String,
        retry_delay: Option<Duration>,
    },
}

#[derive(Debug, Clone)]
pub struct StartedAttempt {
    pub run: TaskRun,
    pub snapshot: ExecutionSnapshot,
}

#[derive(Clone)]
pub struct RunAttemptSystem {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
    enqueue: EnqueueSystem,
}

impl RunAttemptSystem {
    pub fn new(
        resources: SystemResources,
        snapshots: ExecutionSnapshotSystem,
        enqueue: EnqueueSystem,
    ) -> Self {
        Self {
            resources,
            snapshots,
            enqueue,
        }
    }

    pub async fn start_run_attempt(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<StartedAttempt> {
        self.resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.start_run_attempt_locked(&guard, run_id, snapshot_id).await
            })
            .await
    }

    async fn start_run_attempt_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<StartedAttempt> {
        let run = self.get_run(run_id).await?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if latest.id != snapshot_id {
            return Err(EngineError::validation(400, "Not the latest snapshot"));
        }
        if !latest.execution_status.is_pending_executing() {
            return Err(EngineError::validation(
                400,
                format!("Status {} is not pending executing", latest.execution_status),
            ));
        }

        let attempt_number = run.attempt_number.unwrap_or(0) + 1;
        let run = self
            .update_run_status(run_id, RunStatus::Executing, Some(attempt_number))
            .await?;
        let snapshot = self
            .snapshots
            .create_execution_snapshot(
                guard,
                &run,
                CreateSnapshot::new(ExecutionStatus::Executing, &run, "Attempt created")
                    .with_completed_waitpoints(latest.completed_waitpoints),
            )
            .await?;
        info!(%run_id, attempt_number, snapshot_id = %snapshot.id, "run attempt started");
        Ok(StartedAttempt { run, snapshot })
    }

    pub async fn complete_run_attempt(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
        outcome: AttemptOutcome,
    ) -> EngineResult<ExecutionSnapshot> {
        self.resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.complete_run_attempt_locked(&guard, run_id, snapshot_id, outcome)
                    .await
            })
            .await
    }

    async fn complete_run_attempt_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
        snapshot_id: SnapshotId,
        outcome: AttemptOutcome,
    ) -> EngineResult<ExecutionSnapshot> {
        let run = self.get_run(run_id).await?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if latest.id != snapshot_id {
            return Err(EngineError::validation(400, "Not the latest snapshot"));
        }

        match latest.execution_status {
            ExecutionStatus::PendingCancel => {
                let snapshot = self
                    .finish_run_locked(guard, &run, RunStatus::Canceled, "Run was cancelled")
                    .await?;
                self.resources
                    .run_queue
                    .acknowledge_message(&run.queue_descriptor(), run_id)
                    .await?;
                return Ok(snapshot);
            }
            ExecutionStatus::Executing => {}
            status => {
                return Err(EngineError::validation(
                    400,
                    format!("Status {status} cannot complete an attempt"),
                ));
            }
        }

        match outcome {
            AttemptOutcome::Success => {
                let snapshot = self
                    .finish_run_locked(
                        guard,
                        &run,
                        RunStatus::CompletedSuccessfully,
                        "Run completed successfully",
                    )
                    .await?;
                self.resources
                    .run_queue
                    .acknowledge_message(&run.queue_descriptor(), run_id)
                    .await?;
                Ok(snapshot)
            }
            AttemptOutcome::Failure {
                error,
                retry_delay: Some(delay),
            } => {
                let retry_at = now_ms() + delay.as_millis() as i64;
                match self
                    .resources
                    .run_queue
                    .nack_message(&run.queue_descriptor(), run_id, retry_at)
                    .await?
                {
                    NackResult::Requeued { attempt } => {
                        let run = self
                            .update_run_status(run_id, RunStatus::Pending, None)
                            .await?;
                        info!(%run_id, attempt, %error, "run attempt failed, retrying");
                        self.snapshots
                            .create_execution_snapshot(
                                guard,
                                &run,
                                CreateSnapshot::new(
                                    ExecutionStatus::Queued,
                                    &run,
                                    "Run attempt failed, retrying",
                                ),
                            )
                            .await
                    }
                    NackResult::DeadLettered { attempt } => {
                        self.resources
                            .events
                            .emit(EngineEvent::RunDeadLettered { run_id, attempt });
                        self.finish_run_locked(
                            guard,
                            &run,
                            RunStatus::CompletedWithErrors,
                            "Run exhausted its delivery attempts",
                        )
                        .await
                    }
                    NackResult::Missing => {
                        warn!(%run_id, "retrying run without a queued message");
                        let run = self
                            .update_run_status(run_id, RunStatus::Pending, None)
                            .await?;
                        self.enqueue
                            .enqueue_run(
                                guard,
                                EnqueueRun::new(
                                    run,
                                    ExecutionStatus::Queued,
                                    "Run attempt failed, retrying",
                                )
                                .available_at(retry_at),
                            )
                            .await
                    }
                }
            }
            AttemptOutcome::Failure {
                error,
                retry_delay: None,
            } => {
                info!(%run_id, %error, "run attempt failed");
                let snapshot = self
                    .finish_run_locked(guard, &run, RunStatus::CompletedWithErrors, "Run failed")
                    .await?;
                self.resources
                    .run_queue
                    .acknowledge_message(&run.queue_descriptor(), run_id)
                    .await?;
                Ok(snapshot)
            }
        }
    }

    /// Cancel a run. Runs without a live runner finish immediately; the others
    /// move to PENDING_CANCEL and their runner is told to stop.
    pub async fn cancel_run(&self, run_id: RunId, reason: &str) -> EngineResult<ExecutionSnapshot> {
        self.resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.cancel_run_locked(&guard, run_id, reason).await
            })
            .await
    }

    async fn cancel_run_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
        reason: &str,
    ) -> EngineResult<ExecutionSnapshot> {
        let run = self.get_run(run_id).await?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        let status = latest.execution_status;
        if status.is_terminal() || status == ExecutionStatus::PendingCancel {
            return Ok(latest);
        }

        if status.is_cancellable_without_runner() {
            let snapshot = self
                .finish_run_locked(guard, &run, RunStatus::Canceled, &format!("Run was cancelled: {reason}"))
                .await?;
            self.resources
                .run_queue
                .acknowledge_message(&run.queue_descriptor(), run_id)
                .await?;
            info!(%run_id, from = %status, "run cancelled");
            return Ok(snapshot);
        }

        let snapshot = self
            .snapshots
            .create_execution_snapshot(
                guard,
                &run,
                CreateSnapshot::new(
                    ExecutionStatus::PendingCancel,
                    &run,
                    format!("Run was cancelled: {reason}"),
                ),
            )
            .await?;
        self.resources.events.emit(EngineEvent::WorkerNotification {
            run_id,
            snapshot_id: snapshot.id,
            execution_status: snapshot.execution_status,
        });
        info!(%run_id, from = %status, "run pending cancel");
        Ok(snapshot)
    }

    async fn finish_run_locked(
        &self,
        guard: &RunLockGuard,
        run: &TaskRun,
        status: RunStatus,
        description: &str,
    ) -> EngineResult<ExecutionSnapshot> {
        let run = self.update_run_status(run.id, status, None).await?;
        self.snapshots
            .create_execution_snapshot(
                guard,
                &run,
                CreateSnapshot::new(ExecutionStatus::Finished, &run, description),
            )
            .await
    }

    async fn get_run(&self, run_id: RunId) -> EngineResult<TaskRun> {
        self.resources
            .backend
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        attempt_number: Option<u32>,
    ) -> EngineResult<TaskRun> {
        let run = self
            .resources
            .backend
            .update_run_status(&RunStatusUpdate {
                run_id,
                status,
                attempt_number,
            })
            .await?;
        self.resources.events.emit(EngineEvent::RunStatusChanged {
            run_id,
            status,
            time: run.updated_at,
        });
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use conveyor_run_core::EnvironmentType;

    use super::*;
    use crate::testing::{Fixture, test_config};

    fn systems(fixture: &Fixture) -> (ExecutionSnapshotSystem, EnqueueSystem, RunAttemptSystem) {
        let snapshots = ExecutionSnapshotSystem::new(fixture.resources.clone());
        let enqueue = EnqueueSystem::new(fixture.resources.clone(), snapshots.clone());
        let attempts =
            RunAttemptSystem::new(fixture.resources.clone(), snapshots.clone(), enqueue.clone());
        (snapshots, enqueue, attempts)
    }

    /// Enqueue, pop from the queue and record PENDING_EXECUTING.
    async fn pending_executing(fixture: &Fixture, run: &TaskRun) -> ExecutionSnapshot {
        let (snapshots, enqueue, _) = systems(fixture);
        fixture
            .resources
            .run_lock
            .lock(run.id, |guard| {
                let request = EnqueueRun::new(run.clone(), ExecutionStatus::Queued, "queued");
                let enqueue = enqueue.clone();
                async move { enqueue.enqueue_run(&guard, request).await }
            })
            .await
            .expect("enqueue");

        let queue = &fixture.resources.run_queue;
        let queue_key = queue.keys().queue_key(&run.queue_descriptor()).expect("key");
        let popped = queue
            .dequeue_message_from_queue(&queue_key, 1)
            .await
            .expect("dequeue");
        assert_eq!(popped.len(), 1);

        fixture
            .resources
            .run_lock
            .lock(run.id, |guard| {
                let run = run.clone();
                async move {
                    snapshots
                        .create_execution_snapshot(
                            &guard,
                            &run,
                            CreateSnapshot::new(ExecutionStatus::PendingExecuting, &run, "dequeued"),
                        )
                        .await
                }
            })
            .await
            .expect("pending executing")
    }

    #[tokio::test]
    async fn successful_attempt_finishes_and_frees_concurrency() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let (_, _, attempts) = systems(&fixture);
        let pending = pending_executing(&fixture, &run).await;

        let started = attempts
            .start_run_attempt(run.id, pending.id)
            .await
            .expect("start");
        assert_eq!(started.run.attempt_number, Some(1));
        assert_eq!(started.run.status, RunStatus::Executing);

        let finished = attempts
            .complete_run_attempt(run.id, started.snapshot.id, AttemptOutcome::Success)
            .await
            .expect("complete");
        assert_eq!(finished.execution_status, ExecutionStatus::Finished);
        assert_eq!(finished.run_status, RunStatus::CompletedSuccessfully);

        let queue = &fixture.resources.run_queue;
        assert_eq!(
            queue
                .current_concurrency_of_environment(&run.tenant())
                .await
                .expect("env concurrency"),
            0
        );
        assert!(queue
            .read_message(&run.organization_id, run.id)
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_cannot_start_attempt() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let (_, _, attempts) = systems(&fixture);
        pending_executing(&fixture, &run).await;

        let err = attempts
            .start_run_attempt(run.id, SnapshotId::new())
            .await
            .expect_err("stale id");
        assert_eq!(err.to_string(), "Not the latest snapshot");
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_then_dead_letters() {
        let mut config = test_config();
        config.run_queue.max_attempts = 1;
        let fixture = Fixture::with_config(config);
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let (_, _, attempts) = systems(&fixture);
        let failure = || AttemptOutcome::Failure {
            error: "boom".to_string(),
            retry_delay: Some(Duration::ZERO),
        };

        let pending = pending_executing(&fixture, &run).await;
        let started = attempts.start_run_attempt(run.id, pending.id).await.expect("start");
        let retried = attempts
            .complete_run_attempt(run.id, started.snapshot.id, failure())
            .await
            .expect("retry");
        assert_eq!(retried.execution_status, ExecutionStatus::Queued);
        let queue = &fixture.resources.run_queue;
        assert_eq!(queue.length_of_queue(&run.queue_descriptor()).await.expect("len"), 1);

        // Second failure passes max_attempts.
        let queue_key = queue.keys().queue_key(&run.queue_descriptor()).expect("key");
        assert_eq!(queue.dequeue_message_from_queue(&queue_key, 1).await.expect("pop").len(), 1);
        let (snapshots, _, _) = systems(&fixture);
        let pending = fixture
            .resources
            .run_lock
            .lock(run.id, |guard| {
                let run = run.clone();
                async move {
                    snapshots
                        .create_execution_snapshot(
                            &guard,
                            &run,
                            CreateSnapshot::new(ExecutionStatus::PendingExecuting, &run, "dequeued"),
                        )
                        .await
                }
            })
            .await
            .expect("pending");
        let started = attempts.start_run_attempt(run.id, pending.id).await.expect("start");
        assert_eq!(started.run.attempt_number, Some(2));
        let finished = attempts
            .complete_run_attempt(run.id, started.snapshot.id, failure())
            .await
            .expect("dead letter");
        assert_eq!(finished.execution_status, ExecutionStatus::Finished);
        assert_eq!(finished.run_status, RunStatus::CompletedWithErrors);
        assert_eq!(
            queue.length_of_dead_letter_queue(&run.tenant()).await.expect("dlq"),
            1
        );
    }

    #[tokio::test]
    async fn cancelling_a_queued_run_finishes_it() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let (_, enqueue, attempts) = systems(&fixture);
        fixture
            .resources
            .run_lock
            .lock(run.id, |guard| {
                let request = EnqueueRun::new(run.clone(), ExecutionStatus::Queued, "queued");
                async move { enqueue.enqueue_run(&guard, request).await }
            })
            .await
            .expect("enqueue");

        let snapshot = attempts.cancel_run(run.id, "user request").await.expect("cancel");
        assert_eq!(snapshot.execution_status, ExecutionStatus::Finished);
        assert_eq!(snapshot.run_status, RunStatus::Canceled);
        assert_eq!(
            fixture
                .resources
                .run_queue
                .length_of_queue(&run.queue_descriptor())
                .await
                .expect("len"),
            0
        );

        let again = attempts.cancel_run(run.id, "twice").await.expect("idempotent");
        assert_eq!(again.id, snapshot.id);
    }

    #[tokio::test]
    async fn cancelling_an_executing_run_waits_for_the_runner() {
        let fixture = Fixture::new();
        let run = fixture.seed_run(EnvironmentType::Production).await;
        let (_, _, attempts) = systems(&fixture);
        let mut events = fixture.resources.events.subscribe();
        let pending = pending_executing(&fixture, &run).await;
        let started = attempts.start_run_attempt(run.id, pending.id).await.expect("start");

        let pending_cancel = attempts.cancel_run(run.id, "user request").await.expect("cancel");
        assert_eq!(pending_cancel.execution_status, ExecutionStatus::PendingCancel);
        assert_eq!(pending_cancel.previous_snapshot_id, Some(started.snapshot.id));

        let mut notified = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::WorkerNotification { snapshot_id, .. } = event {
                notified |= snapshot_id == pending_cancel.id;
            }
        }
        assert!(notified);

        let finished = attempts
            .complete_run_attempt(run.id, pending_cancel.id, AttemptOutcome::Success)
            .await
            .expect("runner acknowledges");
        assert_eq!(finished.run_status, RunStatus::Canceled);
    }
}
