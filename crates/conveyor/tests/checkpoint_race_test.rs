//! Concurrent checkpoint callers for the same snapshot.

use anyhow::Result;

use conveyor::checkpoint::CreateCheckpointResult;
use conveyor::core::{CheckpointInput, CheckpointType, EnvironmentType, ExecutionStatus};
use conveyor_test_support::EngineHarness;

fn checkpoint_input(location: &str) -> CheckpointInput {
    CheckpointInput {
        checkpoint_type: CheckpointType::Kubernetes,
        location: location.to_string(),
        image_ref: "registry/image:1".to_string(),
        reason: None,
    }
}

#[tokio::test]
async fn only_one_of_two_racing_checkpoints_wins() -> Result<()> {
    let harness = EngineHarness::new();
    let engine = &harness.engine;
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 10)
        .await;
    let run = harness.trigger_isolated(&env, None).await;
    harness.start(&run).await;
    let waitpoint = engine.create_waitpoint(&run.tenant()).await?;
    let blocked = engine
        .block_run_with_waitpoints(run.id, &[waitpoint.id])
        .await?;

    let (first, second) = futures::join!(
        engine.create_checkpoint(run.id, blocked.id, checkpoint_input("a")),
        engine.create_checkpoint(run.id, blocked.id, checkpoint_input("b")),
    );
    let results = [first?, second?];

    let created = results.iter().filter(|result| result.is_created()).count();
    assert_eq!(created, 1);
    let discarded: Vec<&str> = results
        .iter()
        .filter_map(|result| match result {
            CreateCheckpointResult::Discarded { reason, .. } => Some(reason.as_str()),
            CreateCheckpointResult::Created { .. } => None,
        })
        .collect();
    assert_eq!(discarded, vec!["Not the latest snapshot"]);

    let chain = engine.snapshot_chain(run.id).await?;
    let suspended = chain
        .iter()
        .filter(|snapshot| snapshot.execution_status == ExecutionStatus::Suspended)
        .count();
    assert_eq!(suspended, 1);
    assert_eq!(chain[0].execution_status, ExecutionStatus::Suspended);
    Ok(())
}

#[tokio::test]
async fn checkpoint_after_requeue_is_accepted() -> Result<()> {
    let harness = EngineHarness::new();
    let engine = &harness.engine;
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 10)
        .await;
    let run = harness.trigger_isolated(&env, None).await;
    harness.start(&run).await;
    let waitpoint = engine.create_waitpoint(&run.tenant()).await?;
    let blocked = engine
        .block_run_with_waitpoints(run.id, &[waitpoint.id])
        .await?;

    // The waitpoint resolves before the runner's checkpoint arrives.
    engine.complete_waitpoint(waitpoint.id, None, false).await?;
    let result = engine
        .create_checkpoint(run.id, blocked.id, checkpoint_input("late"))
        .await?;
    let CreateCheckpointResult::Created { snapshot, .. } = result else {
        panic!("checkpoint on the blocked snapshot survives the requeue");
    };
    assert_eq!(snapshot.execution_status, ExecutionStatus::Queued);

    let message = harness.dequeue(&run).await;
    assert!(message.checkpoint.is_some());
    Ok(())
}
