//! Token-bucket gated concurrency release across blocked runs.

use std::time::Duration;

use anyhow::Result;

use conveyor::config::EngineConfig;
use conveyor::core::{
    CheckpointInput, CheckpointType, EnvironmentType, ExecutionStatus, ReleaseConcurrencyScope,
};
use conveyor::release_concurrency::{ReleaseDecision, ReleaseOutcome};
use conveyor_test_support::{EngineHarness, test_config};

fn checkpoint_input() -> CheckpointInput {
    CheckpointInput {
        checkpoint_type: CheckpointType::Docker,
        location: "s3://checkpoints/run".to_string(),
        image_ref: "registry/image:1".to_string(),
        reason: None,
    }
}

#[tokio::test]
async fn parked_release_runs_once_a_token_returns() -> Result<()> {
    let harness = EngineHarness::new();
    let engine = &harness.engine;
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 1)
        .await;
    let tenant = env.tenant();
    let run_queue = &engine.resources().run_queue;

    let first = harness.trigger_isolated(&env, None).await;
    harness.start(&first).await;
    let first_wait = engine.create_waitpoint(&tenant).await?;
    let first_blocked = engine
        .block_run_with_waitpoints(first.id, &[first_wait.id])
        .await?;
    assert_eq!(run_queue.current_concurrency_of_environment(&tenant).await?, 0);

    // The single token is held by the first run, so the second parks.
    let second = harness.trigger_isolated(&env, None).await;
    harness.start(&second).await;
    let second_wait = engine.create_waitpoint(&tenant).await?;
    let second_blocked = engine
        .block_run_with_waitpoints(second.id, &[second_wait.id])
        .await?;
    assert_eq!(
        engine.release_concurrency_for_snapshot(&second_blocked).await?,
        ReleaseDecision::Deferred
    );
    assert_eq!(run_queue.current_concurrency_of_environment(&tenant).await?, 1);

    let sweeper = engine.release_concurrency_sweeper();
    assert_eq!(sweeper.process_ready_releasers().await?, 0);

    engine
        .create_checkpoint(first.id, first_blocked.id, checkpoint_input())
        .await?;
    assert_eq!(sweeper.process_ready_releasers().await?, 1);
    assert_eq!(run_queue.current_concurrency_of_environment(&tenant).await?, 0);
    Ok(())
}

#[tokio::test]
async fn development_environments_skip_the_bucket() -> Result<()> {
    let harness = EngineHarness::new();
    let engine = &harness.engine;
    let env = harness
        .register_environment("env_dev", EnvironmentType::Development, 1)
        .await;

    for _ in 0..3 {
        let run = harness.trigger_isolated(&env, None).await;
        harness.start(&run).await;
        let waitpoint = engine.create_waitpoint(&run.tenant()).await?;
        let blocked = engine
            .block_run_with_waitpoints(run.id, &[waitpoint.id])
            .await?;
        assert_eq!(
            engine
                .resources()
                .run_queue
                .current_concurrency_of_environment(&env.tenant())
                .await?,
            0
        );

        // Already released: a second request finds nothing to release.
        let again = engine.release_concurrency_for_snapshot(&blocked).await?;
        assert!(matches!(
            again,
            ReleaseDecision::Executed(ReleaseOutcome::Released(_))
                | ReleaseDecision::Executed(ReleaseOutcome::Skipped(_))
        ));
    }
    Ok(())
}

#[tokio::test]
async fn stale_releasing_is_refilled_once_the_run_moves_on() -> Result<()> {
    let mut config = test_config();
    config.release_concurrency.releasings_max_age = Duration::ZERO;
    let harness = EngineHarness::with_config(config);
    let engine = &harness.engine;
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 1)
        .await;
    let tenant = env.tenant();

    let first = harness.trigger_isolated(&env, None).await;
    harness.start(&first).await;
    let waitpoint = engine.create_waitpoint(&tenant).await?;
    engine
        .block_run_with_waitpoints(first.id, &[waitpoint.id])
        .await?;

    let sweeper = engine.release_concurrency_sweeper();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(
        sweeper.refill_stale_releasings().await?,
        0,
        "the blocked snapshot is still current"
    );

    // Cancelling moves the run on without giving the token back.
    engine.cancel_run(first.id, "user requested").await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(sweeper.refill_stale_releasings().await?, 1);

    // The bucket is full again, so the next blocked run releases straight away.
    let second = harness.trigger_isolated(&env, None).await;
    harness.start(&second).await;
    let waitpoint = engine.create_waitpoint(&tenant).await?;
    engine
        .block_run_with_waitpoints(second.id, &[waitpoint.id])
        .await?;
    assert_eq!(
        engine
            .resources()
            .run_queue
            .current_concurrency_of_environment(&tenant)
            .await?,
        0
    );
    Ok(())
}

#[tokio::test]
async fn locked_queue_without_release_keeps_its_slot() -> Result<()> {
    let harness = EngineHarness::new();
    let engine = &harness.engine;
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 10)
        .await;
    let queue = harness.register_queue(&env, "limited", Some(2), false).await;

    let run = harness.trigger_isolated(&env, Some(&queue)).await;
    harness.start(&run).await;
    let waitpoint = engine.create_waitpoint(&run.tenant()).await?;
    let blocked = engine
        .block_run_with_waitpoints(run.id, &[waitpoint.id])
        .await?;
    assert_eq!(
        blocked.metadata.release_concurrency,
        Some(ReleaseConcurrencyScope::EnvironmentOnly)
    );

    let run_queue = &engine.resources().run_queue;
    assert_eq!(run_queue.current_concurrency_of_environment(&run.tenant()).await?, 0);
    assert_eq!(run_queue.current_concurrency_of_queue(&run.queue_descriptor()).await?, 1);
    Ok(())
}

#[tokio::test]
async fn disabled_release_keeps_concurrency_held() -> Result<()> {
    let mut config: EngineConfig = test_config();
    config.release_concurrency.disabled = true;
    let harness = EngineHarness::with_config(config);
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
    assert_eq!(blocked.execution_status, ExecutionStatus::ExecutingWithWaitpoints);
    assert_eq!(
        engine.release_concurrency_for_snapshot(&blocked).await?,
        ReleaseDecision::Disabled
    );
    assert_eq!(
        engine
            .resources()
            .run_queue
            .current_concurrency_of_environment(&run.tenant())
            .await?,
        1
    );
    Ok(())
}
