//! Cross-tenant scheduling and concurrency limits.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use conveyor::core::EnvironmentType;
use conveyor_test_support::{EngineHarness, test_config};

#[tokio::test]
async fn bursty_tenant_is_served_every_round_it_has_work() -> Result<()> {
    let harness = EngineHarness::new();
    let engine = &harness.engine;
    let busy = harness
        .register_environment("env_busy", EnvironmentType::Production, 1000)
        .await;
    let bursty = harness
        .register_environment("env_bursty", EnvironmentType::Production, 1000)
        .await;
    for _ in 0..100 {
        harness.trigger(&busy).await;
    }

    let run_queue = &engine.resources().run_queue;
    let mut busy_selected = 0;
    let mut bursty_served = 0;
    for round in 0..20 {
        // The bursty tenant submits one run on even rounds.
        if round % 2 == 0 {
            harness.trigger(&bursty).await;
        }

        let mut processed = Vec::new();
        for tenant in engine.select_queues().await? {
            let budget = (tenant.deficit.floor() as usize).min(10);
            let mut count = 0;
            for queue in &tenant.queues {
                if count >= budget {
                    break;
                }
                let messages = run_queue
                    .dequeue_message_from_queue(&queue.queue_key, budget - count)
                    .await?;
                count += messages.len();
            }
            if tenant.tenant.environment_id == bursty.id {
                bursty_served += count;
            } else {
                busy_selected += 1;
            }
            processed.push((tenant.tenant.environment_id.clone(), count as u32));
        }
        engine.record_processed_batch(&processed).await?;
    }

    assert_eq!(bursty_served, 10, "every bursty submission is served in its round");
    assert_eq!(busy_selected, 10, "the busy tenant is selected while it has work");
    assert_eq!(run_queue.length_of_env_queue(&busy.tenant()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn environment_limit_caps_dispatch() -> Result<()> {
    let harness = EngineHarness::new();
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 2)
        .await;
    for _ in 0..5 {
        harness.trigger(&env).await;
    }

    assert_eq!(harness.dispatch_all().await, 2);
    let run_queue = &harness.engine.resources().run_queue;
    assert_eq!(run_queue.current_concurrency_of_environment(&env.tenant()).await?, 2);
    assert_eq!(run_queue.length_of_env_queue(&env.tenant()).await?, 3);
    Ok(())
}

#[tokio::test]
async fn queue_limit_caps_dispatch_below_the_environment() -> Result<()> {
    let harness = EngineHarness::new();
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 10)
        .await;
    let queue = harness.register_queue(&env, "serial", Some(1), true).await;
    for _ in 0..3 {
        harness.trigger_isolated(&env, Some(&queue)).await;
    }
    harness.trigger(&env).await;

    assert_eq!(harness.dispatch_all().await, 2);
    Ok(())
}

#[tokio::test]
async fn background_dispatch_fills_worker_queues_until_shutdown() -> Result<()> {
    let mut config = test_config();
    config.fair_queue.poll_interval = Duration::from_millis(5);
    let harness = EngineHarness::with_config(config);
    let env = harness
        .register_environment("env_prod", EnvironmentType::Production, 100)
        .await;
    for _ in 0..25 {
        harness.trigger(&env).await;
    }

    let shutdown = CancellationToken::new();
    let handles = harness.engine.spawn_background_tasks(&shutdown);

    let run_queue = &harness.engine.resources().run_queue;
    tokio::time::timeout(Duration::from_secs(5), async {
        while run_queue.length_of_worker_queue("main").await.expect("length") < 25 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    shutdown.cancel();
    for handle in handles {
        handle.await?;
    }
    Ok(())
}
