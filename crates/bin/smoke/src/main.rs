//! CLI smoke check for the run engine over in-memory backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::warn;

use conveyor::attempts::AttemptOutcome;
use conveyor::checkpoint::CreateCheckpointResult;
use conveyor::{EngineConfig, RunEngine, TriggerRequest};
use conveyor_backend_memory::{MemoryBackend, MemorySharedStore};
use conveyor_observability_setup::ObservabilityOptions;
use conveyor_run_core::{CheckpointInput, CheckpointType, EnvironmentType, RuntimeEnvironment};

#[derive(Parser, Debug)]
#[command(name = "conveyor-smoke", about = "Smoke check the run engine.")]
struct SmokeArgs {
    /// Number of tenant environments.
    #[arg(long, default_value_t = 3)]
    tenants: usize,
    /// Runs triggered for every tenant but the first.
    #[arg(long, default_value_t = 5)]
    base: usize,
    /// The first tenant gets `base * skew` runs.
    #[arg(long, default_value_t = 20)]
    skew: usize,
    #[arg(long, default_value_t = 20)]
    rounds: usize,
    #[arg(long)]
    json: bool,
    /// Write a chrome trace here (needs the `trace` feature).
    #[arg(long)]
    trace: Option<String>,
}

fn environment(id: String) -> RuntimeEnvironment {
    RuntimeEnvironment {
        id,
        organization_id: "org_smoke".to_string(),
        project_id: "proj_smoke".to_string(),
        environment_type: EnvironmentType::Production,
        maximum_concurrency_limit: 1000,
    }
}

fn load_config() -> EngineConfig {
    EngineConfig::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "invalid engine configuration, using defaults");
        EngineConfig::default()
    })
}

async fn run_fairness_smoke(engine: &RunEngine, args: &SmokeArgs) -> Result<()> {
    let mut served: BTreeMap<String, usize> = BTreeMap::new();
    for tenant in 0..args.tenants {
        let env = environment(format!("env_{tenant}"));
        engine.register_environment(&env).await?;
        let runs = if tenant == 0 { args.base * args.skew } else { args.base };
        for _ in 0..runs {
            engine
                .trigger(TriggerRequest::new(env.id.clone(), "smoke-task"))
                .await?;
        }
        served.insert(env.id, 0);
    }

    let task = engine.fair_dispatch_task();
    for round in 0..args.rounds {
        let report = task.dispatch_round().await?;
        if report.total() == 0 {
            println!("round {round}: nothing left to dispatch");
            break;
        }
        println!("round {round}: {:?}", report.dispatched);
        for (tenant_id, count) in report.dispatched {
            *served.entry(tenant_id).or_default() += count;
        }
    }

    println!("Service counts:");
    for (tenant_id, count) in &served {
        println!("  {tenant_id}: {count}");
    }
    Ok(())
}

async fn run_checkpoint_smoke(engine: &RunEngine) -> Result<()> {
    let env = environment("env_checkpoint".to_string());
    engine.register_environment(&env).await?;
    let run = engine
        .trigger(TriggerRequest::new(env.id.clone(), "checkpoint-task").with_worker_queue("smoke"))
        .await?;

    let dispatch = engine.fair_dispatch_task();
    dispatch.dispatch_round().await?;
    let message = engine
        .dequeue_from_worker_queue("smoke")
        .await?
        .context("run was not dispatched")?;
    let attempt = engine.start_run_attempt(run.id, message.snapshot.id).await?;
    println!("run {} executing (attempt {:?})", run.id, attempt.run.attempt_number);

    let waitpoint = engine.create_waitpoint(&run.tenant()).await?;
    let blocked = engine
        .block_run_with_waitpoints(run.id, &[waitpoint.id])
        .await?;
    let checkpoint = engine
        .create_checkpoint(
            run.id,
            blocked.id,
            CheckpointInput {
                checkpoint_type: CheckpointType::Docker,
                location: format!("file:///tmp/{}", run.id),
                image_ref: "conveyor/smoke:latest".to_string(),
                reason: Some("smoke".to_string()),
            },
        )
        .await?;
    if let CreateCheckpointResult::Discarded { reason, .. } = &checkpoint {
        return Err(anyhow!("checkpoint discarded: {reason}"));
    }
    println!("run {} suspended", run.id);

    engine
        .complete_waitpoint(waitpoint.id, Some(serde_json::json!({"ok": true})), false)
        .await?;
    dispatch.dispatch_round().await?;
    let message = engine
        .dequeue_from_worker_queue("smoke")
        .await?
        .context("resumed run was not dispatched")?;
    let resumed = engine
        .continue_run_execution(run.id, message.snapshot.id)
        .await?;
    engine
        .complete_run_attempt(run.id, resumed.snapshot.id, AttemptOutcome::Success)
        .await?;

    let chain = engine.snapshot_chain(run.id).await?;
    println!("run {} finished after {} snapshots:", run.id, chain.len());
    for snapshot in chain.iter().rev() {
        println!("  {} {}", snapshot.execution_status, snapshot.description);
    }
    Ok(())
}

async fn run_smoke(args: SmokeArgs) -> i32 {
    let engine = RunEngine::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemorySharedStore::new()),
        load_config(),
    );

    let mut failures = 0;
    if let Err(err) = run_fairness_smoke(&engine, &args).await {
        failures += 1;
        println!("Fairness smoke failed: {err:#}");
    }
    if let Err(err) = run_checkpoint_smoke(&engine).await {
        failures += 1;
        println!("Checkpoint smoke failed: {err:#}");
    }
    if failures > 0 { 1 } else { 0 }
}

pub fn main() {
    let args = SmokeArgs::parse();
    conveyor_observability_setup::init(ObservabilityOptions {
        json: args.json,
        filter: Some("conveyor=info,conveyor_smoke=info".to_string()),
        trace_path: args.trace.clone(),
    });
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = runtime.block_on(run_smoke(args));
    conveyor_observability_setup::flush();
    std::process::exit(code);
}
