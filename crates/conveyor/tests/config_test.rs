//! Environment-driven configuration.

use std::time::Duration;

use serial_test::serial;

use conveyor::EngineConfig;

const VARS: [&str; 4] = [
    "CONVEYOR_LOCK_TIMEOUT_MS",
    "CONVEYOR_DRR_QUANTUM",
    "CONVEYOR_RELEASE_DISABLED",
    "CONVEYOR_MASTER_QUEUE_SHARDS",
];

fn clear_vars() {
    for name in VARS {
        // SAFETY: tests touching the environment are serialized.
        unsafe { std::env::remove_var(name) };
    }
}

fn set_var(name: &str, value: &str) {
    // SAFETY: tests touching the environment are serialized.
    unsafe { std::env::set_var(name, value) };
}

#[test]
#[serial]
fn unset_variables_fall_back_to_defaults() {
    clear_vars();
    let config = EngineConfig::from_env().expect("config");
    assert_eq!(config.run_lock.timeout, Duration::from_secs(5));
    assert_eq!(config.fair_queue.quantum, 10.0);
    assert!(!config.release_concurrency.disabled);
    assert_eq!(config.run_queue.master_queue_shards, 1);
}

#[test]
#[serial]
fn variables_override_defaults() {
    clear_vars();
    set_var("CONVEYOR_LOCK_TIMEOUT_MS", "1500");
    set_var("CONVEYOR_DRR_QUANTUM", "25");
    set_var("CONVEYOR_RELEASE_DISABLED", "true");
    set_var("CONVEYOR_MASTER_QUEUE_SHARDS", "0");

    let config = EngineConfig::from_env().expect("config");
    assert_eq!(config.run_lock.timeout, Duration::from_millis(1500));
    assert_eq!(config.fair_queue.quantum, 25.0);
    assert!(config.release_concurrency.disabled);
    assert_eq!(config.run_queue.master_queue_shards, 1, "at least one shard");
    clear_vars();
}

#[test]
#[serial]
fn unparseable_values_are_rejected() {
    clear_vars();
    set_var("CONVEYOR_DRR_QUANTUM", "lots");
    let err = EngineConfig::from_env().expect_err("invalid quantum");
    assert!(err.to_string().contains("CONVEYOR_DRR_QUANTUM"));

    clear_vars();
    set_var("CONVEYOR_RELEASE_DISABLED", "maybe");
    assert!(EngineConfig::from_env().is_err());
    clear_vars();
}
