//! Engine configuration.
//!
//! Everything is supplied at construction. [`EngineConfig::from_env`] reads the
//! following variables after loading `.env` if present:
//! - `CONVEYOR_LOCK_TIMEOUT_MS`: Run lock acquisition timeout (default: 5000)
//! - `CONVEYOR_LOCK_LEASE_MS`: Run lock lease duration (default: 10000)
//! - `CONVEYOR_LOCK_RETRY_DELAY_MS`: Delay between lock attempts (default: 50)
//! - `CONVEYOR_LOCK_RETRY_JITTER_MS`: Random extra delay per attempt (default: 25)
//! - `CONVEYOR_MASTER_QUEUE_SHARDS`: Number of master queue shards (default: 1)
//! - `CONVEYOR_MASTER_QUEUE_SCAN_LIMIT`: Queues read per scheduling round (default: 100)
//! - `CONVEYOR_DEFAULT_ENV_CONCURRENCY`: Limit for environments without one (default: 100)
//! - `CONVEYOR_MAX_ATTEMPTS`: Nacks before a message is dead-lettered (default: 10)
//! - `CONVEYOR_RELEASE_MAX_TOKENS_RATIO`: Bucket size as a share of the env limit (default: 1.0)
//! - `CONVEYOR_RELEASE_POLL_INTERVAL_MS`: Parked releaser sweep interval (default: 500)
//! - `CONVEYOR_RELEASE_BATCH_SIZE`: Releasers claimed per sweep (default: 10)
//! - `CONVEYOR_RELEASINGS_MAX_AGE_MS`: Age before a releasing is revalidated (default: 1800000)
//! - `CONVEYOR_RELEASINGS_POLL_INTERVAL_MS`: Releasings sweep interval (default: 60000)
//! - `CONVEYOR_RELEASE_DISABLED`: Turn off deferred release (default: false)
//! - `CONVEYOR_DRR_QUANTUM`: Deficit added per round (default: 10)
//! - `CONVEYOR_DRR_MAX_DEFICIT`: Deficit cap (default: 50)
//! - `CONVEYOR_DRR_PER_TENANT_BATCH`: Messages dequeued per tenant per round (default: 10)
//! - `CONVEYOR_DRR_POLL_INTERVAL_MS`: Dispatch round interval (default: 100)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct RunLockConfig {
    pub timeout: Duration,
    pub lease_duration: Duration,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
}

impl Default for RunLockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            lease_duration: Duration::from_secs(10),
            retry_delay: Duration::from_millis(50),
            retry_jitter: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunQueueConfig {
    pub master_queue_shards: u32,
    pub master_queue_scan_limit: usize,
    /// Used when an environment has no limit stored.
    pub default_env_concurrency: u32,
    pub max_attempts: u32,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            master_queue_shards: 1,
            master_queue_scan_limit: 100,
            default_env_concurrency: 100,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseConcurrencyConfig {
    pub disabled: bool,
    pub max_tokens_ratio: f64,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub releasings_max_age: Duration,
    pub releasings_poll_interval: Duration,
}

impl Default for ReleaseConcurrencyConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            max_tokens_ratio: 1.0,
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            releasings_max_age: Duration::from_secs(30 * 60),
            releasings_poll_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    pub quantum: f64,
    pub max_deficit: f64,
    pub per_tenant_batch: usize,
    pub poll_interval: Duration,
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self {
            quantum: 10.0,
            max_deficit: 50.0,
            per_tenant_batch: 10,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub run_lock: RunLockConfig,
    pub run_queue: RunQueueConfig,
    pub release_concurrency: ReleaseConcurrencyConfig,
    pub fair_queue: FairQueueConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment. Unset
    /// variables fall back to defaults; unparseable ones are an error.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let run_lock = RunLockConfig {
            timeout: env_millis("CONVEYOR_LOCK_TIMEOUT_MS", defaults.run_lock.timeout)?,
            lease_duration: env_millis("CONVEYOR_LOCK_LEASE_MS", defaults.run_lock.lease_duration)?,
            retry_delay: env_millis("CONVEYOR_LOCK_RETRY_DELAY_MS", defaults.run_lock.retry_delay)?,
            retry_jitter: env_millis(
                "CONVEYOR_LOCK_RETRY_JITTER_MS",
                defaults.run_lock.retry_jitter,
            )?,
        };

        let run_queue = RunQueueConfig {
            master_queue_shards: env_parse(
                "CONVEYOR_MASTER_QUEUE_SHARDS",
                defaults.run_queue.master_queue_shards,
            )?
            .max(1),
            master_queue_scan_limit: env_parse(
                "CONVEYOR_MASTER_QUEUE_SCAN_LIMIT",
                defaults.run_queue.master_queue_scan_limit,
            )?,
            default_env_concurrency: env_parse(
                "CONVEYOR_DEFAULT_ENV_CONCURRENCY",
                defaults.run_queue.default_env_concurrency,
            )?,
            max_attempts: env_parse("CONVEYOR_MAX_ATTEMPTS", defaults.run_queue.max_attempts)?,
        };

        let release = &defaults.release_concurrency;
        let release_concurrency = ReleaseConcurrencyConfig {
            disabled: env_bool("CONVEYOR_RELEASE_DISABLED", release.disabled)?,
            max_tokens_ratio: env_parse(
                "CONVEYOR_RELEASE_MAX_TOKENS_RATIO",
                release.max_tokens_ratio,
            )?,
            poll_interval: env_millis("CONVEYOR_RELEASE_POLL_INTERVAL_MS", release.poll_interval)?,
            batch_size: env_parse("CONVEYOR_RELEASE_BATCH_SIZE", release.batch_size)?,
            releasings_max_age: env_millis(
                "CONVEYOR_RELEASINGS_MAX_AGE_MS",
                release.releasings_max_age,
            )?,
            releasings_poll_interval: env_millis(
                "CONVEYOR_RELEASINGS_POLL_INTERVAL_MS",
                release.releasings_poll_interval,
            )?,
        };

        let fair_queue = FairQueueConfig {
            quantum: env_parse("CONVEYOR_DRR_QUANTUM", defaults.fair_queue.quantum)?,
            max_deficit: env_parse("CONVEYOR_DRR_MAX_DEFICIT", defaults.fair_queue.max_deficit)?,
            per_tenant_batch: env_parse(
                "CONVEYOR_DRR_PER_TENANT_BATCH",
                defaults.fair_queue.per_tenant_batch,
            )?,
            poll_interval: env_millis(
                "CONVEYOR_DRR_POLL_INTERVAL_MS",
                defaults.fair_queue.poll_interval,
            )?,
        };

        Ok(Self {
            run_lock,
            run_queue,
            release_concurrency,
            fair_queue,
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name} value {value:?}")),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let millis = env_parse(name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => anyhow::bail!("invalid {name} value {value:?}"),
        },
        Err(_) => Ok(default),
    }
}
