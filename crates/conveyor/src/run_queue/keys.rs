//! Key producer for the shared store.
//!
//! Every tenant-scoped key starts with `{org:<id>}` so a store that hashes on
//! the braced segment keeps one organization's keys on the same partition,
//! which the multi-key queue scripts rely on.

use conveyor_run_core::{QueueDescriptor, RunId, TenantDescriptor};
use conveyor_shared_store::TokenBucketKeyspace;

use super::codec::SEPARATOR;

const ORG_PREFIX: &str = "{org:";
const PROJ: &str = "proj";
const ENV: &str = "env";
const QUEUE: &str = "queue";
const CONCURRENCY_KEY: &str = "ck";
const MESSAGE: &str = "message";

const CONCURRENCY_LIMIT_SUFFIX: &str = "concurrency";
const CURRENT_CONCURRENCY_SUFFIX: &str = "currentConcurrency";
const ENV_QUEUE_SUFFIX: &str = "envQueue";
const DEAD_LETTER_SUFFIX: &str = "deadLetter";

const MASTER_QUEUE_PREFIX: &str = "masterQueue:shard:";
const WORKER_QUEUE_PREFIX: &str = "workerQueue:";
const RUN_LOCK_PREFIX: &str = "lock:run:";
const DEFICIT_KEY: &str = "fairQueue:deficit";
const RELEASE_CONCURRENCY_PREFIX: &str = "releaseConcurrency:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{field} must not be empty")]
    EmptySegment { field: &'static str },

    #[error("{field} {value:?} contains a reserved character")]
    ReservedCharacter { field: &'static str, value: String },

    #[error("malformed {kind} key {key:?}")]
    Malformed { kind: &'static str, key: String },
}

fn check_segment(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptySegment { field });
    }
    if value.contains([':', '{', '}', SEPARATOR]) {
        return Err(KeyError::ReservedCharacter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// FNV-1a; stable across processes so every coordinator picks the same shard.
fn stable_hash(value: &str) -> u64 {
    value.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Builds and parses every key the engine stores.
#[derive(Debug, Clone)]
pub struct RunQueueKeyProducer {
    master_queue_shards: u32,
}

impl RunQueueKeyProducer {
    pub fn new(master_queue_shards: u32) -> Self {
        Self {
            master_queue_shards: master_queue_shards.max(1),
        }
    }

    pub fn master_queue_shards(&self) -> u32 {
        self.master_queue_shards
    }

    pub fn env_key(&self, tenant: &TenantDescriptor) -> Result<String, KeyError> {
        check_segment("organization id", &tenant.organization_id)?;
        check_segment("project id", &tenant.project_id)?;
        check_segment("environment id", &tenant.environment_id)?;
        Ok(format!(
            "{ORG_PREFIX}{}}}:{PROJ}:{}:{ENV}:{}",
            tenant.organization_id, tenant.project_id, tenant.environment_id
        ))
    }

    pub fn queue_key(&self, descriptor: &QueueDescriptor) -> Result<String, KeyError> {
        let env_key = self.env_key(&descriptor.tenant())?;
        check_segment("queue name", &descriptor.queue)?;
        let mut key = format!("{env_key}:{QUEUE}:{}", descriptor.queue);
        if let Some(concurrency_key) = &descriptor.concurrency_key {
            check_segment("concurrency key", concurrency_key)?;
            key.push_str(&format!(":{CONCURRENCY_KEY}:{concurrency_key}"));
        }
        Ok(key)
    }

    /// Exact inverse of [`Self::queue_key`].
    pub fn descriptor_from_queue(&self, key: &str) -> Result<QueueDescriptor, KeyError> {
        let malformed = || KeyError::Malformed {
            kind: "queue",
            key: key.to_string(),
        };
        let rest = key.strip_prefix(ORG_PREFIX).ok_or_else(malformed)?;
        let (organization_id, rest) = rest.split_once("}:").ok_or_else(malformed)?;
        let segments: Vec<&str> = rest.split(':').collect();

        let (project_id, environment_id, queue, concurrency_key) = match segments.as_slice() {
            [PROJ, project, ENV, env, QUEUE, queue] => (*project, *env, *queue, None),
            [PROJ, project, ENV, env, QUEUE, queue, CONCURRENCY_KEY, ck] => {
                (*project, *env, *queue, Some(*ck))
            }
            _ => return Err(malformed()),
        };

        let descriptor = QueueDescriptor {
            organization_id: organization_id.to_string(),
            project_id: project_id.to_string(),
            environment_id: environment_id.to_string(),
            queue: queue.to_string(),
            concurrency_key: concurrency_key.map(str::to_string),
        };
        // Rejects empty or reserved segments that split alone would accept.
        if self.queue_key(&descriptor)? != key {
            return Err(malformed());
        }
        Ok(descriptor)
    }

    pub fn tenant_from_env_key(&self, key: &str) -> Result<TenantDescriptor, KeyError> {
        let malformed = || KeyError::Malformed {
            kind: "environment",
            key: key.to_string(),
        };
        let rest = key.strip_prefix(ORG_PREFIX).ok_or_else(malformed)?;
        let (organization_id, rest) = rest.split_once("}:").ok_or_else(malformed)?;
        let segments: Vec<&str> = rest.split(':').collect();
        let [PROJ, project_id, ENV, environment_id] = segments.as_slice() else {
            return Err(malformed());
        };
        let tenant = TenantDescriptor {
            organization_id: organization_id.to_string(),
            project_id: project_id.to_string(),
            environment_id: environment_id.to_string(),
        };
        if self.env_key(&tenant)? != key {
            return Err(malformed());
        }
        Ok(tenant)
    }

    /// Limits are configured on the base queue, shared by every concurrency key.
    pub fn queue_concurrency_limit_key(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<String, KeyError> {
        let base = self.queue_key(&descriptor.without_concurrency_key())?;
        Ok(format!("{base}:{CONCURRENCY_LIMIT_SUFFIX}"))
    }

    pub fn queue_current_concurrency_key(
        &self,
        descriptor: &QueueDescriptor,
    ) -> Result<String, KeyError> {
        Ok(format!(
            "{}:{CURRENT_CONCURRENCY_SUFFIX}",
            self.queue_key(descriptor)?
        ))
    }

    pub fn env_concurrency_limit_key(&self, tenant: &TenantDescriptor) -> Result<String, KeyError> {
        Ok(format!("{}:{CONCURRENCY_LIMIT_SUFFIX}", self.env_key(tenant)?))
    }

    pub fn env_current_concurrency_key(
        &self,
        tenant: &TenantDescriptor,
    ) -> Result<String, KeyError> {
        Ok(format!("{}:{CURRENT_CONCURRENCY_SUFFIX}", self.env_key(tenant)?))
    }

    pub fn env_queue_key(&self, tenant: &TenantDescriptor) -> Result<String, KeyError> {
        Ok(format!("{}:{ENV_QUEUE_SUFFIX}", self.env_key(tenant)?))
    }

    pub fn dead_letter_key(&self, tenant: &TenantDescriptor) -> Result<String, KeyError> {
        Ok(format!("{}:{DEAD_LETTER_SUFFIX}", self.env_key(tenant)?))
    }

    pub fn message_key_prefix(&self, organization_id: &str) -> Result<String, KeyError> {
        check_segment("organization id", organization_id)?;
        Ok(format!("{ORG_PREFIX}{organization_id}}}:{MESSAGE}:"))
    }

    pub fn message_key(&self, organization_id: &str, run_id: RunId) -> Result<String, KeyError> {
        Ok(format!("{}{run_id}", self.message_key_prefix(organization_id)?))
    }

    /// Run id of a message key, if `key` is one.
    pub fn run_id_from_message_key(&self, key: &str) -> Option<RunId> {
        let rest = key.strip_prefix(ORG_PREFIX)?;
        let (_, rest) = rest.split_once("}:")?;
        RunId::parse(rest.strip_prefix(MESSAGE)?.strip_prefix(':')?)
    }

    pub fn master_queue_key(&self, shard: u32) -> String {
        format!("{MASTER_QUEUE_PREFIX}{shard}")
    }

    /// Queues of one environment always land on the same shard.
    pub fn master_queue_key_for(&self, tenant: &TenantDescriptor) -> String {
        let shard = stable_hash(&tenant.environment_id) % u64::from(self.master_queue_shards);
        self.master_queue_key(shard as u32)
    }

    pub fn master_queue_keys(&self) -> Vec<String> {
        (0..self.master_queue_shards)
            .map(|shard| self.master_queue_key(shard))
            .collect()
    }

    pub fn worker_queue_key(&self, worker_queue: &str) -> String {
        format!("{WORKER_QUEUE_PREFIX}{worker_queue}")
    }

    pub fn run_lock_key(&self, run_id: RunId) -> String {
        format!("{RUN_LOCK_PREFIX}{run_id}")
    }

    pub fn deficit_key(&self) -> &'static str {
        DEFICIT_KEY
    }

    pub fn release_concurrency_keyspace(&self) -> TokenBucketKeyspace {
        TokenBucketKeyspace {
            prefix: RELEASE_CONCURRENCY_PREFIX.to_string(),
            master_key: format!("{RELEASE_CONCURRENCY_PREFIX}masterQueue"),
            releasings_key: format!("{RELEASE_CONCURRENCY_PREFIX}releasings"),
            releasings_meta_key: format!("{RELEASE_CONCURRENCY_PREFIX}releasings:meta"),
        }
    }
}

impl Default for RunQueueKeyProducer {
    fn default() -> Self {
        Self::new(1)
    }
}
