//! Run queue over the shared store.
//!
//! Each queue is a sorted set of run ids scored by availability time; the full
//! message lives at its message key as JSON. Popping a message moves the run
//! into the queue's and the environment's current-concurrency sets, which stay
//! occupied until the run is acknowledged, nacked, re-enqueued or explicitly
//! releases concurrency. Each queue with ready work has an entry in one master
//! queue shard, scored by its oldest message, which is what the dispatch loop
//! scans.

mod codec;
mod keys;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use conveyor_backends_core::BackendError;
use conveyor_run_core::{
    EnvironmentType, QueueDescriptor, RunId, RuntimeEnvironment, TaskRun, TenantDescriptor,
};
use conveyor_shared_store::{
    AcknowledgeMessageScript, DequeueMessagesScript, DequeuedMessage, EnqueueMessageScript,
    NackMessageScript, NackOutcome, QueueMessageKeys, RedriveMessageScript,
    ReleaseConcurrencyScript, SharedStore,
};

pub use self::codec::{
    CodecError, DecodedEntry, SEPARATOR, V3_TAG, WorkerQueueEntry, decode, encode,
};
pub use self::keys::{KeyError, RunQueueKeyProducer};

use crate::config::RunQueueConfig;
use crate::error::EngineResult;
use crate::now_ms;

/// The JSON document stored at a run's message key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub run_id: RunId,
    pub task_identifier: String,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
    pub queue: String,
    pub concurrency_key: Option<String>,
    pub worker_queue: String,
    pub timestamp_ms: i64,
    pub attempt: u32,
}

impl QueueMessage {
    pub fn for_run(run: &TaskRun, timestamp_ms: i64) -> Self {
        Self {
            run_id: run.id,
            task_identifier: run.task_identifier.clone(),
            organization_id: run.organization_id.clone(),
            project_id: run.project_id.clone(),
            environment_id: run.environment_id.clone(),
            environment_type: run.environment_type,
            queue: run.queue.clone(),
            concurrency_key: run.concurrency_key.clone(),
            worker_queue: run.worker_queue.clone(),
            timestamp_ms,
            attempt: 0,
        }
    }

    pub fn descriptor(&self) -> QueueDescriptor {
        QueueDescriptor {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
            queue: self.queue.clone(),
            concurrency_key: self.concurrency_key.clone(),
        }
    }

    pub fn tenant(&self) -> TenantDescriptor {
        self.descriptor().tenant()
    }
}

/// A queue with ready work, as listed in a master queue shard.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterQueueEntry {
    pub queue_key: String,
    pub descriptor: QueueDescriptor,
    /// Availability time of the queue's oldest message.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackResult {
    Requeued { attempt: u32 },
    DeadLettered { attempt: u32 },
    Missing,
}

#[derive(Clone)]
pub struct RunQueue {
    store: Arc<dyn SharedStore>,
    keys: RunQueueKeyProducer,
    config: RunQueueConfig,
}

impl RunQueue {
    pub fn new(store: Arc<dyn SharedStore>, config: RunQueueConfig) -> Self {
        Self {
            store,
            keys: RunQueueKeyProducer::new(config.master_queue_shards),
            config,
        }
    }

    pub fn keys(&self) -> &RunQueueKeyProducer {
        &self.keys
    }

    pub fn config(&self) -> &RunQueueConfig {
        &self.config
    }

    fn message_keys(
        &self,
        descriptor: &QueueDescriptor,
        run_id: RunId,
    ) -> EngineResult<QueueMessageKeys> {
        let tenant = descriptor.tenant();
        Ok(QueueMessageKeys {
            message_key: self.keys.message_key(&descriptor.organization_id, run_id)?,
            queue_key: self.keys.queue_key(descriptor)?,
            env_queue_key: self.keys.env_queue_key(&tenant)?,
            master_queue_key: self.keys.master_queue_key_for(&tenant),
            queue_current_concurrency_key: self.keys.queue_current_concurrency_key(descriptor)?,
            env_current_concurrency_key: self.keys.env_current_concurrency_key(&tenant)?,
        })
    }

    /// Store the message and make it available at its timestamp.
    pub async fn enqueue_message(&self, message: &QueueMessage) -> EngineResult<()> {
        let keys = self.message_keys(&message.descriptor(), message.run_id)?;
        debug!(run_id = %message.run_id, queue = %keys.queue_key, "enqueue message");
        self.store
            .enqueue_message(&EnqueueMessageScript {
                keys,
                run_id: message.run_id.to_string(),
                message_payload: serde_json::to_string(message)
                    .map_err(BackendError::from)?,
                score: message.timestamp_ms as f64,
            })
            .await?;
        Ok(())
    }

    /// Atomically pop up to `max_count` ready messages from one queue, within
    /// the environment and queue concurrency limits.
    pub async fn dequeue_message_from_queue(
        &self,
        queue_key: &str,
        max_count: usize,
    ) -> EngineResult<Vec<QueueMessage>> {
        let descriptor = self.keys.descriptor_from_queue(queue_key)?;
        let tenant = descriptor.tenant();
        let message_key_prefix = self.keys.message_key_prefix(&descriptor.organization_id)?;
        let popped = self
            .store
            .dequeue_messages(&DequeueMessagesScript {
                queue_key: queue_key.to_string(),
                env_queue_key: self.keys.env_queue_key(&tenant)?,
                master_queue_key: self.keys.master_queue_key_for(&tenant),
                queue_concurrency_limit_key: self.keys.queue_concurrency_limit_key(&descriptor)?,
                queue_current_concurrency_key: self
                    .keys
                    .queue_current_concurrency_key(&descriptor)?,
                env_concurrency_limit_key: self.keys.env_concurrency_limit_key(&tenant)?,
                env_current_concurrency_key: self.keys.env_current_concurrency_key(&tenant)?,
                message_key_prefix: message_key_prefix.clone(),
                default_env_concurrency_limit: self.config.default_env_concurrency,
                max_count,
                now_ms: now_ms(),
            })
            .await?;

        let mut messages = Vec::with_capacity(popped.len());
        for DequeuedMessage { run_id, payload } in popped {
            match serde_json::from_str::<QueueMessage>(&payload) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    error!(%queue_key, %run_id, error = %err, "dropping undecodable queue message");
                    self.discard_popped(&descriptor, &message_key_prefix, &run_id)
                        .await?;
                }
            }
        }
        Ok(messages)
    }

    /// Delete a popped message that cannot be read back and free the slots it took.
    async fn discard_popped(
        &self,
        descriptor: &QueueDescriptor,
        message_key_prefix: &str,
        run_id: &str,
    ) -> EngineResult<()> {
        let tenant = descriptor.tenant();
        self.store
            .acknowledge_message(&AcknowledgeMessageScript {
                keys: QueueMessageKeys {
                    message_key: format!("{message_key_prefix}{run_id}"),
                    queue_key: self.keys.queue_key(descriptor)?,
                    env_queue_key: self.keys.env_queue_key(&tenant)?,
                    master_queue_key: self.keys.master_queue_key_for(&tenant),
                    queue_current_concurrency_key: self
                        .keys
                        .queue_current_concurrency_key(descriptor)?,
                    env_current_concurrency_key: self.keys.env_current_concurrency_key(&tenant)?,
                },
                run_id: run_id.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn push_to_worker_queue(&self, message: &QueueMessage) -> EngineResult<()> {
        let entry = WorkerQueueEntry {
            run_id: message.run_id,
            queue_key: self.keys.queue_key(&message.descriptor())?,
            timestamp_ms: message.timestamp_ms,
            attempt: message.attempt,
            environment_type: message.environment_type,
            worker_queue: message.worker_queue.clone(),
        };
        self.store
            .push_worker_queue(
                &self.keys.worker_queue_key(&message.worker_queue),
                &encode(&entry)?,
            )
            .await?;
        Ok(())
    }

    /// Pop the next entry of a worker queue. Entries whose message is gone are
    /// skipped.
    pub async fn dequeue_from_worker_queue(
        &self,
        worker_queue: &str,
    ) -> EngineResult<Option<WorkerQueueEntry>> {
        let key = self.keys.worker_queue_key(worker_queue);
        loop {
            let Some(raw) = self.store.pop_worker_queue(&key).await? else {
                return Ok(None);
            };
            match decode(&raw)? {
                DecodedEntry::V3(entry) => return Ok(Some(entry)),
                DecodedEntry::NotV3(message_key) => {
                    if let Some(entry) = self.resolve_legacy_entry(&message_key).await? {
                        return Ok(Some(entry));
                    }
                    warn!(%message_key, "dropping legacy worker queue entry without a message");
                }
            }
        }
    }

    /// Slow path for entries written before the compact format: the entry is
    /// the message key and the full message is read back from the store.
    async fn resolve_legacy_entry(&self, message_key: &str) -> EngineResult<Option<WorkerQueueEntry>> {
        if self.keys.run_id_from_message_key(message_key).is_none() {
            return Ok(None);
        }
        let Some(payload) = self.store.get(message_key).await? else {
            return Ok(None);
        };
        let message: QueueMessage =
            serde_json::from_str(&payload).map_err(BackendError::from)?;
        Ok(Some(WorkerQueueEntry {
            run_id: message.run_id,
            queue_key: self.keys.queue_key(&message.descriptor())?,
            timestamp_ms: message.timestamp_ms,
            attempt: message.attempt,
            environment_type: message.environment_type,
            worker_queue: message.worker_queue,
        }))
    }

    pub async fn read_message(
        &self,
        organization_id: &str,
        run_id: RunId,
    ) -> EngineResult<Option<QueueMessage>> {
        let key = self.keys.message_key(organization_id, run_id)?;
        let Some(payload) = self.store.get(&key).await? else {
            return Ok(None);
        };
        Ok(Some(
            serde_json::from_str(&payload).map_err(BackendError::from)?,
        ))
    }

    /// Delete the message and free every slot the run holds.
    pub async fn acknowledge_message(
        &self,
        descriptor: &QueueDescriptor,
        run_id: RunId,
    ) -> EngineResult<()> {
        self.store
            .acknowledge_message(&AcknowledgeMessageScript {
                keys: self.message_keys(descriptor, run_id)?,
                run_id: run_id.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Put a message back with its attempt incremented, or dead-letter it once
    /// the attempt passes `max_attempts`.
    pub async fn nack_message(
        &self,
        descriptor: &QueueDescriptor,
        run_id: RunId,
        retry_at_ms: i64,
    ) -> EngineResult<NackResult> {
        let Some(mut message) = self.read_message(&descriptor.organization_id, run_id).await?
        else {
            return Ok(NackResult::Missing);
        };
        message.attempt += 1;
        message.timestamp_ms = retry_at_ms;
        let dead_letter = message.attempt > self.config.max_attempts;

        let outcome = self
            .store
            .nack_message(&NackMessageScript {
                keys: self.message_keys(descriptor, run_id)?,
                dead_letter_key: self.keys.dead_letter_key(&descriptor.tenant())?,
                run_id: run_id.to_string(),
                message_payload: serde_json::to_string(&message)
                    .map_err(BackendError::from)?,
                retry_at: retry_at_ms as f64,
                dead_letter,
                now_ms: now_ms(),
            })
            .await?;

        Ok(match outcome {
            NackOutcome::Requeued => NackResult::Requeued {
                attempt: message.attempt,
            },
            NackOutcome::DeadLettered => {
                warn!(%run_id, attempt = message.attempt, "message dead-lettered");
                NackResult::DeadLettered {
                    attempt: message.attempt,
                }
            }
            NackOutcome::Missing => NackResult::Missing,
        })
    }

    /// Move a dead-lettered message back onto its queue with a fresh attempt count.
    pub async fn redrive_from_dead_letter(
        &self,
        organization_id: &str,
        run_id: RunId,
    ) -> EngineResult<bool> {
        let Some(mut message) = self.read_message(organization_id, run_id).await? else {
            return Ok(false);
        };
        message.attempt = 0;
        message.timestamp_ms = now_ms();
        let descriptor = message.descriptor();
        let redriven = self
            .store
            .redrive_message(&RedriveMessageScript {
                keys: self.message_keys(&descriptor, run_id)?,
                dead_letter_key: self.keys.dead_letter_key(&descriptor.tenant())?,
                run_id: run_id.to_string(),
                message_payload: serde_json::to_string(&message)
                    .map_err(BackendError::from)?,
                score: message.timestamp_ms as f64,
            })
            .await?;
        Ok(redriven)
    }

    pub async fn release_all_concurrency(
        &self,
        descriptor: &QueueDescriptor,
        run_id: RunId,
    ) -> EngineResult<()> {
        self.store
            .release_concurrency(&ReleaseConcurrencyScript {
                run_id: run_id.to_string(),
                concurrency_keys: vec![
                    self.keys.queue_current_concurrency_key(descriptor)?,
                    self.keys.env_current_concurrency_key(&descriptor.tenant())?,
                ],
            })
            .await?;
        Ok(())
    }

    /// Free the environment slot only; the queue slot stays held.
    pub async fn release_env_concurrency(
        &self,
        tenant: &TenantDescriptor,
        run_id: RunId,
    ) -> EngineResult<()> {
        self.store
            .release_concurrency(&ReleaseConcurrencyScript {
                run_id: run_id.to_string(),
                concurrency_keys: vec![self.keys.env_current_concurrency_key(tenant)?],
            })
            .await?;
        Ok(())
    }

    pub async fn update_env_concurrency_limit(
        &self,
        environment: &RuntimeEnvironment,
    ) -> EngineResult<()> {
        let key = self.keys.env_concurrency_limit_key(&environment.tenant())?;
        self.store
            .set(&key, &environment.maximum_concurrency_limit.to_string())
            .await?;
        Ok(())
    }

    pub async fn update_queue_concurrency_limit(
        &self,
        descriptor: &QueueDescriptor,
        limit: u32,
    ) -> EngineResult<()> {
        let key = self.keys.queue_concurrency_limit_key(descriptor)?;
        self.store.set(&key, &limit.to_string()).await?;
        Ok(())
    }

    pub async fn remove_queue_concurrency_limit(
        &self,
        descriptor: &QueueDescriptor,
    ) -> EngineResult<()> {
        let key = self.keys.queue_concurrency_limit_key(descriptor)?;
        self.store.del(&key).await?;
        Ok(())
    }

    /// Stored environment limit, or the configured default.
    pub async fn env_concurrency_limit(&self, tenant: &TenantDescriptor) -> EngineResult<u32> {
        let key = self.keys.env_concurrency_limit_key(tenant)?;
        let limit = match self.store.get(&key).await? {
            Some(value) => value.parse().map_err(|err| {
                BackendError::message(format!(
                    "invalid concurrency limit at {key}: {err}"
                ))
            })?,
            None => self.config.default_env_concurrency,
        };
        Ok(limit)
    }

    pub async fn length_of_queue(&self, descriptor: &QueueDescriptor) -> EngineResult<usize> {
        Ok(self.store.zcard(&self.keys.queue_key(descriptor)?).await?)
    }

    pub async fn length_of_env_queue(&self, tenant: &TenantDescriptor) -> EngineResult<usize> {
        Ok(self.store.zcard(&self.keys.env_queue_key(tenant)?).await?)
    }

    pub async fn length_of_dead_letter_queue(
        &self,
        tenant: &TenantDescriptor,
    ) -> EngineResult<usize> {
        Ok(self.store.zcard(&self.keys.dead_letter_key(tenant)?).await?)
    }

    pub async fn length_of_worker_queue(&self, worker_queue: &str) -> EngineResult<usize> {
        Ok(self
            .store
            .llen(&self.keys.worker_queue_key(worker_queue))
            .await?)
    }

    pub async fn current_concurrency_of_queue(
        &self,
        descriptor: &QueueDescriptor,
    ) -> EngineResult<usize> {
        Ok(self
            .store
            .scard(&self.keys.queue_current_concurrency_key(descriptor)?)
            .await?)
    }

    pub async fn current_concurrency_of_environment(
        &self,
        tenant: &TenantDescriptor,
    ) -> EngineResult<usize> {
        Ok(self
            .store
            .scard(&self.keys.env_current_concurrency_key(tenant)?)
            .await?)
    }

    /// Queues with ready work across every shard, oldest first.
    pub async fn scan_master_queue(&self, limit: usize) -> EngineResult<Vec<MasterQueueEntry>> {
        let now = now_ms() as f64;
        let mut entries = Vec::new();
        for shard_key in self.keys.master_queue_keys() {
            for (queue_key, score) in self
                .store
                .zrange_by_score(&shard_key, f64::NEG_INFINITY, now, limit)
                .await?
            {
                match self.keys.descriptor_from_queue(&queue_key) {
                    Ok(descriptor) => entries.push(MasterQueueEntry {
                        queue_key,
                        descriptor,
                        score,
                    }),
                    Err(err) => warn!(%queue_key, error = %err, "skipping unparseable master queue entry"),
                }
            }
        }
        entries.sort_by(|a, b| a.score.total_cmp(&b.score));
        entries.truncate(limit);
        Ok(entries)
    }
}
