use conveyor_backends_core::BackendResult;
use conveyor_shared_store::{
    AcknowledgeMessageScript, DequeueMessagesScript, DequeuedMessage, EnqueueMessageScript,
    NackMessageScript,
    NackOutcome, QueueMessageKeys, RedriveMessageScript, ReleaseConcurrencyScript,
    RunQueueScripts,
};

use crate::MemorySharedStore;
use crate::keyspace::Keyspace;

/// Master queue entries are scored by the oldest message of their queue.
fn refresh_master_queue(keyspace: &mut Keyspace, master_queue_key: &str, queue_key: &str) {
    match keyspace.zfirst(queue_key) {
        Some((_, score)) => keyspace.zadd(master_queue_key, queue_key, score),
        None => {
            keyspace.zrem(master_queue_key, queue_key);
        }
    }
}

fn drop_concurrency(keyspace: &mut Keyspace, keys: &QueueMessageKeys, run_id: &str) {
    keyspace.srem(&keys.queue_current_concurrency_key, run_id);
    keyspace.srem(&keys.env_current_concurrency_key, run_id);
}

fn place_on_queue(keyspace: &mut Keyspace, keys: &QueueMessageKeys, run_id: &str, score: f64) {
    keyspace.zadd(&keys.queue_key, run_id, score);
    keyspace.zadd(&keys.env_queue_key, run_id, score);
    refresh_master_queue(keyspace, &keys.master_queue_key, &keys.queue_key);
}

#[async_trait::async_trait]
impl RunQueueScripts for MemorySharedStore {
    async fn enqueue_message(&self, script: &EnqueueMessageScript) -> BackendResult<()> {
        let mut keyspace = self.keyspace();
        keyspace.set(&script.keys.message_key, script.message_payload.as_str());
        drop_concurrency(&mut keyspace, &script.keys, &script.run_id);
        place_on_queue(&mut keyspace, &script.keys, &script.run_id, script.score);
        Ok(())
    }

    async fn dequeue_messages(
        &self,
        script: &DequeueMessagesScript,
    ) -> BackendResult<Vec<DequeuedMessage>> {
        let mut keyspace = self.keyspace();

        let env_limit = keyspace
            .get_u32(&script.env_concurrency_limit_key)?
            .unwrap_or(script.default_env_concurrency_limit) as usize;
        // A queue never admits more than its environment.
        let queue_limit = keyspace
            .get_u32(&script.queue_concurrency_limit_key)?
            .map_or(env_limit, |limit| (limit as usize).min(env_limit));

        let env_current = keyspace.scard(&script.env_current_concurrency_key);
        let queue_current = keyspace.scard(&script.queue_current_concurrency_key);
        let capacity = env_limit
            .saturating_sub(env_current)
            .min(queue_limit.saturating_sub(queue_current))
            .min(script.max_count);

        let ready = keyspace.zrange_by_score(
            &script.queue_key,
            f64::NEG_INFINITY,
            script.now_ms as f64,
            capacity,
        );

        let mut payloads = Vec::with_capacity(ready.len());
        for (run_id, _) in ready {
            keyspace.zrem(&script.queue_key, &run_id);
            keyspace.zrem(&script.env_queue_key, &run_id);
            let message_key = format!("{}{}", script.message_key_prefix, run_id);
            let Some(payload) = keyspace.get(&message_key).cloned() else {
                tracing::warn!(%run_id, "queued run has no stored message, dropping");
                continue;
            };
            keyspace.sadd(&script.queue_current_concurrency_key, &run_id);
            keyspace.sadd(&script.env_current_concurrency_key, &run_id);
            payloads.push(DequeuedMessage { run_id, payload });
        }

        refresh_master_queue(&mut keyspace, &script.master_queue_key, &script.queue_key);
        Ok(payloads)
    }

    async fn acknowledge_message(&self, script: &AcknowledgeMessageScript) -> BackendResult<()> {
        let mut keyspace = self.keyspace();
        let keys = &script.keys;
        keyspace.del(&keys.message_key);
        keyspace.zrem(&keys.queue_key, &script.run_id);
        keyspace.zrem(&keys.env_queue_key, &script.run_id);
        drop_concurrency(&mut keyspace, keys, &script.run_id);
        refresh_master_queue(&mut keyspace, &keys.master_queue_key, &keys.queue_key);
        Ok(())
    }

    async fn nack_message(&self, script: &NackMessageScript) -> BackendResult<NackOutcome> {
        let mut keyspace = self.keyspace();
        let keys = &script.keys;
        if keyspace.get(&keys.message_key).is_none() {
            return Ok(NackOutcome::Missing);
        }

        keyspace.set(&keys.message_key, script.message_payload.as_str());
        drop_concurrency(&mut keyspace, keys, &script.run_id);

        if script.dead_letter {
            keyspace.zrem(&keys.queue_key, &script.run_id);
            keyspace.zrem(&keys.env_queue_key, &script.run_id);
            keyspace.zadd(&script.dead_letter_key, &script.run_id, script.now_ms as f64);
            refresh_master_queue(&mut keyspace, &keys.master_queue_key, &keys.queue_key);
            return Ok(NackOutcome::DeadLettered);
        }

        place_on_queue(&mut keyspace, keys, &script.run_id, script.retry_at);
        Ok(NackOutcome::Requeued)
    }

    async fn redrive_message(&self, script: &RedriveMessageScript) -> BackendResult<bool> {
        let mut keyspace = self.keyspace();
        if !keyspace.zrem(&script.dead_letter_key, &script.run_id) {
            return Ok(false);
        }
        keyspace.set(&script.keys.message_key, script.message_payload.as_str());
        place_on_queue(&mut keyspace, &script.keys, &script.run_id, script.score);
        Ok(true)
    }

    async fn release_concurrency(&self, script: &ReleaseConcurrencyScript) -> BackendResult<()> {
        let mut keyspace = self.keyspace();
        for key in &script.concurrency_keys {
            keyspace.srem(key, &script.run_id);
        }
        Ok(())
    }

    async fn push_worker_queue(&self, key: &str, entry: &str) -> BackendResult<()> {
        self.keyspace().rpush(key, entry);
        Ok(())
    }

    async fn pop_worker_queue(&self, key: &str) -> BackendResult<Option<String>> {
        Ok(self.keyspace().lpop(key))
    }
}

#[cfg(test)]
mod tests {
    use conveyor_shared_store::KeyValueStore;

    use super::*;

    fn keys(run_id: &str) -> QueueMessageKeys {
        QueueMessageKeys {
            message_key: format!("msg:{run_id}"),
            queue_key: "q".to_string(),
            env_queue_key: "env:q".to_string(),
            master_queue_key: "master".to_string(),
            queue_current_concurrency_key: "q:cc".to_string(),
            env_current_concurrency_key: "env:cc".to_string(),
        }
    }

    fn dequeue(max_count: usize) -> DequeueMessagesScript {
        DequeueMessagesScript {
            queue_key: "q".to_string(),
            env_queue_key: "env:q".to_string(),
            master_queue_key: "master".to_string(),
            queue_concurrency_limit_key: "q:limit".to_string(),
            queue_current_concurrency_key: "q:cc".to_string(),
            env_concurrency_limit_key: "env:limit".to_string(),
            env_current_concurrency_key: "env:cc".to_string(),
            message_key_prefix: "msg:".to_string(),
            default_env_concurrency_limit: 10,
            max_count,
            now_ms: 1_000,
        }
    }

    async fn enqueue(store: &MemorySharedStore, run_id: &str, score: f64) {
        store
            .enqueue_message(&EnqueueMessageScript {
                keys: keys(run_id),
                run_id: run_id.to_string(),
                message_payload: format!("payload-{run_id}"),
                score,
            })
            .await
            .expect("enqueue");
    }

    #[tokio::test]
    async fn dequeue_honors_queue_limit_and_master_score() {
        let store = MemorySharedStore::new();
        enqueue(&store, "r1", 10.0).await;
        enqueue(&store, "r2", 20.0).await;
        enqueue(&store, "r3", 30.0).await;
        store.set("q:limit", "2").await.unwrap();

        let popped = store.dequeue_messages(&dequeue(10)).await.unwrap();
        let payloads: Vec<&str> = popped.iter().map(|message| message.payload.as_str()).collect();
        assert_eq!(payloads, vec!["payload-r1", "payload-r2"]);
        assert_eq!(popped[0].run_id, "r1");
        assert_eq!(store.scard("env:cc").await.unwrap(), 2);
        assert_eq!(
            store.zrange_by_score("master", f64::NEG_INFINITY, f64::INFINITY, 10).await.unwrap(),
            vec![("q".to_string(), 30.0)]
        );

        assert!(store.dequeue_messages(&dequeue(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_messages_stay_queued() {
        let store = MemorySharedStore::new();
        enqueue(&store, "later", 5_000.0).await;
        assert!(store.dequeue_messages(&dequeue(10)).await.unwrap().is_empty());
        assert_eq!(store.zcard("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nack_dead_letters_and_redrive_restores() {
        let store = MemorySharedStore::new();
        enqueue(&store, "r1", 10.0).await;
        store.dequeue_messages(&dequeue(1)).await.unwrap();

        let outcome = store
            .nack_message(&NackMessageScript {
                keys: keys("r1"),
                dead_letter_key: "dlq".to_string(),
                run_id: "r1".to_string(),
                message_payload: "payload-r1-attempt-2".to_string(),
                retry_at: 2_000.0,
                dead_letter: true,
                now_ms: 1_000,
            })
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        assert_eq!(store.scard("env:cc").await.unwrap(), 0);
        assert_eq!(store.zcard("dlq").await.unwrap(), 1);
        assert_eq!(store.zcard("master").await.unwrap(), 0);

        let redriven = store
            .redrive_message(&RedriveMessageScript {
                keys: keys("r1"),
                dead_letter_key: "dlq".to_string(),
                run_id: "r1".to_string(),
                message_payload: "payload-r1".to_string(),
                score: 50.0,
            })
            .await
            .unwrap();
        assert!(redriven);
        assert_eq!(store.zcard("dlq").await.unwrap(), 0);
        assert_eq!(
            store.dequeue_messages(&dequeue(1)).await.unwrap(),
            vec![DequeuedMessage {
                run_id: "r1".to_string(),
                payload: "payload-r1".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn worker_queue_is_fifo() {
        let store = MemorySharedStore::new();
        store.push_worker_queue("w", "a").await.unwrap();
        store.push_worker_queue("w", "b").await.unwrap();
        assert_eq!(store.pop_worker_queue("w").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop_worker_queue("w").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop_worker_queue("w").await.unwrap(), None);
    }
}
