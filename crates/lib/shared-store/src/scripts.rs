use crate::BackendResult;

/// Keys touched when a message enters (or re-enters) a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessageKeys {
    pub message_key: String,
    pub queue_key: String,
    pub env_queue_key: String,
    pub master_queue_key: String,
    pub queue_current_concurrency_key: String,
    pub env_current_concurrency_key: String,
}

#[derive(Clone, Debug)]
pub struct EnqueueMessageScript {
    pub keys: QueueMessageKeys,
    pub run_id: String,
    pub message_payload: String,
    pub score: f64,
}

#[derive(Clone, Debug)]
pub struct DequeueMessagesScript {
    pub queue_key: String,
    pub env_queue_key: String,
    pub master_queue_key: String,
    pub queue_concurrency_limit_key: String,
    pub queue_current_concurrency_key: String,
    pub env_concurrency_limit_key: String,
    pub env_current_concurrency_key: String,
    /// Message keys are `message_key_prefix + run_id`.
    pub message_key_prefix: String,
    pub default_env_concurrency_limit: u32,
    pub max_count: usize,
    pub now_ms: i64,
}

/// A run popped by [`RunQueueScripts::dequeue_messages`] with its stored payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DequeuedMessage {
    pub run_id: String,
    pub payload: String,
}

#[derive(Clone, Debug)]
pub struct AcknowledgeMessageScript {
    pub keys: QueueMessageKeys,
    pub run_id: String,
}

#[derive(Clone, Debug)]
pub struct NackMessageScript {
    pub keys: QueueMessageKeys,
    pub dead_letter_key: String,
    pub run_id: String,
    /// Message with its attempt already incremented.
    pub message_payload: String,
    pub retry_at: f64,
    pub dead_letter: bool,
    pub now_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued,
    DeadLettered,
    /// The message no longer exists.
    Missing,
}

#[derive(Clone, Debug)]
pub struct RedriveMessageScript {
    pub keys: QueueMessageKeys,
    pub dead_letter_key: String,
    pub run_id: String,
    pub message_payload: String,
    pub score: f64,
}

#[derive(Clone, Debug)]
pub struct ReleaseConcurrencyScript {
    pub run_id: String,
    /// Current-concurrency sets the run is removed from.
    pub concurrency_keys: Vec<String>,
}

/// Atomic run queue operations.
#[async_trait::async_trait]
pub trait RunQueueScripts: Send + Sync {
    /// Store the message, add it to its queue and environment queue, drop any
    /// concurrency the run still holds and refresh the master queue score.
    async fn enqueue_message(&self, script: &EnqueueMessageScript) -> BackendResult<()>;

    /// Pop up to `max_count` ready messages while both the environment and the
    /// queue stay under their limits; popped runs join both concurrency sets.
    /// Returns each popped run with its stored message payload.
    async fn dequeue_messages(
        &self,
        script: &DequeueMessagesScript,
    ) -> BackendResult<Vec<DequeuedMessage>>;

    async fn acknowledge_message(&self, script: &AcknowledgeMessageScript) -> BackendResult<()>;

    async fn nack_message(&self, script: &NackMessageScript) -> BackendResult<NackOutcome>;

    /// Move a dead-lettered message back onto its queue. Returns false if it was not dead-lettered.
    async fn redrive_message(&self, script: &RedriveMessageScript) -> BackendResult<bool>;

    async fn release_concurrency(&self, script: &ReleaseConcurrencyScript) -> BackendResult<()>;

    async fn push_worker_queue(&self, key: &str, entry: &str) -> BackendResult<()>;

    async fn pop_worker_queue(&self, key: &str) -> BackendResult<Option<String>>;
}

/// Atomic deficit counter operations for the fair scheduler.
#[async_trait::async_trait]
pub trait DeficitScripts: Send + Sync {
    /// Add `quantum` to every listed tenant, capping each at `max_deficit`.
    /// Returns the new deficits in input order.
    async fn add_quantum(
        &self,
        key: &str,
        tenant_ids: &[String],
        quantum: f64,
        max_deficit: f64,
    ) -> BackendResult<Vec<f64>>;

    /// Subtract processed counts, flooring at zero. Returns the new deficits in input order.
    async fn decrement_deficits(
        &self,
        key: &str,
        processed: &[(String, f64)],
    ) -> BackendResult<Vec<f64>>;

    async fn reset_deficit(&self, key: &str, tenant_id: &str) -> BackendResult<()>;

    /// Drop every deficit whose tenant is not in `active`, in one step.
    /// Returns how many were dropped.
    async fn reset_deficits_except(&self, key: &str, active: &[String]) -> BackendResult<usize>;
}

/// Key templates for the release-concurrency token buckets.
///
/// Every bucket is identified by a `member` string (the environment key);
/// per-bucket keys are derived from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenBucketKeyspace {
    pub prefix: String,
    pub master_key: String,
    pub releasings_key: String,
    pub releasings_meta_key: String,
}

impl TokenBucketKeyspace {
    pub fn bucket_key(&self, member: &str) -> String {
        format!("{}{member}:bucket", self.prefix)
    }

    pub fn pending_key(&self, member: &str) -> String {
        format!("{}{member}:queue", self.prefix)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimedReleaser {
    pub member: String,
    pub releaser_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseAttempt {
    /// A token was consumed; the caller releases now.
    Consumed,
    /// No token was available; the releaser was parked.
    Queued,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefillOutcome {
    /// The releaser held a token and it went back into the bucket.
    Refilled,
    /// The releaser was still parked and has been dropped from the queue.
    Cancelled,
    NotFound,
}

/// Atomic token bucket operations. Buckets start full (`max_tokens`) on first use.
#[async_trait::async_trait]
pub trait TokenBucketScripts: Send + Sync {
    async fn attempt_release(
        &self,
        keyspace: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
        now_ms: i64,
    ) -> BackendResult<ReleaseAttempt>;

    /// Take a token without parking. Returns false if the bucket is empty.
    async fn consume_token(
        &self,
        keyspace: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
        now_ms: i64,
    ) -> BackendResult<bool>;

    /// Put one token back (capped at `max_tokens`) and forget the releaser. Returns the token count.
    async fn return_token(
        &self,
        keyspace: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
    ) -> BackendResult<f64>;

    /// Give back the token a releaser consumed. With `cancel_parked` a releaser
    /// still waiting for a token is dropped from the queue instead.
    async fn refill_releaser(
        &self,
        keyspace: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
        cancel_parked: bool,
    ) -> BackendResult<RefillOutcome>;

    /// Add tokens (capped) and return the token count.
    async fn refill_tokens(
        &self,
        keyspace: &TokenBucketKeyspace,
        member: &str,
        amount: f64,
        max_tokens: f64,
    ) -> BackendResult<f64>;

    /// Pop parked releasers from buckets with free tokens, consuming one token each.
    async fn claim_ready_releasers(
        &self,
        keyspace: &TokenBucketKeyspace,
        limit: usize,
        now_ms: i64,
    ) -> BackendResult<Vec<ClaimedReleaser>>;

    /// Releasers that consumed a token before `older_than_ms`.
    async fn stale_releasings(
        &self,
        keyspace: &TokenBucketKeyspace,
        older_than_ms: i64,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedReleaser>>;

    async fn touch_releasing(
        &self,
        keyspace: &TokenBucketKeyspace,
        releaser_id: &str,
        now_ms: i64,
    ) -> BackendResult<()>;
}
