use std::collections::{BTreeMap, HashSet};

use tracing::{debug, error, info};

use super::DrrScheduler;
use crate::error::EngineResult;
use crate::run_queue::RunQueue;

/// What one dispatch round moved, by tenant id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub dispatched: BTreeMap<String, usize>,
    pub idle_reset: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.dispatched.values().sum()
    }
}

/// Moves ready messages from tenant queues onto worker queues in DRR order.
pub struct FairDispatchTask {
    pub scheduler: DrrScheduler,
    pub run_queue: RunQueue,
}

impl FairDispatchTask {
    /// Run the dispatch loop.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        let config = self.scheduler.config().clone();
        info!(
            poll_interval_ms = config.poll_interval.as_millis(),
            quantum = config.quantum,
            per_tenant_batch = config.per_tenant_batch,
            "fair dispatch task started"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("fair dispatch task shutting down");
                    break;
                }
                _ = tokio::time::sleep(config.poll_interval) => {
                    if let Err(err) = self.dispatch_round().await {
                        error!(error = %err, "dispatch round failed");
                    }
                }
            }
        }
    }

    /// One scan, select, dequeue, and record cycle.
    pub async fn dispatch_round(&self) -> EngineResult<DispatchReport> {
        let entries = self
            .run_queue
            .scan_master_queue(self.run_queue.config().master_queue_scan_limit)
            .await?;
        let active: HashSet<String> = entries
            .iter()
            .map(|entry| entry.descriptor.environment_id.clone())
            .collect();

        let per_tenant_batch = self.scheduler.config().per_tenant_batch;
        let mut report = DispatchReport::default();
        let mut processed = Vec::new();

        for tenant in self.scheduler.select_queues(&entries).await? {
            let budget = (tenant.deficit.floor() as usize).min(per_tenant_batch);
            let mut count = 0;
            for queue in &tenant.queues {
                if count >= budget {
                    break;
                }
                let messages = match self
                    .run_queue
                    .dequeue_message_from_queue(&queue.queue_key, budget - count)
                    .await
                {
                    Ok(messages) => messages,
                    Err(err) => {
                        error!(queue_key = %queue.queue_key, error = %err, "failed to dequeue from queue");
                        continue;
                    }
                };
                for message in &messages {
                    match self.run_queue.push_to_worker_queue(message).await {
                        Ok(()) => count += 1,
                        Err(err) => {
                            error!(run_id = %message.run_id, error = %err, "failed to push to worker queue");
                            // Back onto its queue, which also frees the slot it was given.
                            if let Err(err) = self.run_queue.enqueue_message(message).await {
                                error!(run_id = %message.run_id, error = %err, "failed to requeue message");
                            }
                        }
                    }
                }
            }

            if count > 0 {
                let tenant_id = tenant.tenant.tenant_id().to_string();
                debug!(%tenant_id, count, deficit = tenant.deficit, "dispatched tenant messages");
                processed.push((tenant_id.clone(), count as u32));
                report.dispatched.insert(tenant_id, count);
            }
        }

        self.scheduler.record_processed_batch(&processed).await?;
        report.idle_reset = self.scheduler.reset_idle_tenants(&active).await?;
        Ok(report)
    }
}
