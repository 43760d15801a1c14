//! Background sweeper for the release token buckets.
//!
//! Every `poll_interval` it hands free tokens to parked releasers and executes
//! their releases. Every `releasings_poll_interval` it revalidates releasers
//! that have held a token longer than `releasings_max_age` and refills the
//! tokens of those whose run has moved on.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use conveyor_run_core::SnapshotId;
use conveyor_shared_store::RefillOutcome;

use super::{ReleaseConcurrencySystem, ReleaseOutcome};
use crate::config::ReleaseConcurrencyConfig;
use crate::error::EngineResult;
use crate::now_ms;

pub struct ReleaseConcurrencySweeper {
    pub system: Arc<ReleaseConcurrencySystem>,
    pub config: ReleaseConcurrencyConfig,
}

impl ReleaseConcurrencySweeper {
    /// Run the sweeper loop.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            releasings_poll_interval_ms = self.config.releasings_poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "release concurrency sweeper started"
        );

        let mut shutdown = std::pin::pin!(shutdown);
        let mut last_releasings_sweep = Instant::now();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("release concurrency sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(err) = self.process_ready_releasers().await {
                        error!(error = %err, "release sweep failed");
                    }
                    if last_releasings_sweep.elapsed() >= self.config.releasings_poll_interval {
                        last_releasings_sweep = Instant::now();
                        if let Err(err) = self.refill_stale_releasings().await {
                            error!(error = %err, "releasings sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// Execute parked releases whose bucket has a free token. Returns how many released.
    pub async fn process_ready_releasers(&self) -> EngineResult<usize> {
        let bucket = self.system.bucket();
        let claimed = bucket
            .claim_ready_releasers(self.config.batch_size, now_ms())
            .await?;
        let mut released = 0;
        for releaser in claimed {
            let tenant = bucket.tenant_for_member(&releaser.member)?;
            let Some(snapshot_id) = SnapshotId::parse(&releaser.releaser_id) else {
                warn!(releaser_id = %releaser.releaser_id, "dropping unparseable releaser");
                bucket.return_token(&tenant, &releaser.releaser_id).await?;
                continue;
            };
            match self
                .system
                .execute_or_return_token(&tenant, &releaser.releaser_id, snapshot_id)
                .await
            {
                Ok(ReleaseOutcome::Released(_)) => released += 1,
                Ok(ReleaseOutcome::Skipped(reason)) => {
                    debug!(%snapshot_id, %reason, "deferred release skipped");
                }
                Err(err) => error!(%snapshot_id, error = %err, "deferred release failed"),
            }
        }
        Ok(released)
    }

    /// Refill tokens held by releasers whose run has moved on; still-current
    /// releasers are re-stamped. Returns how many tokens were refilled.
    pub async fn refill_stale_releasings(&self) -> EngineResult<usize> {
        let bucket = self.system.bucket();
        let now = now_ms();
        let older_than = now - self.config.releasings_max_age.as_millis() as i64;
        let stale = bucket
            .stale_releasings(older_than, self.config.batch_size)
            .await?;

        let mut refilled = 0;
        for releaser in stale {
            let tenant = bucket.tenant_for_member(&releaser.member)?;
            let Some(snapshot_id) = SnapshotId::parse(&releaser.releaser_id) else {
                bucket.return_token(&tenant, &releaser.releaser_id).await?;
                refilled += 1;
                continue;
            };
            if !self
                .system
                .validate_snapshot_should_refill_token(snapshot_id)
                .await?
            {
                bucket.touch_releasing(&releaser.releaser_id, now).await?;
                continue;
            }
            if bucket.refill_releaser(&tenant, snapshot_id, false).await? == RefillOutcome::Refilled {
                info!(%snapshot_id, member = %releaser.member, "refilled stale release token");
                refilled += 1;
            }
        }
        Ok(refilled)
    }
}
