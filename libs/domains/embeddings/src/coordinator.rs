//! Retry coordinator for deferred catalog syncs.

use crate::error::EmbeddingResult;
use crate::models::{FailedOperation, OperationStatus};
use crate::registry::{AttemptUpdate, FailedOperationRepository, RetryPolicy};
use crate::sync::CatalogSyncService;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub claimed: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
    /// Attempts whose outcome could not be written back
    pub errors: usize,
}

pub struct RetryCoordinator {
    registry: Arc<dyn FailedOperationRepository>,
    sync: CatalogSyncService,
    policy: RetryPolicy,
    batch_size: u64,
}

impl RetryCoordinator {
    pub fn new(
        registry: Arc<dyn FailedOperationRepository>,
        sync: CatalogSyncService,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            sync,
            policy,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Claim every operation due at `now` and re-attempt it once.
    pub async fn run_once(&self, now: DateTime<Utc>) -> EmbeddingResult<RetryReport> {
        let due = self.registry.claim_due(now, self.batch_size).await?;
        let mut report = RetryReport {
            claimed: due.len(),
            ..Default::default()
        };

        for op in due {
            match self.attempt(&op, now).await {
                Ok(OperationStatus::Resolved) => report.resolved += 1,
                Ok(OperationStatus::Abandoned) => report.abandoned += 1,
                Ok(_) => report.rescheduled += 1,
                Err(e) => {
                    error!(operation_id = %op.id, error = %e, "Failed to record retry outcome");
                    report.errors += 1;
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                resolved = report.resolved,
                rescheduled = report.rescheduled,
                abandoned = report.abandoned,
                "Retry pass complete"
            );
        }
        Ok(report)
    }

    async fn attempt(&self, op: &FailedOperation, now: DateTime<Utc>) -> EmbeddingResult<OperationStatus> {
        let update = match self.sync.sync(op.target_id, op.operation, None).await {
            Ok(_) => AttemptUpdate {
                attempts: op.attempts,
                status: OperationStatus::Resolved,
                next_retry_at: op.next_retry_at,
                last_error: None,
            },
            Err(e) => {
                let attempts = op.attempts + 1;
                let (status, next_retry_at) = self.policy.after_failure(attempts, now);
                if status == OperationStatus::Abandoned {
                    warn!(
                        operation_id = %op.id,
                        target_id = %op.target_id,
                        attempts,
                        error = %e,
                        "Giving up on operation"
                    );
                }
                AttemptUpdate {
                    attempts,
                    status,
                    next_retry_at,
                    last_error: Some(e.to_string()),
                }
            }
        };

        let saved = self.registry.save_attempt(op.id, update, now).await?;
        counter!("failed_operations_total", "status" => saved.status.to_string()).increment(1);
        Ok(saved.status)
    }
}
