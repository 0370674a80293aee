use crate::models::CatalogChange;
use crate::sync::{CatalogSyncService, SyncOutcome};
use async_trait::async_trait;
use stream_worker::{JobOutcome, StreamError, StreamEvent, StreamProcessor};
use tracing::debug;

/// Consumes catalog changes. A sync that fails is handed to the
/// failed-operation registry and the message is still acknowledged; only a
/// registry write failure leaves the message pending.
pub struct CatalogChangeProcessor {
    sync: CatalogSyncService,
}

impl CatalogChangeProcessor {
    pub fn new(sync: CatalogSyncService) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl StreamProcessor<CatalogChange> for CatalogChangeProcessor {
    async fn process(&self, event: &StreamEvent<CatalogChange>) -> Result<JobOutcome, StreamError> {
        let change = &event.job;
        match self.sync.apply(change).await? {
            SyncOutcome::Deferred { operation_id } => {
                debug!(
                    change_id = %change.change_id,
                    operation_id = %operation_id,
                    "Catalog change deferred to retry registry"
                );
                Ok(JobOutcome::Skipped("deferred"))
            }
            _ => Ok(JobOutcome::Processed),
        }
    }

    fn name(&self) -> &'static str {
        "catalog_sync"
    }
}
