//! Failed-operation triage, retry passes and cache control.
//!
//! Each command takes the services it needs, so `main` wires Postgres and
//! Redis while tests drive the same code against in-memory backends.

use chrono::{DateTime, Utc};
use domain_embeddings::{
    FailedOperation, FailedOperationRepository, OperationStatus, RetryCoordinator, RetryReport,
    SimilarityEngine,
};
use eyre::{Result, WrapErr};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// What `failed retry` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RetryOutput {
    /// Made due; the next coordinator pass picks it up
    Requeued(FailedOperation),
    /// Made due and retried right away
    Retried(RetryReport),
}

pub async fn list_failed(
    registry: &dyn FailedOperationRepository,
    status: Option<OperationStatus>,
    limit: u64,
) -> Result<Vec<FailedOperation>> {
    registry
        .list(status, limit)
        .await
        .wrap_err("Failed to list failed operations")
}

/// Requeue one operation. With a coordinator, run a retry pass immediately.
pub async fn retry_failed(
    registry: &dyn FailedOperationRepository,
    id: Uuid,
    now: DateTime<Utc>,
    coordinator: Option<&RetryCoordinator>,
) -> Result<RetryOutput> {
    let operation = registry
        .requeue(id, now)
        .await
        .wrap_err_with(|| format!("Failed to requeue operation {}", id))?;
    info!(operation_id = %operation.id, target_id = %operation.target_id, "Operation requeued");

    match coordinator {
        Some(coordinator) => Ok(RetryOutput::Retried(run_retry_pass(coordinator, now).await?)),
        None => Ok(RetryOutput::Requeued(operation)),
    }
}

pub async fn run_retry_pass(coordinator: &RetryCoordinator, now: DateTime<Utc>) -> Result<RetryReport> {
    coordinator
        .run_once(now)
        .await
        .wrap_err("Retry pass failed")
}

pub async fn clear_cache(engine: &SimilarityEngine) -> Result<u64> {
    engine
        .clear_cache()
        .await
        .wrap_err("Failed to clear similarity cache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use domain_embeddings::{
        CatalogItem, CatalogSource, CatalogSyncService, EmbeddingError, EmbeddingResult,
        EmbeddingVector, InMemoryFailedOperationRepository, InMemoryResultCache, InMemoryVectorStore,
        OperationKind, RetryPolicy, Space, VectorEncoder, VectorStore,
    };
    use std::sync::Arc;
    use std::time::Duration;

    struct AxisEncoder;

    #[async_trait]
    impl VectorEncoder for AxisEncoder {
        async fn encode(&self, _text: &str) -> EmbeddingResult<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        fn name(&self) -> &'static str {
            "axis"
        }
    }

    /// Every id is in the catalog with the same text.
    struct OpenCatalog;

    #[async_trait]
    impl CatalogSource for OpenCatalog {
        async fn list_page(&self, _offset: usize, _limit: usize) -> EmbeddingResult<Vec<CatalogItem>> {
            Ok(vec![])
        }

        async fn get(&self, id: Uuid) -> EmbeddingResult<Option<CatalogItem>> {
            Ok(Some(CatalogItem {
                id,
                text: "trail shoes".to_string(),
            }))
        }
    }

    struct Fixture {
        registry: Arc<InMemoryFailedOperationRepository>,
        store: Arc<InMemoryVectorStore>,
        engine: SimilarityEngine,
        coordinator: RetryCoordinator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryFailedOperationRepository::new());
        let store = Arc::new(InMemoryVectorStore::new());
        let engine = SimilarityEngine::new(
            store.clone(),
            Arc::new(InMemoryResultCache::new(Duration::from_secs(60))),
            0.35,
        );
        let sync = CatalogSyncService::new(
            store.clone(),
            Arc::new(AxisEncoder),
            registry.clone(),
            engine.clone(),
            Arc::new(OpenCatalog),
        );
        let coordinator = RetryCoordinator::new(registry.clone(), sync, RetryPolicy::default());
        Fixture {
            registry,
            store,
            engine,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_list_failed_filters_by_status() {
        let fx = fixture();
        let now = Utc::now();
        for _ in 0..3 {
            fx.registry
                .record(Uuid::new_v4(), OperationKind::Update, "encoder timeout", now)
                .await
                .unwrap();
        }

        let failed = list_failed(fx.registry.as_ref(), Some(OperationStatus::Failed), 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 3);

        let limited = list_failed(fx.registry.as_ref(), None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let resolved = list_failed(fx.registry.as_ref(), Some(OperationStatus::Resolved), 10)
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_requeues_without_running() {
        let fx = fixture();
        let now = Utc::now();
        let op = fx
            .registry
            .record(Uuid::new_v4(), OperationKind::Create, "catalog 503", now)
            .await
            .unwrap();

        let output = retry_failed(fx.registry.as_ref(), op.id, now, None)
            .await
            .unwrap();
        let RetryOutput::Requeued(requeued) = output else {
            panic!("expected a requeue, got {:?}", output);
        };
        assert_eq!(requeued.status, OperationStatus::Failed);
        assert_eq!(requeued.next_retry_at, now);
        assert!(fx.store.get(Space::Entity, op.target_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_now_resolves_operation() {
        let fx = fixture();
        let now = Utc::now();
        let op = fx
            .registry
            .record(Uuid::new_v4(), OperationKind::Create, "catalog 503", now)
            .await
            .unwrap();

        let output = retry_failed(fx.registry.as_ref(), op.id, now, Some(&fx.coordinator))
            .await
            .unwrap();
        let RetryOutput::Retried(report) = output else {
            panic!("expected a retry pass, got {:?}", output);
        };
        assert_eq!(report.claimed, 1);
        assert_eq!(report.resolved, 1);

        let stored = fx.registry.get(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Resolved);
        assert!(fx.store.get(Space::Entity, op.target_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_failed_unknown_id_is_an_error() {
        let fx = fixture();
        let err = retry_failed(fx.registry.as_ref(), Uuid::new_v4(), Utc::now(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmbeddingError>(),
            Some(EmbeddingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_retry_pass_only_takes_due_operations() {
        let fx = fixture();
        let now = Utc::now();
        fx.registry
            .record(Uuid::new_v4(), OperationKind::Update, "timeout", now)
            .await
            .unwrap();

        let early = run_retry_pass(&fx.coordinator, now).await.unwrap();
        assert_eq!(early, RetryReport::default());

        let due = run_retry_pass(&fx.coordinator, now + chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(due.claimed, 1);
        assert_eq!(due.resolved, 1);
    }

    #[tokio::test]
    async fn test_clear_cache_drops_cached_results() {
        let fx = fixture();
        fx.store
            .put(
                Space::Entity,
                EmbeddingVector::first(Uuid::new_v4(), vec![1.0, 0.0], Utc::now()),
                None,
            )
            .await
            .unwrap();
        fx.engine.search(&[1.0, 0.0], 5).await.unwrap();
        fx.engine.search(&[0.0, 1.0], 5).await.unwrap();

        assert_eq!(clear_cache(&fx.engine).await.unwrap(), 2);
        assert_eq!(clear_cache(&fx.engine).await.unwrap(), 0);
    }
}
