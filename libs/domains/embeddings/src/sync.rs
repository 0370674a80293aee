//! Catalog-to-vector synchronization.
//!
//! Entity vectors follow the catalog: create and update re-encode the item
//! text, delete removes the vector and invalidates cached similarity
//! results. A sync that fails is written to the failed-operation registry
//! and retried later by the coordinator.

use crate::encoder::VectorEncoder;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{CatalogChange, EmbeddingVector, OperationKind, PutResult, Space};
use crate::registry::FailedOperationRepository;
use crate::similarity::SimilarityEngine;
use crate::store::VectorStore;
use async_trait::async_trait;
use chrono::Utc;
use core_config::{ConfigError, FromEnv, env_parse, env_required};
use futures::stream::{self, StreamExt};
use metrics::counter;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: Uuid,
    pub text: String,
}

/// Read access to the entity catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Items in the catalog's own order.
    async fn list_page(&self, offset: usize, limit: usize) -> EmbeddingResult<Vec<CatalogItem>>;

    async fn get(&self, id: Uuid) -> EmbeddingResult<Option<CatalogItem>>;
}

#[derive(Debug, Clone)]
pub struct HttpCatalogConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl FromEnv for HttpCatalogConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let timeout_secs: u64 = env_parse("CATALOG_TIMEOUT_SECS", 10)?;
        Ok(Self {
            base_url: env_required("CATALOG_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Catalog service speaking `GET /items?offset=&limit=` and `GET /items/{id}`.
pub struct HttpCatalogSource {
    client: Client,
    base_url: String,
}

impl HttpCatalogSource {
    pub fn new(config: HttpCatalogConfig) -> EmbeddingResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }
}

fn catalog_error(e: reqwest::Error) -> EmbeddingError {
    EmbeddingError::Catalog(e.to_string())
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn list_page(&self, offset: usize, limit: usize) -> EmbeddingResult<Vec<CatalogItem>> {
        let response = self
            .client
            .get(format!("{}/items", self.base_url))
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await
            .map_err(catalog_error)?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Catalog(format!(
                "listing items failed with {}",
                response.status()
            )));
        }
        response.json().await.map_err(catalog_error)
    }

    async fn get(&self, id: Uuid) -> EmbeddingResult<Option<CatalogItem>> {
        let response = self
            .client
            .get(format!("{}/items/{}", self.base_url, id))
            .send()
            .await
            .map_err(catalog_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json().await.map(Some).map_err(catalog_error),
            status => Err(EmbeddingError::Catalog(format!(
                "fetching item {} failed with {}",
                id, status
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Stored { version: i64 },
    Deleted { existed: bool },
    /// Recorded in the failed-operation registry for a later retry
    Deferred { operation_id: Uuid },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CatalogSyncService {
    store: Arc<dyn VectorStore>,
    encoder: Arc<dyn VectorEncoder>,
    registry: Arc<dyn FailedOperationRepository>,
    engine: SimilarityEngine,
    catalog: Arc<dyn CatalogSource>,
}

impl CatalogSyncService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        encoder: Arc<dyn VectorEncoder>,
        registry: Arc<dyn FailedOperationRepository>,
        engine: SimilarityEngine,
        catalog: Arc<dyn CatalogSource>,
    ) -> Self {
        Self {
            store,
            encoder,
            registry,
            engine,
            catalog,
        }
    }

    /// Bring one entity vector in line with the catalog. Errors are returned
    /// as-is; nothing is recorded.
    pub async fn sync(
        &self,
        entity_id: Uuid,
        operation: OperationKind,
        text: Option<&str>,
    ) -> EmbeddingResult<SyncOutcome> {
        if operation == OperationKind::Delete {
            return self.delete(entity_id).await;
        }

        let text = match text {
            Some(text) => text.to_string(),
            None => match self.catalog.get(entity_id).await? {
                Some(item) => item.text,
                None => {
                    info!(entity_id = %entity_id, "Entity no longer in catalog, removing vector");
                    return self.delete(entity_id).await;
                }
            },
        };
        if text.trim().is_empty() {
            return Err(EmbeddingError::Validation(format!(
                "entity {} has no text to encode",
                entity_id
            )));
        }

        let vector = self.encoder.encode(&text).await?;
        let current = self.store.get(Space::Entity, entity_id).await?;
        let expected = current.as_ref().map(|c| c.version);
        let next = EmbeddingVector::next(entity_id, current.as_ref(), vector, Utc::now());

        match self.store.put(Space::Entity, next, expected).await? {
            PutResult::Stored(stored) => {
                debug!(entity_id = %entity_id, version = stored.version, "Entity vector stored");
                Ok(SyncOutcome::Stored {
                    version: stored.version,
                })
            }
            PutResult::Conflict { .. } => Err(EmbeddingError::VersionConflict {
                owner_id: entity_id,
                expected,
            }),
        }
    }

    async fn delete(&self, entity_id: Uuid) -> EmbeddingResult<SyncOutcome> {
        let existed = self.store.delete(Space::Entity, entity_id).await?;
        // Cached results may still list the entity
        self.engine.clear_cache().await?;
        info!(entity_id = %entity_id, existed, "Entity vector deleted");
        Ok(SyncOutcome::Deleted { existed })
    }

    /// Apply a catalog change. A failed sync is recorded in the registry and
    /// reported as [`SyncOutcome::Deferred`]; only a registry failure is an error.
    pub async fn apply(&self, change: &CatalogChange) -> EmbeddingResult<SyncOutcome> {
        match self
            .sync(change.entity_id, change.operation, change.text.as_deref())
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.defer(change.entity_id, change.operation, &e).await,
        }
    }

    async fn defer(
        &self,
        entity_id: Uuid,
        operation: OperationKind,
        error: &EmbeddingError,
    ) -> EmbeddingResult<SyncOutcome> {
        warn!(entity_id = %entity_id, operation = %operation, error = %error, "Catalog sync failed, deferring");
        let recorded = self
            .registry
            .record(entity_id, operation, &error.to_string(), Utc::now())
            .await?;
        counter!("failed_operations_total", "status" => "failed").increment(1);
        Ok(SyncOutcome::Deferred {
            operation_id: recorded.id,
        })
    }

    /// Re-encode every catalog item, `page_size` items per catalog request
    /// and up to `concurrency` encodes in flight. `progress` sees the running
    /// totals after each page.
    pub async fn resync_all<F>(
        &self,
        page_size: usize,
        concurrency: usize,
        progress: F,
    ) -> EmbeddingResult<ResyncReport>
    where
        F: Fn(&ResyncReport),
    {
        let page_size = page_size.max(1);
        let mut report = ResyncReport::default();
        let mut offset = 0;

        loop {
            let page = self.catalog.list_page(offset, page_size).await?;
            let fetched = page.len();
            if fetched == 0 {
                break;
            }

            let results: Vec<EmbeddingResult<SyncOutcome>> = stream::iter(page)
                .map(|item| async move {
                    match self
                        .sync(item.id, OperationKind::Update, Some(&item.text))
                        .await
                    {
                        Ok(outcome) => Ok(outcome),
                        Err(e) => self.defer(item.id, OperationKind::Update, &e).await,
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

            for result in results {
                report.total += 1;
                match result {
                    Ok(SyncOutcome::Deferred { .. }) | Err(_) => report.failed += 1,
                    Ok(_) => report.synced += 1,
                }
            }
            progress(&report);

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        info!(
            total = report.total,
            synced = report.synced,
            failed = report.failed,
            "Catalog resync finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::MockVectorEncoder;
    use crate::models::OperationStatus;
    use crate::registry::InMemoryFailedOperationRepository;
    use crate::similarity::InMemoryResultCache;
    use crate::store::InMemoryVectorStore;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn encoder_ok() -> Arc<dyn VectorEncoder> {
        let mut encoder = MockVectorEncoder::new();
        encoder.expect_encode().returning(|text| {
            if text.contains("boots") {
                Ok(vec![0.0, 1.0])
            } else {
                Ok(vec![1.0, 0.0])
            }
        });
        encoder.expect_name().return_const("mock");
        Arc::new(encoder)
    }

    fn encoder_down() -> Arc<dyn VectorEncoder> {
        let mut encoder = MockVectorEncoder::new();
        encoder
            .expect_encode()
            .returning(|_| Err(EmbeddingError::Encoder("timeout".into())));
        encoder.expect_name().return_const("mock");
        Arc::new(encoder)
    }

    fn empty_catalog() -> Arc<dyn CatalogSource> {
        let mut catalog = MockCatalogSource::new();
        catalog.expect_get().returning(|_| Ok(None));
        catalog.expect_list_page().returning(|_, _| Ok(vec![]));
        Arc::new(catalog)
    }

    struct Fixture {
        store: Arc<InMemoryVectorStore>,
        registry: Arc<InMemoryFailedOperationRepository>,
        engine: SimilarityEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryVectorStore::new());
            let engine = SimilarityEngine::new(
                store.clone(),
                Arc::new(InMemoryResultCache::new(Duration::from_secs(60))),
                0.35,
            );
            Self {
                store,
                registry: Arc::new(InMemoryFailedOperationRepository::new()),
                engine,
            }
        }

        fn service(
            &self,
            encoder: Arc<dyn VectorEncoder>,
            catalog: Arc<dyn CatalogSource>,
        ) -> CatalogSyncService {
            CatalogSyncService::new(
                self.store.clone(),
                encoder,
                self.registry.clone(),
                self.engine.clone(),
                catalog,
            )
        }
    }

    #[tokio::test]
    async fn test_create_then_update_bumps_version() {
        let fx = Fixture::new();
        let service = fx.service(encoder_ok(), empty_catalog());
        let id = Uuid::new_v4();

        let created = service
            .sync(id, OperationKind::Create, Some("trail shoes"))
            .await
            .unwrap();
        assert_eq!(created, SyncOutcome::Stored { version: 1 });

        let updated = service
            .sync(id, OperationKind::Update, Some("hiking boots"))
            .await
            .unwrap();
        assert_eq!(updated, SyncOutcome::Stored { version: 2 });

        let stored = fx.store.get(Space::Entity, id).await.unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_text_is_fetched_from_catalog() {
        let fx = Fixture::new();
        let id = Uuid::new_v4();
        let mut catalog = MockCatalogSource::new();
        catalog
            .expect_get()
            .withf(move |requested| *requested == id)
            .returning(|id| {
                Ok(Some(CatalogItem {
                    id,
                    text: "hiking boots".into(),
                }))
            });
        let service = fx.service(encoder_ok(), Arc::new(catalog));

        service.sync(id, OperationKind::Update, None).await.unwrap();
        let stored = fx.store.get(Space::Entity, id).await.unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_item_missing_from_catalog_is_deleted() {
        let fx = Fixture::new();
        let service = fx.service(encoder_ok(), empty_catalog());
        let id = Uuid::new_v4();
        service
            .sync(id, OperationKind::Create, Some("trail shoes"))
            .await
            .unwrap();

        let outcome = service.sync(id, OperationKind::Update, None).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Deleted { existed: true });
        assert!(fx.store.get(Space::Entity, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_entity_is_never_recommended() {
        let fx = Fixture::new();
        let service = fx.service(encoder_ok(), empty_catalog());
        let id = Uuid::new_v4();
        service
            .sync(id, OperationKind::Create, Some("trail shoes"))
            .await
            .unwrap();

        // Warm the cache with the entity in it
        let before = fx.engine.search(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(before[0].entity_id, id);

        service.sync(id, OperationKind::Delete, None).await.unwrap();
        let after = fx.engine.search(&[1.0, 0.0], 10).await.unwrap();
        assert!(after.iter().all(|s| s.entity_id != id));
    }

    /// Holds the first `scan` after it has read the store until released.
    struct PausingStore {
        inner: Arc<InMemoryVectorStore>,
        paused: AtomicBool,
        scanned: Notify,
        release: Notify,
    }

    #[async_trait]
    impl VectorStore for PausingStore {
        async fn get(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<Option<EmbeddingVector>> {
            self.inner.get(space, owner_id).await
        }

        async fn put(
            &self,
            space: Space,
            vector: EmbeddingVector,
            expected_version: Option<i64>,
        ) -> EmbeddingResult<PutResult> {
            self.inner.put(space, vector, expected_version).await
        }

        async fn batch_get(
            &self,
            space: Space,
            owner_ids: &[Uuid],
        ) -> EmbeddingResult<HashMap<Uuid, EmbeddingVector>> {
            self.inner.batch_get(space, owner_ids).await
        }

        async fn delete(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<bool> {
            self.inner.delete(space, owner_id).await
        }

        async fn scan(&self, space: Space) -> EmbeddingResult<Vec<EmbeddingVector>> {
            let records = self.inner.scan(space).await;
            if !self.paused.swap(true, Ordering::SeqCst) {
                self.scanned.notify_one();
                self.release.notified().await;
            }
            records
        }
    }

    #[tokio::test]
    async fn test_search_overlapping_delete_does_not_cache_deleted_entity() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let store = Arc::new(PausingStore {
            inner: inner.clone(),
            paused: AtomicBool::new(false),
            scanned: Notify::new(),
            release: Notify::new(),
        });
        let engine = SimilarityEngine::new(
            store.clone(),
            Arc::new(InMemoryResultCache::new(Duration::from_secs(60))),
            0.35,
        );
        let service = CatalogSyncService::new(
            store.clone(),
            encoder_ok(),
            Arc::new(InMemoryFailedOperationRepository::new()),
            engine.clone(),
            empty_catalog(),
        );
        let id = Uuid::new_v4();
        service
            .sync(id, OperationKind::Create, Some("trail shoes"))
            .await
            .unwrap();

        let in_flight = tokio::spawn({
            let engine = engine.clone();
            async move { engine.search(&[1.0, 0.0], 10).await }
        });

        // The search has read the entity; delete it before the search finishes
        store.scanned.notified().await;
        service.sync(id, OperationKind::Delete, None).await.unwrap();
        assert!(inner.get(Space::Entity, id).await.unwrap().is_none());
        store.release.notify_one();

        let overlapping = in_flight.await.unwrap().unwrap();
        assert_eq!(overlapping[0].entity_id, id);

        let after = engine.search(&[1.0, 0.0], 10).await.unwrap();
        assert!(after.iter().all(|s| s.entity_id != id));
    }

    #[tokio::test]
    async fn test_failed_change_is_deferred_to_registry() {
        let fx = Fixture::new();
        let service = fx.service(encoder_down(), empty_catalog());
        let change = CatalogChange::new(Uuid::new_v4(), OperationKind::Create, Some("shoes".into()));

        let outcome = service.apply(&change).await.unwrap();
        let SyncOutcome::Deferred { operation_id } = outcome else {
            panic!("expected deferral, got {:?}", outcome);
        };

        let recorded = fx.registry.get(operation_id).await.unwrap().unwrap();
        assert_eq!(recorded.target_id, change.entity_id);
        assert_eq!(recorded.operation, OperationKind::Create);
        assert_eq!(recorded.status, OperationStatus::Failed);
        assert_eq!(recorded.attempts, 1);
    }

    #[tokio::test]
    async fn test_resync_pages_through_catalog() {
        let fx = Fixture::new();
        let items: Vec<CatalogItem> = (0..5)
            .map(|i| CatalogItem {
                id: Uuid::new_v4(),
                text: format!("item {}", i),
            })
            .collect();
        let all = items.clone();
        let mut catalog = MockCatalogSource::new();
        catalog
            .expect_list_page()
            .returning(move |offset, limit| Ok(all.iter().skip(offset).take(limit).cloned().collect()));
        let service = fx.service(encoder_ok(), Arc::new(catalog));

        let seen = Mutex::new(Vec::new());
        let report = service
            .resync_all(2, 4, |r| seen.lock().unwrap().push(r.total))
            .await
            .unwrap();

        assert_eq!(
            report,
            ResyncReport {
                total: 5,
                synced: 5,
                failed: 0
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec![2, 4, 5]);
        for item in items {
            assert!(fx.store.get(Space::Entity, item.id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_resync_counts_deferred_items() {
        let fx = Fixture::new();
        let mut catalog = MockCatalogSource::new();
        catalog.expect_list_page().returning(|offset, _| {
            if offset == 0 {
                Ok(vec![CatalogItem {
                    id: Uuid::new_v4(),
                    text: "shoes".into(),
                }])
            } else {
                Ok(vec![])
            }
        });
        let service = fx.service(encoder_down(), Arc::new(catalog));

        let report = service.resync_all(10, 2, |_| {}).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(fx.registry.list(None, 10).await.unwrap().len(), 1);
    }

    #[test]
    fn test_http_config_from_env() {
        temp_env::with_vars(
            [
                ("CATALOG_BASE_URL", Some("http://catalog:8080/")),
                ("CATALOG_TIMEOUT_SECS", Some("3")),
            ],
            || {
                let config = HttpCatalogConfig::from_env().unwrap();
                assert_eq!(config.base_url, "http://catalog:8080");
                assert_eq!(config.timeout, Duration::from_secs(3));
            },
        );
    }

    #[tokio::test]
    async fn test_unreachable_catalog_is_a_catalog_error() {
        let source = HttpCatalogSource::new(HttpCatalogConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert!(matches!(
            source.get(Uuid::new_v4()).await,
            Err(EmbeddingError::Catalog(_))
        ));
    }
}
