use core_config::FromEnv;
use database::postgres::{DatabaseConnection, PostgresConfig, connect_from_config_with_retry};
use database::redis::{ConnectionManager, RedisConfig};
use domain_embeddings::{
    CatalogSyncService, EventPublisher, GuardedEncoder, GuardedVectorStore, HttpCatalogConfig,
    HttpCatalogSource, OpenAiConfig, OpenAiEncoder, PgFailedOperationRepository, PgVectorStore,
    PipelineConfig, RedisResultCache, RetryCoordinator, RetryPolicy, SimilarityEngine,
    StreamEventQueue, VectorStore,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use stream_worker::{CircuitBreaker, RedisBreakerStore};
use tracing::info;

/// Connections shared by every command. Services that need the encoder or
/// the catalog are built on demand so unrelated commands do not require
/// their configuration.
pub struct OpsContext {
    pub config: PipelineConfig,
    db: DatabaseConnection,
    redis: ConnectionManager,
}

impl OpsContext {
    pub async fn connect() -> Result<Self> {
        let config =
            PipelineConfig::from_env().wrap_err("Failed to load pipeline configuration")?;

        info!("Connecting to database...");
        let pg_config =
            PostgresConfig::from_env().wrap_err("Failed to load PostgreSQL configuration")?;
        let db = connect_from_config_with_retry(pg_config, None)
            .await
            .wrap_err("Database connection failed")?;

        let redis_config =
            RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
        let redis = database::redis::connect_from_config_with_retry(redis_config, None)
            .await
            .wrap_err("Redis connection failed")?;

        Ok(Self { config, db, redis })
    }

    pub fn store(&self) -> Arc<dyn VectorStore> {
        Arc::new(GuardedVectorStore::new(
            Arc::new(PgVectorStore::new(self.db.clone())),
            CircuitBreaker::new(
                "vector-store",
                self.config.breaker.clone(),
                Arc::new(RedisBreakerStore::new(self.redis.clone())),
            ),
            self.config.dimension,
        ))
    }

    pub fn engine(&self) -> SimilarityEngine {
        SimilarityEngine::new(
            self.store(),
            Arc::new(RedisResultCache::new(
                self.redis.clone(),
                self.config.cache_ttl,
            )),
            self.config.similarity_threshold,
        )
    }

    pub fn registry(&self) -> Arc<PgFailedOperationRepository> {
        Arc::new(
            PgFailedOperationRepository::new(self.db.clone()).with_policy(self.retry_policy()),
        )
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry_max_attempts)
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(Arc::new(StreamEventQueue::new(self.redis.clone())))
    }

    pub fn sync_service(&self) -> Result<CatalogSyncService> {
        let openai = OpenAiConfig::from_env().wrap_err("Failed to load encoder configuration")?;
        let catalog =
            HttpCatalogConfig::from_env().wrap_err("Failed to load catalog configuration")?;

        Ok(CatalogSyncService::new(
            self.store(),
            Arc::new(GuardedEncoder::new(
                Arc::new(OpenAiEncoder::new(openai, self.config.dimension)?),
                CircuitBreaker::new(
                    "encoder",
                    self.config.breaker.clone(),
                    Arc::new(RedisBreakerStore::new(self.redis.clone())),
                ),
            )),
            self.registry(),
            self.engine(),
            Arc::new(HttpCatalogSource::new(catalog)?),
        ))
    }

    pub fn coordinator(&self) -> Result<RetryCoordinator> {
        Ok(RetryCoordinator::new(
            self.registry(),
            self.sync_service()?,
            self.retry_policy(),
        ))
    }
}
