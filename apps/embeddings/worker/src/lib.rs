//! Embeddings Worker
//!
//! ```text
//! embeddings:updates  ──> StreamWorker<InteractionEvent, EmbeddingUpdater> ──┐
//! embeddings:catalog  ──> StreamWorker<CatalogChange, CatalogChangeProcessor>├─> Postgres vectors
//! every RETRY_INTERVAL_SECS ──> RetryCoordinator ────────────────────────────┘
//!
//! HTTP: /interactions, /recommendations/{owner_id}, /entities/{entity_id}/vector,
//!       /health, /ready, /metrics, /admin/dlq/*
//! ```
//!
//! The update worker honours `WORKER_MAX_MESSAGES`, `WORKER_MAX_RUNTIME_SECS`
//! and `WORKER_MEMORY_LIMIT_MB`; when it stops, everything else drains and
//! the process exits so the orchestrator can start a fresh one.

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use core_config::{Environment, FromEnv, env_parse};
use database::{
    postgres::{PostgresConfig, connect_from_config_with_retry, run_migrations},
    redis::RedisConfig,
};
use domain_embeddings::{
    AppState, CatalogChange, CatalogChangeProcessor, CatalogFallback, CatalogStream,
    CatalogSyncService, EmbeddingUpdater, EventPublisher, GuardedEncoder, GuardedVectorStore,
    HttpCatalogConfig, HttpCatalogSource, IdempotencyGuard, InteractionEvent, InteractionStream,
    OpenAiConfig, OpenAiEncoder, PgFailedOperationRepository, PgVectorStore, PipelineConfig,
    RecommendationService, RedisDedupStore, RedisResultCache, RetryCoordinator, RetryPolicy,
    SimilarityEngine, StreamEventQueue, VectorStore, WorkerLimits,
};
use eyre::{Result, WrapErr};
use migration::Migrator;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use stream_worker::{
    CircuitBreaker, HealthState, ReadinessCheck, RedisBreakerStore, StreamWorker, WorkerConfig,
    full_admin_router, init_metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

struct PostgresReadiness {
    db: DatabaseConnection,
}

#[async_trait]
impl ReadinessCheck for PostgresReadiness {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn check(&self) -> std::result::Result<(), String> {
        database::postgres::check_health(&self.db)
            .await
            .map_err(|e| e.to_string())
    }
}

async fn serve(app: Router, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP server to {}", addr))?;

    info!(port = %port, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("HTTP server failed")?;

    Ok(())
}

/// Re-attempt due failed operations until shutdown.
async fn retry_loop(
    coordinator: RetryCoordinator,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = coordinator.run_once(Utc::now()).await {
                    warn!(error = %e, "Retry pass failed");
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
        }
    }
}

/// Run the embeddings worker.
///
/// # Errors
///
/// Returns an error if configuration is invalid, Postgres or Redis cannot
/// be reached, migrations fail, or a stream worker hits a fatal error.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting embeddings worker");
    info!("Environment: {:?}", environment);

    let config = PipelineConfig::from_env().wrap_err("Failed to load pipeline configuration")?;
    let limits = WorkerLimits::from_env().wrap_err("Failed to load worker limits")?;
    let openai = OpenAiConfig::from_env().wrap_err("Failed to load encoder configuration")?;
    let catalog_config =
        HttpCatalogConfig::from_env().wrap_err("Failed to load catalog configuration")?;
    let port: u16 = env_parse("HTTP_PORT", 8082)?;
    let retry_interval: u64 = env_parse("RETRY_INTERVAL_SECS", 60)?;

    let pg_config =
        PostgresConfig::from_env().wrap_err("Failed to load PostgreSQL configuration")?;
    info!("Connecting to PostgreSQL...");
    let db = connect_from_config_with_retry(pg_config, None)
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;
    run_migrations::<Migrator>(&db, APP_NAME)
        .await
        .wrap_err("Failed to run migrations")?;

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    info!("Connecting to Redis...");
    let redis = database::redis::connect_from_config_with_retry(redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let breaker = CircuitBreaker::new(
        "vector-store",
        config.breaker.clone(),
        Arc::new(RedisBreakerStore::new(redis.clone())),
    );
    let store: Arc<dyn VectorStore> = Arc::new(GuardedVectorStore::new(
        Arc::new(PgVectorStore::new(db.clone())),
        breaker,
        config.dimension,
    ));
    let encoder = Arc::new(GuardedEncoder::new(
        Arc::new(OpenAiEncoder::new(openai, config.dimension).wrap_err("Failed to build encoder")?),
        CircuitBreaker::new(
            "encoder",
            config.breaker.clone(),
            Arc::new(RedisBreakerStore::new(redis.clone())),
        ),
    ));
    let catalog = Arc::new(
        HttpCatalogSource::new(catalog_config).wrap_err("Failed to build catalog client")?,
    );
    let retry_policy = RetryPolicy::new(config.retry_max_attempts);
    let registry =
        Arc::new(PgFailedOperationRepository::new(db.clone()).with_policy(retry_policy));
    let engine = SimilarityEngine::new(
        store.clone(),
        Arc::new(RedisResultCache::new(redis.clone(), config.cache_ttl)),
        config.similarity_threshold,
    );

    let updater = EmbeddingUpdater::new(
        store.clone(),
        encoder.clone(),
        IdempotencyGuard::layered(
            config.idempotency_capacity,
            Arc::new(RedisDedupStore::new(redis.clone(), config.idempotency_ttl)),
        ),
        &config,
    );
    let sync = CatalogSyncService::new(
        store.clone(),
        encoder,
        registry.clone(),
        engine.clone(),
        catalog.clone(),
    );
    let coordinator = RetryCoordinator::new(
        registry,
        sync.clone(),
        retry_policy,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = signal_tx.send(true);
    });

    let health_state = HealthState::new(redis.clone(), APP_NAME, APP_VERSION)
        .with_stream::<InteractionStream>()
        .with_stream::<CatalogStream>()
        .with_check(Arc::new(PostgresReadiness { db }));
    let api = domain_embeddings::router(AppState {
        publisher: EventPublisher::new(Arc::new(StreamEventQueue::new(redis.clone()))),
        recommender: RecommendationService::new(
            store.clone(),
            engine,
            Arc::new(CatalogFallback::new(catalog)),
        ),
        store,
        default_limit: config.recommendation_limit,
    });
    let app = full_admin_router(health_state).merge(api).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );
    let server = tokio::spawn(serve(app, port, shutdown_rx.clone()));

    let retries = tokio::spawn(retry_loop(
        coordinator,
        Duration::from_secs(retry_interval.max(1)),
        shutdown_rx.clone(),
    ));

    let catalog_worker = StreamWorker::<CatalogChange, _>::new(
        redis.clone(),
        CatalogChangeProcessor::new(sync),
        WorkerConfig::from_stream_def::<CatalogStream>(),
    );
    let catalog_shutdown = shutdown_rx.clone();
    let catalog_task = tokio::spawn(async move { catalog_worker.run(catalog_shutdown).await });

    let update_config = WorkerConfig::from_stream_def::<InteractionStream>()
        .with_blocking(Some(1000))
        .with_max_concurrent_jobs(10)
        .with_limits(limits.to_stop_limits());
    info!(
        stream = %update_config.stream_name,
        consumer_group = %update_config.consumer_group,
        consumer_id = %update_config.consumer_id,
        limits = ?limits,
        "Starting interaction worker"
    );
    let update_worker = StreamWorker::<InteractionEvent, _>::new(redis, updater, update_config);
    let result = update_worker.run(shutdown_rx).await;

    // Whatever ended the update worker ends the process
    let _ = shutdown_tx.send(true);
    let reason = result.map_err(|e| eyre::eyre!("Interaction worker failed: {}", e))?;
    info!(reason = %reason, "Interaction worker stopped");

    match catalog_task.await {
        Ok(Ok(reason)) => info!(reason = %reason, "Catalog worker stopped"),
        Ok(Err(e)) => error!(error = %e, "Catalog worker failed"),
        Err(e) => error!(error = %e, "Catalog worker task panicked"),
    }
    if let Err(e) = retries.await {
        error!(error = %e, "Retry loop task panicked");
    }
    match server.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
        Ok(Ok(())) => {}
    }

    info!("Embeddings worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
