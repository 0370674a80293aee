//! Embeddings Domain
//!
//! User-interest vectors built from interaction events, entity vectors
//! kept in sync with the catalog, and similarity-ranked recommendations.
//!
//! # Architecture
//!
//! ```text
//!  POST /interactions            catalog changes
//!          │                           │
//! ┌────────▼────────┐         ┌────────▼─────────┐
//! │ EventPublisher  │         │ CatalogSyncService│──fail──> FailedOperation registry
//! └────────┬────────┘         └────────┬─────────┘                  │
//!   embeddings:updates                 │                  RetryCoordinator
//! ┌────────▼────────┐                  │
//! │EmbeddingUpdater │                  │
//! └────────┬────────┘                  │
//! ┌────────▼───────────────────────────▼─┐
//! │ GuardedVectorStore (circuit breaker) │
//! └────────┬─────────────────────────────┘
//! ┌────────▼────────┐
//! │SimilarityEngine │ ──> RecommendationService ──> GET /recommendations/{owner_id}
//! └─────────────────┘
//! ```
//!
//! Both the updater and the sync service reach the text encoder through
//! [`GuardedEncoder`], which has its own circuit breaker.
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_embeddings::{
//!     GuardedVectorStore, InMemoryResultCache, PgVectorStore, SimilarityEngine,
//! };
//! use sea_orm::Database;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stream_worker::{BreakerConfig, CircuitBreaker};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::connect("postgres://...").await?;
//! let store = Arc::new(GuardedVectorStore::new(
//!     Arc::new(PgVectorStore::new(db)),
//!     CircuitBreaker::in_memory("vector-store", BreakerConfig::default()),
//!     1536,
//! ));
//! let engine = SimilarityEngine::new(
//!     store,
//!     Arc::new(InMemoryResultCache::new(Duration::from_secs(300))),
//!     0.35,
//! );
//! let top = engine.search(&vec![0.0; 1536], 10).await?;
//! # Ok(())
//! # }
//! ```

pub mod blend;
pub mod catalog_processor;
pub mod config;
pub mod coordinator;
pub mod encoder;
pub mod entity;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod math;
pub mod models;
pub mod processor;
pub mod publisher;
pub mod recommend;
pub mod registry;
pub mod similarity;
pub mod store;
pub mod streams;
pub mod sync;

pub use blend::Blender;
pub use catalog_processor::CatalogChangeProcessor;
pub use config::{EventWeights, PipelineConfig, WorkerLimits};
pub use coordinator::{RetryCoordinator, RetryReport};
pub use encoder::{GuardedEncoder, OpenAiConfig, OpenAiEncoder, VectorEncoder};
pub use error::{EmbeddingError, EmbeddingResult};
pub use handlers::{AppState, router};
pub use idempotency::{DedupStore, IdempotencyGuard, InMemoryDedupStore, RedisDedupStore};
pub use models::{
    CatalogChange, EmbeddingVector, EventType, FailedOperation, InteractionEvent, NewInteraction,
    OperationKind, OperationStatus, PublishedEvent, PutResult, Recommendations, ScoredEntity,
    Space,
};
pub use processor::{EmbeddingUpdater, UpdateOutcome};
pub use publisher::{EventPublisher, EventQueue, StreamEventQueue};
pub use recommend::{CatalogFallback, FallbackSource, RecentEntitiesFallback, RecommendationService};
pub use registry::{
    FailedOperationRepository, InMemoryFailedOperationRepository, PgFailedOperationRepository,
    RetryPolicy,
};
pub use similarity::{InMemoryResultCache, RedisResultCache, ResultCache, SimilarityEngine};
pub use store::{GuardedVectorStore, InMemoryVectorStore, PgVectorStore, VectorStore};
pub use streams::{CatalogStream, InteractionStream};
pub use sync::{
    CatalogItem, CatalogSource, CatalogSyncService, HttpCatalogConfig, HttpCatalogSource,
    ResyncReport, SyncOutcome,
};
