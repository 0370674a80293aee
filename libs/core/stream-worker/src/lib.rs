//! Redis Streams worker framework.
//!
//! - `StreamWorker<J, P>` runs any [`StreamProcessor`] against a consumer group
//! - transient failures stay pending and are claimed again with exponential backoff
//! - permanent failures and exhausted entries go to a dead-letter stream
//! - runs end on shutdown or on a message, runtime, or memory limit
//! - a [`CircuitBreaker`] whose state can be shared through Redis
//! - health, readiness, Prometheus and DLQ admin endpoints
//!
//! ```ignore
//! struct Updates;
//! impl StreamDef for Updates {
//!     const STREAM_NAME: &'static str = "embeddings:updates";
//!     const CONSUMER_GROUP: &'static str = "embedding_workers";
//!     const DLQ_STREAM: &'static str = "embeddings:updates:dlq";
//! }
//!
//! let config = WorkerConfig::from_stream_def::<Updates>()
//!     .with_limits(StopLimits::unlimited().with_max_messages(10_000));
//! let worker = StreamWorker::new(redis, processor, config);
//! let reason = worker.run(shutdown_rx).await?;
//! ```

mod config;
mod consumer;
mod dlq;
mod error;
mod event;
mod health;
mod limits;
pub mod metrics;
mod producer;
mod registry;
pub mod resilience;
mod worker;

pub use config::WorkerConfig;
pub use consumer::{Delivery, MalformedEntry, StreamConsumer, StreamInfo, read_stream_info};
pub use dlq::{DlqEntry, DlqManager, DlqMessage, DlqStats, ReprocessResult};
pub use error::{ErrorCategory, StreamError};
pub use event::StreamEvent;
pub use health::{
    HealthResponse, HealthState, MonitoredStream, ReadinessCheck, full_admin_router,
    health_router,
};
pub use limits::{LimitTracker, StopLimits, StopReason, resident_memory_bytes};
pub use metrics::{StreamMetrics, init_metrics};
pub use producer::StreamProducer;
pub use registry::{JobOutcome, MessageKey, StreamDef, StreamJob, StreamProcessor};
pub use resilience::{
    BreakerConfig, BreakerError, BreakerSnapshot, BreakerStateStore, CircuitBreaker,
    CircuitState, InMemoryBreakerStore, RedisBreakerStore,
};
pub use worker::StreamWorker;
