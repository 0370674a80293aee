//! Pipeline tuning, loaded from the environment.

use crate::models::EventType;
use core_config::{ConfigError, FromEnv, env_parse, env_parse_opt};
use std::time::Duration;
use stream_worker::{BreakerConfig, StopLimits};

/// Contribution of each event type to the blended interest vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventWeights {
    pub purchase: f32,
    pub click: f32,
    pub view: f32,
    pub search: f32,
}

impl Default for EventWeights {
    fn default() -> Self {
        Self {
            purchase: 1.0,
            click: 0.5,
            view: 0.25,
            search: 0.15,
        }
    }
}

impl EventWeights {
    pub fn weight(&self, event_type: EventType) -> f32 {
        match event_type {
            EventType::Purchase => self.purchase,
            EventType::Click => self.click,
            EventType::View => self.view,
            EventType::Search => self.search,
        }
    }

    /// Weights must be positive and rank PURCHASE > CLICK > VIEW > SEARCH.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.purchase > self.click && self.click > self.view && self.view > self.search;
        if self.search <= 0.0 || !ordered {
            return Err(ConfigError::Invalid(format!(
                "event weights must satisfy purchase > click > view > search > 0, got {:?}",
                self
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Length of every stored vector
    pub dimension: usize,
    pub weights: EventWeights,
    /// Time for a prior vector's influence to halve
    pub decay_half_life: Duration,
    /// Per-process recently-processed message ids
    pub idempotency_capacity: usize,
    /// Lifetime of a processed-marker in the shared dedup store
    pub idempotency_ttl: Duration,
    pub cache_ttl: Duration,
    pub similarity_threshold: f32,
    pub recommendation_limit: usize,
    pub breaker: BreakerConfig,
    /// Attempts after which a failed operation is abandoned
    pub retry_max_attempts: i32,
    /// Parallel encoder calls during a full resync
    pub resync_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            weights: EventWeights::default(),
            decay_half_life: Duration::from_secs(72 * 3600),
            idempotency_capacity: 10_000,
            idempotency_ttl: Duration::from_secs(24 * 3600),
            cache_ttl: Duration::from_secs(300),
            similarity_threshold: 0.35,
            recommendation_limit: 10,
            breaker: BreakerConfig::default(),
            retry_max_attempts: 5,
            resync_concurrency: 8,
        }
    }
}

impl PipelineConfig {
    /// Config for tests and tools working with small vectors.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

impl FromEnv for PipelineConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let weights = EventWeights {
            purchase: env_parse("WEIGHT_PURCHASE", defaults.weights.purchase)?,
            click: env_parse("WEIGHT_CLICK", defaults.weights.click)?,
            view: env_parse("WEIGHT_VIEW", defaults.weights.view)?,
            search: env_parse("WEIGHT_SEARCH", defaults.weights.search)?,
        };
        weights.validate()?;

        let dimension: usize = env_parse("EMBEDDING_DIMENSION", defaults.dimension)?;
        if dimension == 0 {
            return Err(ConfigError::Invalid(
                "EMBEDDING_DIMENSION must be positive".to_string(),
            ));
        }

        let half_life_hours: f64 = env_parse("DECAY_HALF_LIFE_HOURS", 72.0)?;
        if !half_life_hours.is_finite() || half_life_hours <= 0.0 {
            return Err(ConfigError::Invalid(
                "DECAY_HALF_LIFE_HOURS must be a positive number".to_string(),
            ));
        }
        let decay_half_life = Duration::try_from_secs_f64(half_life_hours * 3600.0)
            .map_err(|e| ConfigError::Invalid(format!("DECAY_HALF_LIFE_HOURS: {}", e)))?;

        let breaker = BreakerConfig::default()
            .with_failure_threshold(env_parse("BREAKER_FAILURE_THRESHOLD", 5)?)
            .with_cooldown(Duration::from_secs(env_parse("BREAKER_COOLDOWN_SECS", 60)?))
            .with_window(Duration::from_secs(env_parse("BREAKER_WINDOW_SECS", 60)?));

        Ok(Self {
            dimension,
            weights,
            decay_half_life,
            idempotency_capacity: env_parse("IDEMPOTENCY_CAPACITY", defaults.idempotency_capacity)?,
            idempotency_ttl: Duration::from_secs(env_parse("IDEMPOTENCY_TTL_SECS", 86_400)?),
            cache_ttl: Duration::from_secs(env_parse("SIMILARITY_CACHE_TTL_SECS", 300)?),
            similarity_threshold: env_parse("SIMILARITY_THRESHOLD", defaults.similarity_threshold)?,
            recommendation_limit: env_parse("RECOMMENDATION_LIMIT", defaults.recommendation_limit)?,
            breaker,
            retry_max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            resync_concurrency: env_parse("RESYNC_CONCURRENCY", defaults.resync_concurrency)?,
        })
    }
}

/// Stop conditions for a worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerLimits {
    pub max_messages: Option<u64>,
    pub max_runtime: Option<Duration>,
    pub memory_limit_mb: Option<u64>,
}

impl WorkerLimits {
    pub fn to_stop_limits(&self) -> StopLimits {
        let mut limits = StopLimits::unlimited();
        if let Some(max) = self.max_messages {
            limits = limits.with_max_messages(max);
        }
        if let Some(runtime) = self.max_runtime {
            limits = limits.with_max_runtime(runtime);
        }
        if let Some(mb) = self.memory_limit_mb {
            limits = limits.with_memory_limit_mb(mb);
        }
        limits
    }
}

impl FromEnv for WorkerLimits {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_messages: env_parse_opt("WORKER_MAX_MESSAGES")?,
            max_runtime: env_parse_opt::<u64>("WORKER_MAX_RUNTIME_SECS")?.map(Duration::from_secs),
            memory_limit_mb: env_parse_opt("WORKER_MEMORY_LIMIT_MB")?,
        })
    }
}
