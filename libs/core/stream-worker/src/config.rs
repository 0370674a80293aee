//! Worker configuration

use crate::limits::StopLimits;
use crate::registry::StreamDef;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream_name: String,

    pub consumer_group: String,

    /// Unique per process, so a restarted worker never inherits a dead consumer's name
    pub consumer_id: String,

    pub dlq_stream: String,

    pub max_length: i64,

    /// Sleep between polls when `block_timeout_ms` is `None`
    pub poll_interval_ms: u64,

    pub batch_size: usize,

    /// XREADGROUP BLOCK, kept below the Redis connection's response timeout
    pub block_timeout_ms: Option<u64>,

    pub max_concurrent_jobs: usize,

    /// Backoff before the first redelivery; doubles per delivery
    pub redelivery_base_ms: u64,

    pub redelivery_max_ms: u64,

    /// How often pending entries are scanned for redelivery
    pub claim_interval_ms: u64,

    /// Deliveries allowed before an entry is dead-lettered
    pub max_deliveries: u32,

    pub limits: StopLimits,
}

impl WorkerConfig {
    pub fn from_stream_def<S: StreamDef>() -> Self {
        Self {
            stream_name: S::STREAM_NAME.to_string(),
            consumer_group: S::CONSUMER_GROUP.to_string(),
            dlq_stream: S::DLQ_STREAM.to_string(),
            max_length: S::MAX_LENGTH,
            poll_interval_ms: S::POLL_INTERVAL_MS,
            batch_size: S::BATCH_SIZE,
            redelivery_base_ms: S::CLAIM_IDLE_MS,
            max_deliveries: S::MAX_DELIVERIES,
            ..Self::new(S::STREAM_NAME, S::CONSUMER_GROUP)
        }
    }

    pub fn new(stream_name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        let stream_name = stream_name.into();
        Self {
            dlq_stream: format!("{}:dlq", stream_name),
            stream_name,
            consumer_group: consumer_group.into(),
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            max_length: 100_000,
            poll_interval_ms: 1000,
            batch_size: 10,
            block_timeout_ms: Some(400),
            max_concurrent_jobs: 1,
            redelivery_base_ms: 5_000,
            redelivery_max_ms: 300_000,
            claim_interval_ms: 1_000,
            max_deliveries: 5,
            limits: StopLimits::unlimited(),
        }
    }

    /// Minimum idle time before an entry delivered `deliveries` times is redelivered.
    pub fn redelivery_backoff_ms(&self, deliveries: u32) -> u64 {
        let exp = deliveries.saturating_sub(1).min(20);
        self.redelivery_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.redelivery_max_ms)
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_blocking(mut self, timeout_ms: Option<u64>) -> Self {
        self.block_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, count: usize) -> Self {
        self.max_concurrent_jobs = count.max(1);
        self
    }

    pub fn with_redelivery_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.redelivery_base_ms = base_ms;
        self.redelivery_max_ms = max_ms.max(base_ms);
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn with_claim_interval_ms(mut self, interval: u64) -> Self {
        self.claim_interval_ms = interval;
        self
    }

    pub fn with_limits(mut self, limits: StopLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("stream:jobs", "workers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStream;

    impl StreamDef for TestStream {
        const STREAM_NAME: &'static str = "test:stream";
        const CONSUMER_GROUP: &'static str = "test_group";
        const DLQ_STREAM: &'static str = "test:dlq";
        const CLAIM_IDLE_MS: u64 = 1_000;
        const MAX_DELIVERIES: u32 = 4;
    }

    #[test]
    fn test_from_stream_def() {
        let config = WorkerConfig::from_stream_def::<TestStream>();

        assert_eq!(config.stream_name, "test:stream");
        assert_eq!(config.consumer_group, "test_group");
        assert_eq!(config.dlq_stream, "test:dlq");
        assert_eq!(config.redelivery_base_ms, 1_000);
        assert_eq!(config.max_deliveries, 4);
        assert!(config.consumer_id.starts_with("worker-"));
    }

    #[test]
    fn test_consumer_ids_are_unique() {
        let a = WorkerConfig::from_stream_def::<TestStream>();
        let b = WorkerConfig::from_stream_def::<TestStream>();
        assert_ne!(a.consumer_id, b.consumer_id);
    }

    #[test]
    fn test_redelivery_backoff_doubles_and_caps() {
        let config = WorkerConfig::new("s", "g").with_redelivery_backoff(1_000, 10_000);
        assert_eq!(config.redelivery_backoff_ms(1), 1_000);
        assert_eq!(config.redelivery_backoff_ms(2), 2_000);
        assert_eq!(config.redelivery_backoff_ms(3), 4_000);
        assert_eq!(config.redelivery_backoff_ms(5), 10_000);
        assert_eq!(config.redelivery_backoff_ms(u32::MAX), 10_000);
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("my:stream", "my_group")
            .with_consumer_id("worker-1")
            .with_batch_size(0)
            .with_max_concurrent_jobs(4)
            .with_blocking(None)
            .with_limits(StopLimits::unlimited().with_max_messages(10));

        assert_eq!(config.dlq_stream, "my:stream:dlq");
        assert_eq!(config.consumer_id, "worker-1");
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.block_timeout_ms, None);
        assert_eq!(config.limits.max_messages, Some(10));
    }
}
