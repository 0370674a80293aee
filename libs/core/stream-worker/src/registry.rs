//! Stream definitions, job payloads, and the processor contract.

use crate::error::StreamError;
use crate::event::StreamEvent;
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use strum::{AsRefStr, Display, EnumString};

/// Field names used in stream entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MessageKey {
    /// JSON-serialized job payload on a work stream.
    Job,
    /// JSON-serialized [`crate::DlqEntry`] on a dead-letter stream.
    Data,
}

/// Stream definition trait.
///
/// Each domain declares its streams through this trait so producers, workers,
/// and admin tooling agree on names and limits.
///
/// ```rust,ignore
/// pub struct InteractionStream;
///
/// impl StreamDef for InteractionStream {
///     const STREAM_NAME: &'static str = "embeddings:updates";
///     const CONSUMER_GROUP: &'static str = "embedding_workers";
///     const DLQ_STREAM: &'static str = "embeddings:updates:dlq";
/// }
/// ```
pub trait StreamDef: Send + Sync {
    const STREAM_NAME: &'static str;

    const CONSUMER_GROUP: &'static str;

    const DLQ_STREAM: &'static str;

    /// Approximate MAXLEN applied on every XADD.
    const MAX_LENGTH: i64 = 100_000;

    /// Entries read per XREADGROUP.
    const BATCH_SIZE: usize = 10;

    /// Sleep between polls when blocking reads are disabled.
    const POLL_INTERVAL_MS: u64 = 1000;

    /// Minimum idle time before an unacknowledged entry is redelivered.
    /// Doubles with every delivery, see [`crate::WorkerConfig::redelivery_backoff_ms`].
    const CLAIM_IDLE_MS: u64 = 5_000;

    /// Deliveries allowed before an entry is dead-lettered.
    const MAX_DELIVERIES: u32 = 5;

    fn stream_name() -> &'static str {
        Self::STREAM_NAME
    }

    fn consumer_group() -> &'static str {
        Self::CONSUMER_GROUP
    }

    fn dlq_stream() -> &'static str {
        Self::DLQ_STREAM
    }
}

/// Payload carried on a work stream.
pub trait StreamJob: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Identifier used in logs and dead-letter entries.
    fn job_id(&self) -> String;
}

/// Result of a successfully handled job. Both variants acknowledge the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// State was changed.
    Processed,
    /// Nothing to do (duplicate, stale, ...). The reason is used as a metric label.
    Skipped(&'static str),
}

/// Domain handler for one stream.
///
/// The worker maps the returned value onto the broker:
///
/// | return                      | broker action                                   |
/// |-----------------------------|-------------------------------------------------|
/// | `Ok(Processed / Skipped)`   | XACK                                            |
/// | `Err(transient)`            | left pending, redelivered after backoff         |
/// | `Err(permanent)`            | moved to the DLQ, then XACK                     |
#[async_trait]
pub trait StreamProcessor<J: StreamJob>: Send + Sync {
    async fn process(&self, event: &StreamEvent<J>) -> Result<JobOutcome, StreamError>;

    /// Processor name for logs and metric labels.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStream;
    impl StreamDef for TestStream {
        const STREAM_NAME: &'static str = "test:stream";
        const CONSUMER_GROUP: &'static str = "test_workers";
        const DLQ_STREAM: &'static str = "test:stream:dlq";
        const MAX_DELIVERIES: u32 = 3;
    }

    #[test]
    fn test_stream_def_defaults_and_overrides() {
        assert_eq!(TestStream::stream_name(), "test:stream");
        assert_eq!(TestStream::consumer_group(), "test_workers");
        assert_eq!(TestStream::dlq_stream(), "test:stream:dlq");
        assert_eq!(TestStream::MAX_LENGTH, 100_000);
        assert_eq!(TestStream::MAX_DELIVERIES, 3);
    }

    #[test]
    fn test_message_key_names() {
        assert_eq!(MessageKey::Job.as_ref(), "job");
        assert_eq!(MessageKey::Data.to_string(), "data");
        assert_eq!("job".parse::<MessageKey>().unwrap(), MessageKey::Job);
    }
}
