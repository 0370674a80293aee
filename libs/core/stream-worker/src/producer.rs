//! Enqueue jobs onto a work stream.
//!
//! ```rust,ignore
//! let producer = StreamProducer::from_stream_def::<InteractionStream>(redis);
//! let stream_id = producer.send(&job).await?;
//! ```

use crate::error::StreamError;
use crate::registry::{MessageKey, StreamDef};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::debug;

#[derive(Clone)]
pub struct StreamProducer {
    redis: ConnectionManager,
    stream_name: String,
    max_length: i64,
}

impl StreamProducer {
    pub fn new(redis: ConnectionManager, stream_name: impl Into<String>) -> Self {
        Self {
            redis,
            stream_name: stream_name.into(),
            max_length: 100_000,
        }
    }

    /// Producer whose stream name and MAXLEN match the worker's definition.
    pub fn from_stream_def<S: StreamDef>(redis: ConnectionManager) -> Self {
        Self {
            redis,
            stream_name: S::STREAM_NAME.to_string(),
            max_length: S::MAX_LENGTH,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Enqueue a job. Returns the stream entry ID.
    pub async fn send<J: Serialize>(&self, job: &J) -> Result<String, StreamError> {
        self.send_raw(&serde_json::to_string(job)?).await
    }

    /// Enqueue an already-serialized payload (used when requeueing dead letters).
    pub async fn send_raw(&self, job_json: &str) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let stream_id: String = redis::cmd("XADD")
            .arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(MessageKey::Job.as_ref())
            .arg(job_json)
            .query_async(&mut conn)
            .await?;

        debug!(stream = %self.stream_name, stream_id = %stream_id, "Enqueued job");
        Ok(stream_id)
    }

    /// Enqueue several jobs in one pipeline.
    pub async fn send_batch<J: Serialize>(&self, jobs: &[J]) -> Result<Vec<String>, StreamError> {
        if jobs.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();

        for job in jobs {
            pipe.cmd("XADD")
                .arg(&self.stream_name)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.max_length)
                .arg("*")
                .arg(MessageKey::Job.as_ref())
                .arg(serde_json::to_string(job)?);
        }

        let ids: Vec<String> = pipe.query_async(&mut conn).await?;

        debug!(stream = %self.stream_name, count = ids.len(), "Enqueued batch of jobs");
        Ok(ids)
    }

    pub async fn stream_length(&self) -> Result<i64, StreamError> {
        let mut conn = self.redis.clone();
        Ok(conn.xlen(&self.stream_name).await?)
    }
}
