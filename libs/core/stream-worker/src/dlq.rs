//! Dead-letter queue for entries that failed permanently or ran out of deliveries.

use crate::error::StreamError;
use crate::producer::StreamProducer;
use crate::registry::MessageKey;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

type StreamEntries = Vec<(String, Vec<(String, String)>)>;

#[derive(Clone)]
pub struct DlqManager {
    redis: ConnectionManager,
    source_stream: String,
    dlq_stream: String,
    max_length: i64,
}

impl DlqManager {
    pub fn new(
        redis: ConnectionManager,
        source_stream: impl Into<String>,
        dlq_stream: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            source_stream: source_stream.into(),
            dlq_stream: dlq_stream.into(),
            max_length: 10_000,
        }
    }

    pub fn dlq_stream(&self) -> &str {
        &self.dlq_stream
    }

    pub fn source_stream(&self) -> &str {
        &self.source_stream
    }

    /// Append an entry to the DLQ. Returns the DLQ entry ID.
    pub async fn move_to_dlq(&self, entry: &DlqEntry) -> Result<String, StreamError> {
        let data = serde_json::to_string(entry)?;
        let mut conn = self.redis.clone();

        let dlq_id: String = redis::cmd("XADD")
            .arg(&self.dlq_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(MessageKey::Data.as_ref())
            .arg(&data)
            .query_async(&mut conn)
            .await?;

        info!(
            dlq_id = %dlq_id,
            job_id = ?entry.job_id,
            original_stream_id = %entry.original_stream_id,
            deliveries = entry.delivery_count,
            error = %entry.error,
            "Moved entry to DLQ"
        );

        Ok(dlq_id)
    }

    pub async fn stats(&self) -> Result<DlqStats, StreamError> {
        let mut conn = self.redis.clone();

        let length: i64 = conn.xlen(&self.dlq_stream).await?;

        let oldest: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let newest: StreamEntries = redis::cmd("XREVRANGE")
            .arg(&self.dlq_stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(DlqStats {
            stream_name: self.dlq_stream.clone(),
            length,
            oldest_entry_id: oldest.first().map(|(id, _)| id.clone()),
            newest_entry_id: newest.first().map(|(id, _)| id.clone()),
        })
    }

    /// Oldest-first page of DLQ entries.
    pub async fn list_messages(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DlqMessage>, StreamError> {
        let mut conn = self.redis.clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(offset + limit)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .skip(offset)
            .filter_map(|(id, fields)| decode_message(id, &fields))
            .collect())
    }

    pub async fn get(&self, dlq_id: &str) -> Result<Option<DlqMessage>, StreamError> {
        let mut conn = self.redis.clone();

        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(&self.dlq_stream)
            .arg(dlq_id)
            .arg(dlq_id)
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .next()
            .and_then(|(id, fields)| decode_message(id, &fields)))
    }

    /// Put one entry back on the source stream and remove it from the DLQ.
    ///
    /// Returns `false` when the entry does not exist.
    pub async fn reprocess_message(&self, dlq_id: &str) -> Result<bool, StreamError> {
        let Some(message) = self.get(dlq_id).await? else {
            return Ok(false);
        };

        let producer = StreamProducer::new(self.redis.clone(), &self.source_stream);
        let new_id = producer.send_raw(&message.entry.payload).await?;
        self.archive_message(dlq_id).await?;

        info!(dlq_id = %dlq_id, new_stream_id = %new_id, "Requeued DLQ entry");
        Ok(true)
    }

    /// Requeue up to `count` of the oldest entries.
    pub async fn reprocess_batch(&self, count: usize) -> Result<ReprocessResult, StreamError> {
        let messages = self.list_messages(count, 0).await?;
        let mut result = ReprocessResult::default();

        for message in messages {
            match self.reprocess_message(&message.dlq_id).await {
                Ok(true) => result.requeued.push(message.dlq_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(dlq_id = %message.dlq_id, error = %e, "Failed to requeue DLQ entry");
                    result.failed.push(message.dlq_id);
                }
            }
        }

        Ok(result)
    }

    /// Delete one entry without reprocessing it.
    pub async fn archive_message(&self, dlq_id: &str) -> Result<bool, StreamError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = conn.xdel(&self.dlq_stream, &[dlq_id]).await?;
        Ok(deleted > 0)
    }

    /// Delete every entry. Returns how many were removed.
    pub async fn archive_all(&self) -> Result<i64, StreamError> {
        let mut conn = self.redis.clone();
        let length: i64 = conn.xlen(&self.dlq_stream).await?;

        if length > 0 {
            let _: i64 = redis::cmd("XTRIM")
                .arg(&self.dlq_stream)
                .arg("MAXLEN")
                .arg(0)
                .query_async(&mut conn)
                .await?;
            info!(dlq = %self.dlq_stream, count = length, "Purged DLQ");
        }

        Ok(length)
    }
}

fn decode_message(dlq_id: String, fields: &[(String, String)]) -> Option<DlqMessage> {
    let data = fields
        .iter()
        .find(|(k, _)| k == MessageKey::Data.as_ref())
        .map(|(_, v)| v)?;
    let entry = serde_json::from_str::<DlqEntry>(data).ok()?;
    Some(DlqMessage { dlq_id, entry })
}

/// What is stored for each dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// `None` when the payload could not be decoded
    pub job_id: Option<String>,

    /// Original `job` field, verbatim, so it can be requeued unchanged
    pub payload: String,

    pub error: String,

    pub original_stream_id: String,

    pub delivery_count: u32,

    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqMessage {
    pub dlq_id: String,
    #[serde(flatten)]
    pub entry: DlqEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub stream_name: String,
    pub length: i64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprocessResult {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> DlqEntry {
        DlqEntry {
            job_id: Some("msg-1".to_string()),
            payload: r#"{"message_id":"msg-1"}"#.to_string(),
            error: "unknown event type".to_string(),
            original_stream_id: "1700000000000-0".to_string(),
            delivery_count: 1,
            failed_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_message() {
        let data = serde_json::to_string(&entry()).unwrap();
        let message = decode_message("5-0".to_string(), &[("data".to_string(), data)]).unwrap();
        assert_eq!(message.dlq_id, "5-0");
        assert_eq!(message.entry.job_id.as_deref(), Some("msg-1"));
    }

    #[test]
    fn test_decode_message_ignores_foreign_entries() {
        assert!(decode_message("5-0".to_string(), &[("job".to_string(), "{}".to_string())]).is_none());
        assert!(decode_message("6-0".to_string(), &[("data".to_string(), "nope".to_string())]).is_none());
    }

    #[test]
    fn test_dlq_message_serializes_flat() {
        let message = DlqMessage {
            dlq_id: "7-0".to_string(),
            entry: entry(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["dlq_id"], "7-0");
        assert_eq!(json["error"], "unknown event type");
    }
}
