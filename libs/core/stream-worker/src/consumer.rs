//! Consumer-group reads, redelivery claims, and acknowledgements.

use crate::config::WorkerConfig;
use crate::error::StreamError;
use crate::event::StreamEvent;
use crate::registry::{MessageKey, StreamJob};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

type StreamEntries = Vec<(String, Vec<(String, String)>)>;
type StreamReadReply = Vec<(String, StreamEntries)>;

/// One entry handed to the worker.
#[derive(Debug, Clone)]
pub enum Delivery<J: StreamJob> {
    Job(StreamEvent<J>),
    /// The entry could not be decoded into `J`.
    Malformed(MalformedEntry),
}

#[derive(Debug, Clone)]
pub struct MalformedEntry {
    pub stream_id: String,
    pub fields: Vec<(String, String)>,
    pub reason: String,
    pub delivery_count: u32,
}

pub struct StreamConsumer {
    redis: ConnectionManager,
    config: WorkerConfig,
}

impl StreamConsumer {
    pub fn new(redis: ConnectionManager, config: WorkerConfig) -> Self {
        Self { redis, config }
    }

    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_blocking(&self) -> bool {
        self.config.block_timeout_ms.is_some()
    }

    /// Create the consumer group (and stream) if missing.
    pub async fn init_consumer_group(&self) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream = %self.config.stream_name,
                    group = %self.config.consumer_group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    /// Read entries never delivered to any consumer of the group.
    pub async fn read_new<J: StreamJob>(&self, count: usize) -> Result<Vec<Delivery<J>>, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id);

        if let Some(timeout) = self.config.block_timeout_ms {
            cmd.arg("BLOCK").arg(timeout);
        }

        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">");

        let result: RedisResult<Option<StreamReadReply>> = cmd.query_async(&mut conn).await;

        match result {
            Ok(Some(streams)) => Ok(streams
                .into_iter()
                .flat_map(|(_, entries)| entries)
                .map(|(id, fields)| decode_entry(id, fields, 1))
                .collect()),
            Ok(None) => Ok(vec![]),
            // A BLOCK that outlives the client-side response timeout just means "nothing yet"
            Err(e) if e.is_timeout() => Ok(vec![]),
            Err(e) => Err(StreamError::Redis(e)),
        }
    }

    /// Claim pending entries whose idle time exceeds their redelivery backoff.
    ///
    /// Covers both entries this worker failed transiently and entries orphaned
    /// by consumers that died. The returned delivery count includes this claim.
    pub async fn claim_due<J: StreamJob>(&self, count: usize) -> Result<Vec<Delivery<J>>, StreamError> {
        let mut conn = self.redis.clone();

        let pending: RedisResult<Vec<(String, String, u64, u32)>> = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(self.config.redelivery_base_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await;

        let pending = match pending {
            Ok(p) => p,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(vec![]),
            Err(e) => return Err(StreamError::Redis(e)),
        };

        let due = select_due(&pending, |deliveries| self.config.redelivery_backoff_ms(deliveries));
        if due.is_empty() {
            return Ok(vec![]);
        }

        let min_idle = due.iter().map(|(_, backoff)| *backoff).min().unwrap_or(0);
        let previous: HashMap<&str, u32> = pending
            .iter()
            .map(|(id, _, _, deliveries)| (id.as_str(), *deliveries))
            .collect();

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_id)
            .arg(min_idle);
        for (id, _) in &due {
            cmd.arg(id);
        }

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;

        let deliveries: Vec<Delivery<J>> = entries
            .into_iter()
            .map(|(id, fields)| {
                let count = previous.get(id.as_str()).copied().unwrap_or(0) + 1;
                decode_entry(id, fields, count)
            })
            .collect();

        if !deliveries.is_empty() {
            warn!(
                stream = %self.config.stream_name,
                count = deliveries.len(),
                "Claimed pending entries for redelivery"
            );
        }

        Ok(deliveries)
    }

    pub async fn ack(&self, stream_id: &str) -> Result<(), StreamError> {
        let mut conn = self.redis.clone();

        let _: i64 = conn
            .xack(&self.config.stream_name, &self.config.consumer_group, &[stream_id])
            .await?;

        debug!(stream_id = %stream_id, "Acknowledged message");
        Ok(())
    }

    pub async fn stream_info(&self) -> Result<StreamInfo, StreamError> {
        read_stream_info(
            &mut self.redis.clone(),
            &self.config.stream_name,
            &self.config.consumer_group,
        )
        .await
    }
}

/// Length and pending count of a stream for one consumer group.
pub async fn read_stream_info(
    conn: &mut ConnectionManager,
    stream_name: &str,
    consumer_group: &str,
) -> Result<StreamInfo, StreamError> {
    let length: i64 = conn.xlen(stream_name).await?;

    let pending: RedisResult<(i64, Option<String>, Option<String>, Option<Vec<(String, String)>>)> =
        redis::cmd("XPENDING")
            .arg(stream_name)
            .arg(consumer_group)
            .query_async(conn)
            .await;

    Ok(StreamInfo {
        stream_name: stream_name.to_string(),
        consumer_group: consumer_group.to_string(),
        length,
        // NOGROUP before the first worker has started
        pending_count: pending.map(|(count, _, _, _)| count).unwrap_or(0),
    })
}

/// Pending entries `(id, consumer, idle_ms, deliveries)` that have waited out
/// their backoff, paired with that backoff.
fn select_due(
    pending: &[(String, String, u64, u32)],
    backoff: impl Fn(u32) -> u64,
) -> Vec<(String, u64)> {
    pending
        .iter()
        .filter_map(|(id, _, idle, deliveries)| {
            let wait = backoff(*deliveries);
            (*idle >= wait).then(|| (id.clone(), wait))
        })
        .collect()
}

fn decode_entry<J: StreamJob>(
    stream_id: String,
    fields: Vec<(String, String)>,
    delivery_count: u32,
) -> Delivery<J> {
    let payload = fields
        .iter()
        .find(|(k, _)| k == MessageKey::Job.as_ref())
        .map(|(_, v)| v.as_str());

    let reason = match payload {
        Some(json) => match serde_json::from_str::<J>(json) {
            Ok(job) => {
                return Delivery::Job(StreamEvent::with_delivery_count(
                    stream_id,
                    job,
                    delivery_count,
                ));
            }
            Err(e) => format!("invalid payload: {}", e),
        },
        None => "missing 'job' field".to_string(),
    };

    Delivery::Malformed(MalformedEntry {
        stream_id,
        fields,
        reason,
        delivery_count,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_name: String,
    pub consumer_group: String,
    pub length: i64,
    pub pending_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        id: u32,
    }

    impl StreamJob for Ping {
        fn job_id(&self) -> String {
            self.id.to_string()
        }
    }

    #[test]
    fn test_decode_valid_entry() {
        let delivery: Delivery<Ping> = decode_entry(
            "1-0".to_string(),
            vec![("job".to_string(), r#"{"id":7}"#.to_string())],
            2,
        );
        match delivery {
            Delivery::Job(event) => {
                assert_eq!(event.job, Ping { id: 7 });
                assert_eq!(event.delivery_count, 2);
            }
            Delivery::Malformed(m) => panic!("unexpected malformed entry: {}", m.reason),
        }
    }

    #[test]
    fn test_decode_malformed_entries() {
        let bad_json: Delivery<Ping> = decode_entry(
            "1-0".to_string(),
            vec![("job".to_string(), "{not json".to_string())],
            1,
        );
        assert!(matches!(bad_json, Delivery::Malformed(ref m) if m.reason.starts_with("invalid payload")));

        let no_field: Delivery<Ping> =
            decode_entry("2-0".to_string(), vec![("other".to_string(), "x".to_string())], 1);
        match no_field {
            Delivery::Malformed(m) => {
                assert_eq!(m.stream_id, "2-0");
                assert_eq!(m.reason, "missing 'job' field");
                assert_eq!(m.fields.len(), 1);
            }
            Delivery::Job(_) => panic!("expected malformed entry"),
        }
    }

    #[test]
    fn test_select_due_respects_per_entry_backoff() {
        let config = WorkerConfig::new("s", "g").with_redelivery_backoff(1_000, 60_000);
        let pending = vec![
            ("1-0".to_string(), "c1".to_string(), 1_500, 1), // needs 1s
            ("2-0".to_string(), "c1".to_string(), 1_500, 2), // needs 2s
            ("3-0".to_string(), "c2".to_string(), 9_000, 3), // needs 4s
        ];

        let due = select_due(&pending, |d| config.redelivery_backoff_ms(d));
        assert_eq!(
            due,
            vec![("1-0".to_string(), 1_000), ("3-0".to_string(), 4_000)]
        );
    }
}
