//! A delivered stream entry: the job plus its stream metadata.

use crate::registry::StreamJob;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct StreamEvent<J: StreamJob> {
    /// Redis stream entry ID (e.g. "1234567890123-0")
    pub stream_id: String,

    pub job: J,

    /// Enqueue time, parsed from the entry ID
    pub timestamp: DateTime<Utc>,

    /// 1 for a first delivery, incremented on every redelivery
    pub delivery_count: u32,
}

impl<J: StreamJob> StreamEvent<J> {
    pub fn new(stream_id: String, job: J) -> Self {
        Self::with_delivery_count(stream_id, job, 1)
    }

    pub fn with_delivery_count(stream_id: String, job: J, delivery_count: u32) -> Self {
        let timestamp = parse_stream_timestamp(&stream_id);
        Self {
            stream_id,
            job,
            timestamp,
            delivery_count,
        }
    }

    pub fn job_id(&self) -> String {
        self.job.job_id()
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }
}

/// Stream IDs are "timestamp_ms-sequence".
pub(crate) fn parse_stream_timestamp(stream_id: &str) -> DateTime<Utc> {
    stream_id
        .split('-')
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize, Debug)]
    struct TestJob {
        id: String,
    }

    impl StreamJob for TestJob {
        fn job_id(&self) -> String {
            self.id.clone()
        }
    }

    #[test]
    fn test_parse_timestamp_from_id() {
        let event = StreamEvent::new("1700000000000-3".to_string(), TestJob { id: "a".into() });
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert!(!event.is_redelivery());
        assert_eq!(event.job_id(), "a");
    }

    #[test]
    fn test_redelivery() {
        let event =
            StreamEvent::with_delivery_count("1234567890123-0".to_string(), TestJob { id: "b".into() }, 3);
        assert!(event.is_redelivery());
        assert_eq!(event.delivery_count, 3);
    }

    #[test]
    fn test_unparseable_id_falls_back_to_now() {
        let ts = parse_stream_timestamp("garbage");
        assert!((Utc::now() - ts).num_seconds() < 5);
    }
}
