//! Message-identity checks for the update worker.
//!
//! Two layers: a bounded per-process set of recently processed ids, and an
//! optional shared store with a TTL so that a message redelivered to a
//! different worker is recognised too. The shared layer is advisory: if it
//! is unreachable the staleness check and the version CAS still prevent a
//! double update, so lookups fail open.

use crate::error::{EmbeddingError, EmbeddingResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// FIFO-bounded set of message ids.
pub struct RecentMessages {
    capacity: usize,
    inner: Mutex<RecentInner>,
}

#[derive(Default)]
struct RecentInner {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RecentInner::default()),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.ids.contains(id))
            .unwrap_or(false)
    }

    pub fn insert(&self, id: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.ids.insert(id.to_string()) {
            return;
        }
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.ids.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared record of processed message ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn is_processed(&self, message_id: &str) -> EmbeddingResult<bool>;

    async fn mark_processed(&self, message_id: &str, at: DateTime<Utc>) -> EmbeddingResult<()>;
}

/// `SET key <timestamp> NX EX ttl` per processed message.
#[derive(Clone)]
pub struct RedisDedupStore {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisDedupStore {
    const KEY_PREFIX: &'static str = "embeddings:processed:";

    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    fn key(message_id: &str) -> String {
        format!("{}{}", Self::KEY_PREFIX, message_id)
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn is_processed(&self, message_id: &str) -> EmbeddingResult<bool> {
        let mut conn = self.redis.clone();
        conn.exists(Self::key(message_id))
            .await
            .map_err(|e| EmbeddingError::Cache(e.to_string()))
    }

    async fn mark_processed(&self, message_id: &str, at: DateTime<Utc>) -> EmbeddingResult<()> {
        let mut conn = self.redis.clone();
        let _: Option<String> = redis::cmd("SET")
            .arg(Self::key(message_id))
            .arg(at.to_rfc3339())
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| EmbeddingError::Cache(e.to_string()))?;
        Ok(())
    }
}

/// Process-local [`DedupStore`] with passive expiry.
pub struct InMemoryDedupStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn is_processed(&self, message_id: &str) -> EmbeddingResult<bool> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EmbeddingError::Internal("dedup lock poisoned".to_string()))?;
        match entries.get(message_id) {
            Some(marked) if marked.elapsed() < self.ttl => Ok(true),
            Some(_) => {
                entries.remove(message_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn mark_processed(&self, message_id: &str, _at: DateTime<Utc>) -> EmbeddingResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EmbeddingError::Internal("dedup lock poisoned".to_string()))?;
        entries.entry(message_id.to_string()).or_insert_with(Instant::now);
        Ok(())
    }
}

pub struct IdempotencyGuard {
    local: RecentMessages,
    shared: Option<Arc<dyn DedupStore>>,
}

impl IdempotencyGuard {
    pub fn local_only(capacity: usize) -> Self {
        Self {
            local: RecentMessages::new(capacity),
            shared: None,
        }
    }

    pub fn layered(capacity: usize, shared: Arc<dyn DedupStore>) -> Self {
        Self {
            local: RecentMessages::new(capacity),
            shared: Some(shared),
        }
    }

    /// Whether `message_id` was already processed by this or any worker.
    pub async fn is_duplicate(&self, message_id: &str) -> bool {
        if self.local.contains(message_id) {
            return true;
        }

        let Some(shared) = &self.shared else {
            return false;
        };

        match shared.is_processed(message_id).await {
            Ok(true) => {
                self.local.insert(message_id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(message_id, error = %e, "Dedup store unavailable, relying on version checks");
                false
            }
        }
    }

    pub async fn mark_processed(&self, message_id: &str) {
        self.local.insert(message_id);

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.mark_processed(message_id, Utc::now()).await {
                warn!(message_id, error = %e, "Failed to record processed message");
            }
        }
    }
}
