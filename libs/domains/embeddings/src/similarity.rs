//! Nearest-neighbour search over entity vectors.

use crate::error::{EmbeddingError, EmbeddingResult};
use crate::math::{cosine_similarity, fingerprint};
use crate::models::{EmbeddingVector, ScoredEntity, Space};
use crate::store::VectorStore;
use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Score every candidate against `query`, keep those at or above
/// `threshold`, and return the best `limit` in descending order. Equal
/// scores keep the candidates' order.
pub fn rank(
    query: &[f32],
    candidates: &[EmbeddingVector],
    threshold: f32,
    limit: usize,
) -> Vec<ScoredEntity> {
    let mut scored: Vec<ScoredEntity> = candidates
        .iter()
        .map(|c| ScoredEntity {
            entity_id: c.owner_id,
            score: cosine_similarity(query, &c.vector),
        })
        .filter(|s| s.score >= threshold)
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(limit);
    scored
}

/// Result of a personalized query.
#[derive(Debug, Clone, PartialEq)]
pub enum Personalized {
    Results(Vec<ScoredEntity>),
    /// Nothing scored above the threshold
    NoPersonalizedResults,
}

/// Time-bounded cache of ranked results keyed by query fingerprint.
///
/// Entries belong to a generation. `clear` starts a new one, so a result
/// computed before a clear can never be read after it, even when its `put`
/// lands late.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn generation(&self) -> EmbeddingResult<u64>;

    async fn get(
        &self,
        generation: u64,
        fingerprint: &str,
    ) -> EmbeddingResult<Option<Vec<ScoredEntity>>>;

    /// Store `results` under `generation`. Writes for a past generation are
    /// never visible to readers of the current one.
    async fn put(
        &self,
        generation: u64,
        fingerprint: &str,
        results: &[ScoredEntity],
    ) -> EmbeddingResult<()>;

    /// Drop every cached result and start a new generation. Returns the
    /// number of entries removed.
    async fn clear(&self) -> EmbeddingResult<u64>;
}

#[derive(Default)]
struct CacheState {
    generation: u64,
    entries: HashMap<String, (Instant, Vec<ScoredEntity>)>,
}

/// Entries expire passively: a read past the TTL removes the entry and misses.
pub struct InMemoryResultCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl InMemoryResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn poisoned() -> EmbeddingError {
        EmbeddingError::Cache("result cache lock poisoned".to_string())
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn generation(&self) -> EmbeddingResult<u64> {
        let state = self.state.lock().map_err(|_| Self::poisoned())?;
        Ok(state.generation)
    }

    async fn get(
        &self,
        generation: u64,
        fingerprint: &str,
    ) -> EmbeddingResult<Option<Vec<ScoredEntity>>> {
        let mut state = self.state.lock().map_err(|_| Self::poisoned())?;
        if state.generation != generation {
            return Ok(None);
        }
        match state.entries.get(fingerprint) {
            Some((stored_at, results)) if stored_at.elapsed() < self.ttl => Ok(Some(results.clone())),
            Some(_) => {
                state.entries.remove(fingerprint);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        generation: u64,
        fingerprint: &str,
        results: &[ScoredEntity],
    ) -> EmbeddingResult<()> {
        let mut state = self.state.lock().map_err(|_| Self::poisoned())?;
        if state.generation != generation {
            debug!(generation, current = state.generation, "Dropping result from a cleared generation");
            return Ok(());
        }
        state
            .entries
            .insert(fingerprint.to_string(), (Instant::now(), results.to_vec()));
        Ok(())
    }

    async fn clear(&self) -> EmbeddingResult<u64> {
        let mut state = self.state.lock().map_err(|_| Self::poisoned())?;
        let removed = state.entries.len() as u64;
        state.entries.clear();
        state.generation += 1;
        Ok(removed)
    }
}

/// Results stored as JSON under `embeddings:similarity:{generation}:{fingerprint}`
/// with `EX ttl`. The generation counter lives at `embeddings:similarity-generation`
/// and is bumped with `INCR` on clear, which orphans late writes from older
/// generations until their TTL runs out.
#[derive(Clone)]
pub struct RedisResultCache {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisResultCache {
    const KEY_PREFIX: &'static str = "embeddings:similarity:";
    const GENERATION_KEY: &'static str = "embeddings:similarity-generation";

    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    fn key(generation: u64, fingerprint: &str) -> String {
        format!("{}{}:{}", Self::KEY_PREFIX, generation, fingerprint)
    }
}

fn cache_error(e: redis::RedisError) -> EmbeddingError {
    EmbeddingError::Cache(e.to_string())
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn generation(&self) -> EmbeddingResult<u64> {
        let mut conn = self.redis.clone();
        let generation: Option<u64> = redis::cmd("GET")
            .arg(Self::GENERATION_KEY)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(generation.unwrap_or(0))
    }

    async fn get(
        &self,
        generation: u64,
        fingerprint: &str,
    ) -> EmbeddingResult<Option<Vec<ScoredEntity>>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(generation, fingerprint))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| EmbeddingError::Cache(format!("corrupt cache entry: {}", e)))
    }

    async fn put(
        &self,
        generation: u64,
        fingerprint: &str,
        results: &[ScoredEntity],
    ) -> EmbeddingResult<()> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(results)?;
        let _: () = redis::cmd("SET")
            .arg(Self::key(generation, fingerprint))
            .arg(json)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn clear(&self) -> EmbeddingResult<u64> {
        let mut conn = self.redis.clone();
        let _: u64 = redis::cmd("INCR")
            .arg(Self::GENERATION_KEY)
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        let pattern = format!("{}*", Self::KEY_PREFIX);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(cache_error)?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(cache_error)?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

#[derive(Clone)]
pub struct SimilarityEngine {
    store: Arc<dyn VectorStore>,
    cache: Arc<dyn ResultCache>,
    threshold: f32,
}

impl SimilarityEngine {
    pub fn new(store: Arc<dyn VectorStore>, cache: Arc<dyn ResultCache>, threshold: f32) -> Self {
        Self {
            store,
            cache,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Ranked entities for `query`. A failing cache is bypassed; a failing
    /// store (including an open circuit) is an error.
    ///
    /// The cache generation is read before the store scan, so results from a
    /// scan that overlapped a `clear_cache` are never cached for later reads.
    pub async fn search(&self, query: &[f32], limit: usize) -> EmbeddingResult<Vec<ScoredEntity>> {
        let key = fingerprint(query, limit, self.threshold);

        let generation = match self.cache.generation().await {
            Ok(generation) => Some(generation),
            Err(e) => {
                counter!("similarity_cache_total", "result" => "error").increment(1);
                warn!(error = %e, "Similarity cache unavailable");
                None
            }
        };

        if let Some(generation) = generation {
            match self.cache.get(generation, &key).await {
                Ok(Some(results)) => {
                    counter!("similarity_cache_total", "result" => "hit").increment(1);
                    return Ok(results);
                }
                Ok(None) => {
                    counter!("similarity_cache_total", "result" => "miss").increment(1);
                }
                Err(e) => {
                    counter!("similarity_cache_total", "result" => "error").increment(1);
                    warn!(error = %e, "Similarity cache unavailable");
                }
            }
        }

        let candidates = self.store.scan(Space::Entity).await?;
        let results = rank(query, &candidates, self.threshold, limit);
        debug!(
            candidates = candidates.len(),
            results = results.len(),
            "Computed similarity ranking"
        );

        if let Some(generation) = generation {
            if let Err(e) = self.cache.put(generation, &key, &results).await {
                warn!(error = %e, "Failed to cache similarity results");
            }
        }
        Ok(results)
    }

    pub async fn search_personalized(
        &self,
        query: &[f32],
        limit: usize,
    ) -> EmbeddingResult<Personalized> {
        let results = self.search(query, limit).await?;
        if results.is_empty() {
            return Ok(Personalized::NoPersonalizedResults);
        }
        Ok(Personalized::Results(results))
    }

    pub async fn clear_cache(&self) -> EmbeddingResult<u64> {
        let removed = self.cache.clear().await?;
        info!(removed, "Cleared similarity cache");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryVectorStore, MockVectorStore};
    use chrono::Utc;
    use uuid::Uuid;

    fn candidate(id: Uuid, vector: Vec<f32>) -> EmbeddingVector {
        EmbeddingVector::first(id, vector, Utc::now())
    }

    /// A unit vector with cosine `score` against `[1, 0]`.
    fn at_score(score: f32) -> Vec<f32> {
        vec![score, (1.0 - score * score).sqrt()]
    }

    #[test]
    fn test_threshold_and_order() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let candidates = vec![
            candidate(c, at_score(0.1)),
            candidate(a, at_score(0.9)),
            candidate(b, at_score(0.4)),
        ];

        let ranked = rank(&[1.0, 0.0], &candidates, 0.35, 10);
        let ids: Vec<Uuid> = ranked.iter().map(|s| s.entity_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!((ranked[0].score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_ties_keep_insertion_order_and_limit_truncates() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let candidates: Vec<EmbeddingVector> = ids
            .iter()
            .map(|id| candidate(*id, vec![1.0, 0.0]))
            .collect();

        let ranked = rank(&[1.0, 0.0], &candidates, 0.0, 3);
        let ranked_ids: Vec<Uuid> = ranked.iter().map(|s| s.entity_id).collect();
        assert_eq!(ranked_ids, ids[..3].to_vec());
    }

    #[test]
    fn test_zero_vectors_score_zero() {
        let id = Uuid::new_v4();
        let ranked = rank(&[0.0, 0.0], &[candidate(id, vec![1.0, 0.0])], 0.0, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 0.0);
    }

    #[tokio::test]
    async fn test_cache_passive_expiry() {
        let cache = InMemoryResultCache::new(Duration::from_millis(20));
        let results = vec![ScoredEntity {
            entity_id: Uuid::new_v4(),
            score: 0.8,
        }];
        cache.put(0, "fp", &results).await.unwrap();
        assert_eq!(cache.get(0, "fp").await.unwrap(), Some(results));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(0, "fp").await.unwrap(), None);
        assert_eq!(cache.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_late_write_from_cleared_generation_is_dropped() {
        let cache = InMemoryResultCache::new(Duration::from_secs(60));
        let results = vec![ScoredEntity {
            entity_id: Uuid::new_v4(),
            score: 0.8,
        }];

        let before = cache.generation().await.unwrap();
        cache.put(before, "fp", &results).await.unwrap();
        assert_eq!(cache.clear().await.unwrap(), 1);

        // A search that started before the clear finishes afterwards
        cache.put(before, "fp", &results).await.unwrap();

        let current = cache.generation().await.unwrap();
        assert_eq!(current, before + 1);
        assert_eq!(cache.get(current, "fp").await.unwrap(), None);
        assert_eq!(cache.get(before, "fp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_search_is_served_from_cache() {
        let mut store = MockVectorStore::new();
        let id = Uuid::new_v4();
        store
            .expect_scan()
            .times(1)
            .returning(move |_| Ok(vec![candidate(id, vec![1.0, 0.0])]));

        let engine = SimilarityEngine::new(
            Arc::new(store),
            Arc::new(InMemoryResultCache::new(Duration::from_secs(60))),
            0.35,
        );

        let first = engine.search(&[1.0, 0.0], 5).await.unwrap();
        let second = engine.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].entity_id, id);
    }

    #[tokio::test]
    async fn test_failing_cache_is_bypassed() {
        let mut cache = MockResultCache::new();
        cache.expect_generation().returning(|| Ok(0));
        cache
            .expect_get()
            .returning(|_, _| Err(EmbeddingError::Cache("timeout".into())));
        cache
            .expect_put()
            .returning(|_, _, _| Err(EmbeddingError::Cache("timeout".into())));

        let store = Arc::new(InMemoryVectorStore::new());
        let id = Uuid::new_v4();
        store
            .put(Space::Entity, candidate(id, vec![0.0, 1.0]), None)
            .await
            .unwrap();

        let engine = SimilarityEngine::new(store, Arc::new(cache), 0.35);
        let results = engine.search(&[0.0, 1.0], 5).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_generation_skips_the_cache() {
        let mut cache = MockResultCache::new();
        cache
            .expect_generation()
            .returning(|| Err(EmbeddingError::Cache("connection reset".into())));
        cache.expect_get().never();
        cache.expect_put().never();

        let store = Arc::new(InMemoryVectorStore::new());
        let id = Uuid::new_v4();
        store
            .put(Space::Entity, candidate(id, vec![1.0, 0.0]), None)
            .await
            .unwrap();

        let engine = SimilarityEngine::new(store, Arc::new(cache), 0.35);
        let results = engine.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(results[0].entity_id, id);
    }

    #[tokio::test]
    async fn test_personalized_search_applies_threshold_and_order() {
        let store = Arc::new(InMemoryVectorStore::new());
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for (id, score) in [(c, 0.1), (a, 0.9), (b, 0.4)] {
            store
                .put(Space::Entity, candidate(id, at_score(score)), None)
                .await
                .unwrap();
        }

        let engine = SimilarityEngine::new(
            store,
            Arc::new(InMemoryResultCache::new(Duration::from_secs(60))),
            0.35,
        );
        let Personalized::Results(results) = engine.search_personalized(&[1.0, 0.0], 10).await.unwrap()
        else {
            panic!("expected personalized results");
        };
        let ids: Vec<Uuid> = results.iter().map(|s| s.entity_id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn test_no_personalized_results_signal() {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .put(Space::Entity, candidate(Uuid::new_v4(), vec![0.0, 1.0]), None)
            .await
            .unwrap();

        let engine = SimilarityEngine::new(
            store,
            Arc::new(InMemoryResultCache::new(Duration::from_secs(60))),
            0.35,
        );
        assert_eq!(
            engine.search_personalized(&[1.0, 0.0], 5).await.unwrap(),
            Personalized::NoPersonalizedResults
        );
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_redis_cache_round_trip_and_clear() {
        let redis = test_utils::TestRedis::new().await;
        let cache = RedisResultCache::new(redis.connection(), Duration::from_secs(60));
        let results = vec![ScoredEntity {
            entity_id: Uuid::new_v4(),
            score: 0.5,
        }];

        let generation = cache.generation().await.unwrap();
        cache.put(generation, "a", &results).await.unwrap();
        cache.put(generation, "b", &results).await.unwrap();
        assert_eq!(cache.get(generation, "a").await.unwrap(), Some(results.clone()));

        assert_eq!(cache.clear().await.unwrap(), 2);
        let current = cache.generation().await.unwrap();
        assert_eq!(current, generation + 1);

        // Late write from the old generation stays invisible
        cache.put(generation, "a", &results).await.unwrap();
        assert_eq!(cache.get(current, "a").await.unwrap(), None);
    }
}
