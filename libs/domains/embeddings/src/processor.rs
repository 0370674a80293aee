//! Embedding update worker logic.
//!
//! Per message:
//!
//! ```text
//! received ─> duplicate? ─yes─> skip
//!                │no
//!                v
//!         stored >= occurred? ─yes─> skip (stale)
//!                │no
//!                v
//!         resolve event vector ─> blend ─> CAS put ─conflict─> redeliver
//!                                             │stored
//!                                             v
//!                                      mark processed, ack
//! ```

use crate::blend::Blender;
use crate::config::PipelineConfig;
use crate::encoder::VectorEncoder;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::idempotency::IdempotencyGuard;
use crate::math::random_unit_vector;
use crate::models::{EmbeddingVector, EventType, InteractionEvent, PutResult, Space};
use crate::store::VectorStore;
use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use stream_worker::{JobOutcome, StreamError, StreamEvent, StreamProcessor};
use tracing::{debug, info, warn};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { version: i64 },
    Duplicate,
    /// The stored vector already reflects a newer event
    Stale,
}

impl UpdateOutcome {
    fn label(&self) -> &'static str {
        match self {
            UpdateOutcome::Updated { .. } => "updated",
            UpdateOutcome::Duplicate => "duplicate",
            UpdateOutcome::Stale => "stale",
        }
    }
}

pub struct EmbeddingUpdater {
    store: Arc<dyn VectorStore>,
    encoder: Arc<dyn VectorEncoder>,
    idempotency: IdempotencyGuard,
    blender: Blender,
    dimension: usize,
}

impl EmbeddingUpdater {
    pub fn new(
        store: Arc<dyn VectorStore>,
        encoder: Arc<dyn VectorEncoder>,
        idempotency: IdempotencyGuard,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            encoder,
            idempotency,
            blender: Blender::new(config.weights, config.decay_half_life),
            dimension: config.dimension,
        }
    }

    pub async fn handle(&self, event: &InteractionEvent) -> EmbeddingResult<UpdateOutcome> {
        event.validate()?;

        if self.idempotency.is_duplicate(&event.message_id).await {
            debug!(message_id = %event.message_id, "Skipping duplicate message");
            return Ok(UpdateOutcome::Duplicate);
        }

        let current = self.store.get(Space::User, event.entity_id).await?;

        if let Some(stored) = &current {
            if stored.last_updated_at >= event.occurred_at {
                debug!(
                    message_id = %event.message_id,
                    owner_id = %event.entity_id,
                    "Skipping stale event"
                );
                self.idempotency.mark_processed(&event.message_id).await;
                return Ok(UpdateOutcome::Stale);
            }
        }

        let event_vector = self.resolve_event_vector(event).await?;
        let blended = self.blender.blend(
            current.as_ref(),
            &event_vector,
            event.event_type,
            event.occurred_at,
        );

        let expected = current.as_ref().map(|c| c.version);
        let next = EmbeddingVector::next(
            event.entity_id,
            current.as_ref(),
            blended,
            event.occurred_at,
        );

        match self.store.put(Space::User, next, expected).await? {
            PutResult::Stored(stored) => {
                self.idempotency.mark_processed(&event.message_id).await;
                info!(
                    owner_id = %stored.owner_id,
                    version = stored.version,
                    event_type = %event.event_type,
                    "Updated interest vector"
                );
                Ok(UpdateOutcome::Updated {
                    version: stored.version,
                })
            }
            PutResult::Conflict { current_version } => {
                warn!(
                    owner_id = %event.entity_id,
                    expected = ?expected,
                    current = ?current_version,
                    "Version conflict, message will be redelivered"
                );
                Err(EmbeddingError::VersionConflict {
                    owner_id: event.entity_id,
                    expected,
                })
            }
        }
    }

    /// The event's contribution. Missing entity vectors and encoder failures
    /// degrade to a random direction; store failures propagate.
    async fn resolve_event_vector(&self, event: &InteractionEvent) -> EmbeddingResult<Vec<f32>> {
        match event.event_type {
            EventType::Search => {
                let phrase = event.search_phrase.as_deref().unwrap_or_default();
                match self.encoder.encode(phrase).await {
                    Ok(vector) if vector.len() == self.dimension => Ok(vector),
                    Ok(vector) => {
                        warn!(
                            encoder = self.encoder.name(),
                            expected = self.dimension,
                            actual = vector.len(),
                            "Encoder returned wrong dimension, using fallback vector"
                        );
                        Ok(self.fallback())
                    }
                    Err(e) => {
                        warn!(
                            encoder = self.encoder.name(),
                            error = %e,
                            "Encoder failed, using fallback vector"
                        );
                        Ok(self.fallback())
                    }
                }
            }
            EventType::View | EventType::Click | EventType::Purchase => {
                let Some(entity_id) = event.referenced_entity_id else {
                    return Err(EmbeddingError::Validation(
                        "missing referenced_entity_id".to_string(),
                    ));
                };
                match self.store.get(Space::Entity, entity_id).await? {
                    Some(entity) if entity.dimension() == self.dimension => Ok(entity.vector),
                    _ => {
                        warn!(entity_id = %entity_id, "Entity vector missing, using fallback vector");
                        Ok(self.fallback())
                    }
                }
            }
        }
    }

    fn fallback(&self) -> Vec<f32> {
        counter!("embedding_fallback_vectors_total").increment(1);
        random_unit_vector(self.dimension)
    }
}

#[async_trait]
impl StreamProcessor<InteractionEvent> for EmbeddingUpdater {
    async fn process(
        &self,
        event: &StreamEvent<InteractionEvent>,
    ) -> Result<JobOutcome, StreamError> {
        match self.handle(&event.job).await {
            Ok(outcome) => {
                counter!("embedding_updates_total", "outcome" => outcome.label()).increment(1);
                Ok(match outcome {
                    UpdateOutcome::Updated { .. } => JobOutcome::Processed,
                    other => JobOutcome::Skipped(other.label()),
                })
            }
            Err(e) => {
                let outcome = if e.is_retryable() { "retry" } else { "rejected" };
                counter!("embedding_updates_total", "outcome" => outcome).increment(1);
                Err(e.into())
            }
        }
    }

    fn name(&self) -> &'static str {
        "embedding_updater"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::MockVectorEncoder;
    use crate::math::{cosine_similarity, magnitude};
    use crate::store::{GuardedVectorStore, InMemoryVectorStore, MockVectorStore};
    use chrono::{DateTime, Duration, Utc};
    use std::collections::HashMap;
    use stream_worker::{BreakerConfig, CircuitBreaker};
    use uuid::Uuid;

    const DIM: usize = 4;

    fn config() -> PipelineConfig {
        PipelineConfig::default().with_dimension(DIM)
    }

    fn axis(n: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[n] = 1.0;
        v
    }

    fn guarded(inner: Arc<dyn VectorStore>) -> Arc<dyn VectorStore> {
        Arc::new(GuardedVectorStore::new(
            inner,
            CircuitBreaker::in_memory("vector-store", BreakerConfig::default()),
            DIM,
        ))
    }

    fn offline_encoder() -> Arc<dyn VectorEncoder> {
        let mut encoder = MockVectorEncoder::new();
        encoder
            .expect_encode()
            .returning(|_| Err(EmbeddingError::Encoder("offline".into())));
        encoder.expect_name().return_const("mock");
        Arc::new(encoder)
    }

    fn updater(store: Arc<dyn VectorStore>) -> EmbeddingUpdater {
        EmbeddingUpdater::new(
            store,
            offline_encoder(),
            IdempotencyGuard::local_only(100),
            &config(),
        )
    }

    fn event(
        user: Uuid,
        event_type: EventType,
        entity: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> InteractionEvent {
        InteractionEvent {
            message_id: Uuid::new_v4().simple().to_string(),
            entity_id: user,
            event_type,
            search_phrase: entity.is_none().then(|| "trail running shoes".to_string()),
            referenced_entity_id: entity,
            occurred_at: at,
            metadata: HashMap::new(),
        }
    }

    async fn seed_entity(store: &InMemoryVectorStore, id: Uuid, vector: Vec<f32>) {
        store
            .put(Space::Entity, EmbeddingVector::first(id, vector, Utc::now()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_event_creates_unit_vector_at_version_one() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let entity = Uuid::new_v4();
        seed_entity(&inner, entity, axis(2)).await;
        let updater = updater(guarded(inner.clone()));

        let user = Uuid::new_v4();
        let outcome = updater
            .handle(&event(user, EventType::View, Some(entity), Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { version: 1 });

        let stored = inner.get(Space::User, user).await.unwrap().unwrap();
        assert!((magnitude(&stored.vector) - 1.0).abs() < 1e-5);
        assert!((cosine_similarity(&stored.vector, &axis(2)) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_each_new_event_increments_version_by_one() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let entity = Uuid::new_v4();
        seed_entity(&inner, entity, axis(1)).await;
        let updater = updater(guarded(inner.clone()));

        let user = Uuid::new_v4();
        let start = Utc::now() - Duration::hours(3);
        for (i, event_type) in [EventType::View, EventType::Click, EventType::Purchase]
            .into_iter()
            .enumerate()
        {
            let at = start + Duration::hours(i as i64);
            let outcome = updater
                .handle(&event(user, event_type, Some(entity), at))
                .await
                .unwrap();
            assert_eq!(
                outcome,
                UpdateOutcome::Updated {
                    version: i as i64 + 1
                }
            );
        }

        let stored = inner.get(Space::User, user).await.unwrap().unwrap();
        assert_eq!(stored.version, 3);
        assert!((magnitude(&stored.vector) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_skipped() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let entity = Uuid::new_v4();
        seed_entity(&inner, entity, axis(0)).await;
        let updater = updater(guarded(inner.clone()));

        let e = event(Uuid::new_v4(), EventType::Purchase, Some(entity), Utc::now());
        updater.handle(&e).await.unwrap();
        assert_eq!(updater.handle(&e).await.unwrap(), UpdateOutcome::Duplicate);
        assert_eq!(
            inner.get(Space::User, e.entity_id).await.unwrap().unwrap().version,
            1
        );
    }

    #[tokio::test]
    async fn test_redelivery_to_second_worker_increments_once() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let entity = Uuid::new_v4();
        seed_entity(&inner, entity, axis(3)).await;
        let store = guarded(inner.clone());

        // Separate processes: no shared idempotency state
        let worker_a = updater(store.clone());
        let worker_b = updater(store);

        let e = event(Uuid::new_v4(), EventType::Click, Some(entity), Utc::now());
        assert!(matches!(
            worker_a.handle(&e).await.unwrap(),
            UpdateOutcome::Updated { .. }
        ));
        assert_eq!(worker_b.handle(&e).await.unwrap(), UpdateOutcome::Stale);

        let stored = inner.get(Space::User, e.entity_id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflict_is_transient() {
        let user = Uuid::new_v4();
        let entity = Uuid::new_v4();
        let prior = EmbeddingVector::first(user, axis(0), Utc::now() - Duration::hours(1));

        let mut inner = MockVectorStore::new();
        let prior_clone = prior.clone();
        inner
            .expect_get()
            .withf(|space, _| *space == Space::User)
            .returning(move |_, _| Ok(Some(prior_clone.clone())));
        inner
            .expect_get()
            .withf(|space, _| *space == Space::Entity)
            .returning(|_, id| Ok(Some(EmbeddingVector::first(id, axis(1), Utc::now()))));
        inner.expect_put().times(1).returning(|_, _, _| {
            Ok(PutResult::Conflict {
                current_version: Some(2),
            })
        });

        let updater = updater(guarded(Arc::new(inner)));
        let job = event(user, EventType::View, Some(entity), Utc::now());

        let err = updater.handle(&job).await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::VersionConflict {
                expected: Some(1),
                ..
            }
        ));

        let stream_err: StreamError = err.into();
        assert!(stream_err.is_transient());
    }

    #[tokio::test]
    async fn test_conflicted_message_is_not_marked_processed() {
        let user = Uuid::new_v4();
        let mut inner = MockVectorStore::new();
        inner.expect_get().returning(|_, _| Ok(None));
        inner
            .expect_put()
            .times(1)
            .returning(|_, _, _| Ok(PutResult::Conflict { current_version: Some(1) }));
        inner
            .expect_put()
            .times(1)
            .returning(|_, v, _| Ok(PutResult::Stored(v)));

        let updater = updater(guarded(Arc::new(inner)));
        let job = event(user, EventType::View, Some(Uuid::new_v4()), Utc::now());

        assert!(updater.handle(&job).await.is_err());
        // The redelivered copy is processed, not treated as a duplicate
        assert_eq!(
            updater.handle(&job).await.unwrap(),
            UpdateOutcome::Updated { version: 1 }
        );
    }

    #[tokio::test]
    async fn test_out_of_order_event_is_stale() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let entity = Uuid::new_v4();
        seed_entity(&inner, entity, axis(0)).await;
        let updater = updater(guarded(inner.clone()));

        let user = Uuid::new_v4();
        let now = Utc::now();
        updater
            .handle(&event(user, EventType::View, Some(entity), now))
            .await
            .unwrap();

        let late = event(user, EventType::Purchase, Some(entity), now - Duration::minutes(5));
        assert_eq!(updater.handle(&late).await.unwrap(), UpdateOutcome::Stale);

        // Same timestamp counts as stale too
        let same = event(user, EventType::Click, Some(entity), now);
        assert_eq!(updater.handle(&same).await.unwrap(), UpdateOutcome::Stale);
    }

    #[tokio::test]
    async fn test_missing_entity_vector_uses_fallback() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let updater = updater(guarded(inner.clone()));

        let user = Uuid::new_v4();
        let outcome = updater
            .handle(&event(user, EventType::Click, Some(Uuid::new_v4()), Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { version: 1 });

        let stored = inner.get(Space::User, user).await.unwrap().unwrap();
        assert_eq!(stored.vector.len(), DIM);
        assert!((magnitude(&stored.vector) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_search_uses_encoder_and_falls_back_on_failure() {
        let inner = Arc::new(InMemoryVectorStore::new());

        let mut encoder = MockVectorEncoder::new();
        encoder
            .expect_encode()
            .with(mockall::predicate::eq("trail running shoes"))
            .returning(|_| Ok(axis(1)));
        encoder.expect_name().return_const("mock");
        let with_encoder = EmbeddingUpdater::new(
            guarded(inner.clone()),
            Arc::new(encoder),
            IdempotencyGuard::local_only(10),
            &config(),
        );

        let user = Uuid::new_v4();
        with_encoder
            .handle(&event(user, EventType::Search, None, Utc::now()))
            .await
            .unwrap();
        let stored = inner.get(Space::User, user).await.unwrap().unwrap();
        assert!((cosine_similarity(&stored.vector, &axis(1)) - 1.0).abs() < 1e-5);

        let offline = updater(guarded(inner.clone()));
        let other = Uuid::new_v4();
        let outcome = offline
            .handle(&event(other, EventType::Search, None, Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated { version: 1 });
    }

    #[tokio::test]
    async fn test_malformed_event_is_permanent() {
        let updater = updater(guarded(Arc::new(InMemoryVectorStore::new())));
        let mut bad = event(Uuid::new_v4(), EventType::View, None, Utc::now());
        bad.search_phrase = None;

        let err = updater.handle(&bad).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Validation(_)));
        let stream_err: StreamError = err.into();
        assert!(!stream_err.is_transient());
    }

    #[tokio::test]
    async fn test_open_circuit_is_transient() {
        let mut inner = MockVectorStore::new();
        inner
            .expect_get()
            .times(1)
            .returning(|_, _| Err(EmbeddingError::Database("down".into())));

        let store: Arc<dyn VectorStore> = Arc::new(GuardedVectorStore::new(
            Arc::new(inner),
            CircuitBreaker::in_memory(
                "vector-store",
                BreakerConfig::default().with_failure_threshold(1),
            ),
            DIM,
        ));
        let updater = updater(store);
        let job = event(Uuid::new_v4(), EventType::View, Some(Uuid::new_v4()), Utc::now());

        assert!(matches!(
            updater.handle(&job).await,
            Err(EmbeddingError::Database(_))
        ));
        let err = updater.handle(&job).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::ServiceUnavailable(_)));
        assert!(StreamError::from(err).is_transient());
    }

    #[tokio::test]
    async fn test_stream_processor_outcomes() {
        let inner = Arc::new(InMemoryVectorStore::new());
        let entity = Uuid::new_v4();
        seed_entity(&inner, entity, axis(0)).await;
        let updater = updater(guarded(inner));

        let job = event(Uuid::new_v4(), EventType::View, Some(entity), Utc::now());
        let stream_event = StreamEvent::new("1-0".to_string(), job);

        assert_eq!(
            updater.process(&stream_event).await.unwrap(),
            JobOutcome::Processed
        );
        assert_eq!(
            updater.process(&stream_event).await.unwrap(),
            JobOutcome::Skipped("duplicate")
        );
    }
}
