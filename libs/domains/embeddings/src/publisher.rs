//! Interaction ingestion.

use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{EventType, InteractionEvent, NewInteraction, PublishedEvent};
use crate::streams::InteractionStream;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use stream_worker::StreamProducer;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Durable broker the publisher writes to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Returns the broker's id for the enqueued entry.
    async fn enqueue(&self, event: &InteractionEvent) -> EmbeddingResult<String>;

    async fn enqueue_batch(&self, events: &[InteractionEvent]) -> EmbeddingResult<Vec<String>>;
}

/// [`EventQueue`] on the `embeddings:updates` stream.
#[derive(Clone)]
pub struct StreamEventQueue {
    producer: StreamProducer,
}

impl StreamEventQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            producer: StreamProducer::from_stream_def::<InteractionStream>(redis),
        }
    }
}

#[async_trait]
impl EventQueue for StreamEventQueue {
    async fn enqueue(&self, event: &InteractionEvent) -> EmbeddingResult<String> {
        Ok(self.producer.send(event).await?)
    }

    async fn enqueue_batch(&self, events: &[InteractionEvent]) -> EmbeddingResult<Vec<String>> {
        Ok(self.producer.send_batch(events).await?)
    }
}

/// `sha256(entity_id | event_type | occurred_at | nonce)` as lowercase hex.
pub fn compute_message_id(
    entity_id: Uuid,
    event_type: EventType,
    occurred_at: DateTime<Utc>,
    nonce: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_ref().as_bytes());
    hasher.update(b"|");
    hasher.update(
        occurred_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(b"|");
    hasher.update(nonce.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct EventPublisher {
    queue: Arc<dyn EventQueue>,
}

impl EventPublisher {
    pub fn new(queue: Arc<dyn EventQueue>) -> Self {
        Self { queue }
    }

    /// Assign an identity to a validated interaction.
    pub fn prepare(&self, input: NewInteraction) -> EmbeddingResult<InteractionEvent> {
        input.validate()?;
        let occurred_at = input.occurred_at.unwrap_or_else(Utc::now);
        let message_id = compute_message_id(
            input.entity_id,
            input.event_type,
            occurred_at,
            rand::random::<u64>(),
        );

        Ok(InteractionEvent {
            message_id,
            entity_id: input.entity_id,
            event_type: input.event_type,
            search_phrase: input.search_phrase,
            referenced_entity_id: input.referenced_entity_id,
            occurred_at,
            metadata: input.metadata,
        })
    }

    /// Validate, identify, and enqueue one interaction. Broker errors propagate.
    pub async fn publish(&self, input: NewInteraction) -> EmbeddingResult<PublishedEvent> {
        let event = self.prepare(input)?;
        let stream_id = self.queue.enqueue(&event).await?;

        info!(
            message_id = %event.message_id,
            entity_id = %event.entity_id,
            event_type = %event.event_type,
            "Published interaction"
        );

        Ok(PublishedEvent {
            message_id: event.message_id,
            stream_id,
        })
    }

    /// Enqueue several interactions. Nothing is enqueued if any of them is invalid.
    pub async fn publish_batch(
        &self,
        inputs: Vec<NewInteraction>,
    ) -> EmbeddingResult<Vec<PublishedEvent>> {
        let events = inputs
            .into_iter()
            .map(|input| self.prepare(input))
            .collect::<EmbeddingResult<Vec<_>>>()?;

        if events.is_empty() {
            return Ok(vec![]);
        }

        let stream_ids = self.queue.enqueue_batch(&events).await?;
        if stream_ids.len() != events.len() {
            return Err(EmbeddingError::Broker(format!(
                "broker acknowledged {} of {} events",
                stream_ids.len(),
                events.len()
            )));
        }

        info!(count = events.len(), "Published interaction batch");

        Ok(events
            .into_iter()
            .zip(stream_ids)
            .map(|(event, stream_id)| PublishedEvent {
                message_id: event.message_id,
                stream_id,
            })
            .collect())
    }
}
