use super::VectorStore;
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{EmbeddingVector, PutResult, Space};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use stream_worker::CircuitBreaker;
use uuid::Uuid;

/// Enforces the deployment's vector length and routes every call through a
/// shared circuit breaker.
///
/// Only backend failures count against the breaker; conflicts and rejected
/// input pass through untouched.
#[derive(Clone)]
pub struct GuardedVectorStore {
    inner: Arc<dyn VectorStore>,
    breaker: CircuitBreaker,
    dimension: usize,
}

impl GuardedVectorStore {
    pub fn new(inner: Arc<dyn VectorStore>, breaker: CircuitBreaker, dimension: usize) -> Self {
        Self {
            inner,
            breaker,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn check_dimension(&self, vector: &[f32]) -> EmbeddingResult<()> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(EmbeddingError::Validation(
                "vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for GuardedVectorStore {
    async fn get(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<Option<EmbeddingVector>> {
        Ok(self
            .breaker
            .call_with(
                || self.inner.get(space, owner_id),
                EmbeddingError::is_dependency_failure,
            )
            .await?)
    }

    async fn put(
        &self,
        space: Space,
        vector: EmbeddingVector,
        expected_version: Option<i64>,
    ) -> EmbeddingResult<PutResult> {
        self.check_dimension(&vector.vector)?;
        Ok(self
            .breaker
            .call_with(
                || self.inner.put(space, vector, expected_version),
                EmbeddingError::is_dependency_failure,
            )
            .await?)
    }

    async fn batch_get(
        &self,
        space: Space,
        owner_ids: &[Uuid],
    ) -> EmbeddingResult<HashMap<Uuid, EmbeddingVector>> {
        Ok(self
            .breaker
            .call_with(
                || self.inner.batch_get(space, owner_ids),
                EmbeddingError::is_dependency_failure,
            )
            .await?)
    }

    async fn delete(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<bool> {
        Ok(self
            .breaker
            .call_with(
                || self.inner.delete(space, owner_id),
                EmbeddingError::is_dependency_failure,
            )
            .await?)
    }

    async fn scan(&self, space: Space) -> EmbeddingResult<Vec<EmbeddingVector>> {
        Ok(self
            .breaker
            .call_with(
                || self.inner.scan(space),
                EmbeddingError::is_dependency_failure,
            )
            .await?)
    }
}
