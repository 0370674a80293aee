//! Versioned vector storage.
//!
//! ```text
//! ┌──────────────────────┐
//! │  GuardedVectorStore  │  ← dimension check, circuit breaker
//! └──────────┬───────────┘
//!            │ Arc<dyn VectorStore>
//!   ┌────────┴─────────┐
//!   │                  │
//! PgVectorStore   InMemoryVectorStore
//! ```
//!
//! Every write is a compare-and-set on `version`: the caller passes the
//! version it read (`None` when nothing was stored) and a record whose
//! version is exactly one higher.

mod guarded;
mod memory;
mod postgres;

pub use guarded::GuardedVectorStore;
pub use memory::InMemoryVectorStore;
pub use postgres::PgVectorStore;

use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{EmbeddingVector, PutResult, Space};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn get(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<Option<EmbeddingVector>>;

    /// Store `vector` if the current version equals `expected_version`.
    async fn put(
        &self,
        space: Space,
        vector: EmbeddingVector,
        expected_version: Option<i64>,
    ) -> EmbeddingResult<PutResult>;

    /// Missing ids are absent from the map.
    async fn batch_get(
        &self,
        space: Space,
        owner_ids: &[Uuid],
    ) -> EmbeddingResult<HashMap<Uuid, EmbeddingVector>>;

    /// Returns whether a record was removed.
    async fn delete(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<bool>;

    /// All records of a space in insertion order.
    async fn scan(&self, space: Space) -> EmbeddingResult<Vec<EmbeddingVector>>;
}

/// The version a write must carry for a given expected previous version.
pub(crate) fn check_next_version(
    vector: &EmbeddingVector,
    expected_version: Option<i64>,
) -> EmbeddingResult<()> {
    let required = expected_version.map_or(1, |v| v + 1);
    if vector.version != required {
        return Err(EmbeddingError::Validation(format!(
            "write for {} carries version {}, expected {}",
            vector.owner_id, vector.version, required
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_check_next_version() {
        let first = EmbeddingVector::first(Uuid::new_v4(), vec![1.0], Utc::now());
        assert!(check_next_version(&first, None).is_ok());
        assert!(check_next_version(&first, Some(1)).is_err());

        let second = first.successor(vec![1.0], Utc::now());
        assert!(check_next_version(&second, Some(1)).is_ok());
        assert!(check_next_version(&second, Some(2)).is_err());
    }
}
