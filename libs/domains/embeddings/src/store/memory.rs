use super::{VectorStore, check_next_version};
use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{EmbeddingVector, PutResult, Space};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Records {
    next_seq: u64,
    by_owner: HashMap<Uuid, (u64, EmbeddingVector)>,
}

/// Process-local store with the same compare-and-set semantics as Postgres.
#[derive(Default)]
pub struct InMemoryVectorStore {
    spaces: RwLock<HashMap<Space, Records>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> EmbeddingError {
        EmbeddingError::Internal("vector store lock poisoned".to_string())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn get(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<Option<EmbeddingVector>> {
        let spaces = self.spaces.read().map_err(|_| Self::poisoned())?;
        Ok(spaces
            .get(&space)
            .and_then(|r| r.by_owner.get(&owner_id))
            .map(|(_, v)| v.clone()))
    }

    async fn put(
        &self,
        space: Space,
        vector: EmbeddingVector,
        expected_version: Option<i64>,
    ) -> EmbeddingResult<PutResult> {
        check_next_version(&vector, expected_version)?;

        let mut spaces = self.spaces.write().map_err(|_| Self::poisoned())?;
        let records = spaces.entry(space).or_default();

        let current_version = records.by_owner.get(&vector.owner_id).map(|(_, v)| v.version);
        if current_version != expected_version {
            return Ok(PutResult::Conflict { current_version });
        }

        let seq = match records.by_owner.get(&vector.owner_id) {
            Some((seq, _)) => *seq,
            None => {
                records.next_seq += 1;
                records.next_seq
            }
        };
        records
            .by_owner
            .insert(vector.owner_id, (seq, vector.clone()));
        Ok(PutResult::Stored(vector))
    }

    async fn batch_get(
        &self,
        space: Space,
        owner_ids: &[Uuid],
    ) -> EmbeddingResult<HashMap<Uuid, EmbeddingVector>> {
        let spaces = self.spaces.read().map_err(|_| Self::poisoned())?;
        let Some(records) = spaces.get(&space) else {
            return Ok(HashMap::new());
        };
        Ok(owner_ids
            .iter()
            .filter_map(|id| records.by_owner.get(id).map(|(_, v)| (*id, v.clone())))
            .collect())
    }

    async fn delete(&self, space: Space, owner_id: Uuid) -> EmbeddingResult<bool> {
        let mut spaces = self.spaces.write().map_err(|_| Self::poisoned())?;
        Ok(spaces
            .get_mut(&space)
            .and_then(|r| r.by_owner.remove(&owner_id))
            .is_some())
    }

    async fn scan(&self, space: Space) -> EmbeddingResult<Vec<EmbeddingVector>> {
        let spaces = self.spaces.read().map_err(|_| Self::poisoned())?;
        let Some(records) = spaces.get(&space) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<&(u64, EmbeddingVector)> = records.by_owner.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries.into_iter().map(|(_, v)| v.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn vector(owner: Uuid) -> EmbeddingVector {
        EmbeddingVector::first(owner, vec![1.0, 0.0], Utc::now())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryVectorStore::new();
        let owner = Uuid::new_v4();

        let result = store.put(Space::User, vector(owner), None).await.unwrap();
        assert!(!result.is_conflict());

        let stored = store.get(Space::User, owner).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(store.get(Space::Entity, owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let store = InMemoryVectorStore::new();
        let owner = Uuid::new_v4();
        let v1 = vector(owner);
        store.put(Space::User, v1.clone(), None).await.unwrap();

        let v2 = v1.successor(vec![0.0, 1.0], Utc::now());
        assert!(!store.put(Space::User, v2.clone(), Some(1)).await.unwrap().is_conflict());

        // A writer that still believes version 1 is current loses
        let late = v1.successor(vec![0.5, 0.5], Utc::now());
        let result = store.put(Space::User, late, Some(1)).await.unwrap();
        assert_eq!(
            result,
            PutResult::Conflict {
                current_version: Some(2)
            }
        );

        // Inserting over an existing record conflicts as well
        let dup = store.put(Space::User, vector(owner), None).await.unwrap();
        assert!(dup.is_conflict());
        assert_eq!(store.get(Space::User, owner).await.unwrap().unwrap(), v2);
    }

    #[tokio::test]
    async fn test_scan_keeps_insertion_order_across_updates() {
        let store = InMemoryVectorStore::new();
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.put(Space::Entity, vector(*id), None).await.unwrap();
        }

        let first = store.get(Space::Entity, ids[0]).await.unwrap().unwrap();
        let updated = first.successor(vec![0.0, 1.0], Utc::now());
        store.put(Space::Entity, updated, Some(1)).await.unwrap();

        let scanned: Vec<Uuid> = store
            .scan(Space::Entity)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.owner_id)
            .collect();
        assert_eq!(scanned, ids);
    }

    #[tokio::test]
    async fn test_batch_get_and_delete() {
        let store = InMemoryVectorStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.put(Space::Entity, vector(a), None).await.unwrap();

        let found = store.batch_get(Space::Entity, &[a, b]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&a));

        assert!(store.delete(Space::Entity, a).await.unwrap());
        assert!(!store.delete(Space::Entity, a).await.unwrap());
        assert!(store.scan(Space::Entity).await.unwrap().is_empty());
    }
}
