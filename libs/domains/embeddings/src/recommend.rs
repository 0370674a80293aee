//! Recommendations for end users.
//!
//! Personalized results come from the user's interest vector. Whenever that
//! is impossible (no vector yet, nothing above the threshold, the store or
//! its circuit is down) the answer is a non-personalized list instead of an
//! error.

use crate::error::EmbeddingResult;
use crate::models::{Recommendations, ScoredEntity, Space};
use crate::similarity::{Personalized, SimilarityEngine};
use crate::store::VectorStore;
use crate::sync::CatalogSource;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_LIMIT: usize = 100;

/// Source of the non-personalized list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackSource: Send + Sync {
    async fn top(&self, limit: usize) -> EmbeddingResult<Vec<Uuid>>;
}

/// The catalog's own ordering, independent of the vector store.
pub struct CatalogFallback {
    catalog: Arc<dyn CatalogSource>,
}

impl CatalogFallback {
    pub fn new(catalog: Arc<dyn CatalogSource>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl FallbackSource for CatalogFallback {
    async fn top(&self, limit: usize) -> EmbeddingResult<Vec<Uuid>> {
        Ok(self
            .catalog
            .list_page(0, limit)
            .await?
            .into_iter()
            .map(|item| item.id)
            .collect())
    }
}

/// Most recently synced entities.
pub struct RecentEntitiesFallback {
    store: Arc<dyn VectorStore>,
}

impl RecentEntitiesFallback {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FallbackSource for RecentEntitiesFallback {
    async fn top(&self, limit: usize) -> EmbeddingResult<Vec<Uuid>> {
        let mut entities = self.store.scan(Space::Entity).await?;
        entities.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        Ok(entities.into_iter().take(limit).map(|e| e.owner_id).collect())
    }
}

#[derive(Clone)]
pub struct RecommendationService {
    store: Arc<dyn VectorStore>,
    engine: SimilarityEngine,
    fallback: Arc<dyn FallbackSource>,
}

impl RecommendationService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        engine: SimilarityEngine,
        fallback: Arc<dyn FallbackSource>,
    ) -> Self {
        Self {
            store,
            engine,
            fallback,
        }
    }

    pub fn engine(&self) -> &SimilarityEngine {
        &self.engine
    }

    pub async fn recommend(&self, owner_id: Uuid, limit: usize) -> Recommendations {
        let limit = limit.clamp(1, MAX_LIMIT);

        match self.personalized(owner_id, limit).await {
            Ok(Some(items)) => Recommendations {
                items,
                personalized: true,
            },
            Ok(None) => self.non_personalized(limit).await,
            Err(e) => {
                warn!(owner_id = %owner_id, error = %e, "Personalized recommendations unavailable");
                self.non_personalized(limit).await
            }
        }
    }

    async fn personalized(
        &self,
        owner_id: Uuid,
        limit: usize,
    ) -> EmbeddingResult<Option<Vec<ScoredEntity>>> {
        let Some(user) = self.store.get(Space::User, owner_id).await? else {
            debug!(owner_id = %owner_id, "No interest vector yet");
            return Ok(None);
        };

        match self.engine.search_personalized(&user.vector, limit).await? {
            Personalized::Results(items) => Ok(Some(items)),
            Personalized::NoPersonalizedResults => Ok(None),
        }
    }

    async fn non_personalized(&self, limit: usize) -> Recommendations {
        let items = match self.fallback.top(limit).await {
            Ok(ids) => ids
                .into_iter()
                .map(|entity_id| ScoredEntity {
                    entity_id,
                    score: 0.0,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Fallback recommendations unavailable");
                Vec::new()
            }
        };

        Recommendations {
            items,
            personalized: false,
        }
    }
}
