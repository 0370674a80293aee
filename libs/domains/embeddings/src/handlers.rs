//! HTTP surface served next to the worker's health endpoints.
//!
//! - `POST /interactions` and `POST /interactions/batch`
//! - `GET /recommendations/{owner_id}?limit=`
//! - `GET /entities/{entity_id}/vector`

use crate::error::{EmbeddingError, EmbeddingResult};
use crate::models::{EmbeddingVector, NewInteraction, PublishedEvent, Recommendations, Space};
use crate::publisher::EventPublisher;
use crate::recommend::RecommendationService;
use crate::store::VectorStore;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub publisher: EventPublisher,
    pub recommender: RecommendationService,
    pub store: Arc<dyn VectorStore>,
    pub default_limit: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/interactions", post(publish_interaction))
        .route("/interactions/batch", post(publish_interactions))
        .route("/recommendations/{owner_id}", get(recommendations))
        .route("/entities/{entity_id}/vector", get(entity_vector))
        .with_state(state)
}

fn parse_id(raw: &str, what: &str) -> EmbeddingResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| EmbeddingError::Validation(format!("Invalid {} ID", what)))
}

async fn publish_interaction(
    State(state): State<AppState>,
    Json(input): Json<NewInteraction>,
) -> EmbeddingResult<(StatusCode, Json<PublishedEvent>)> {
    let published = state.publisher.publish(input).await?;
    Ok((StatusCode::ACCEPTED, Json(published)))
}

async fn publish_interactions(
    State(state): State<AppState>,
    Json(inputs): Json<Vec<NewInteraction>>,
) -> EmbeddingResult<(StatusCode, Json<Vec<PublishedEvent>>)> {
    let published = state.publisher.publish_batch(inputs).await?;
    Ok((StatusCode::ACCEPTED, Json(published)))
}

#[derive(Debug, Deserialize)]
struct RecommendationQuery {
    limit: Option<usize>,
}

async fn recommendations(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Query(query): Query<RecommendationQuery>,
) -> EmbeddingResult<Json<Recommendations>> {
    let owner_id = parse_id(&owner_id, "owner")?;
    let limit = query.limit.unwrap_or(state.default_limit);
    Ok(Json(state.recommender.recommend(owner_id, limit).await))
}

async fn entity_vector(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> EmbeddingResult<Json<EmbeddingVector>> {
    let entity_id = parse_id(&entity_id, "entity")?;
    state
        .store
        .get(Space::Entity, entity_id)
        .await?
        .map(Json)
        .ok_or(EmbeddingError::NotFound(entity_id))
}
