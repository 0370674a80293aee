use chrono::{DateTime, Utc};
use sea_orm::sea_query::StringLen;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use stream_worker::StreamJob;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Longest search phrase handed to the encoder, in characters. Kept in step
/// with the `length` bounds on `search_phrase` below.
pub const MAX_SEARCH_PHRASE_CHARS: u64 = 512;

/// Kind of storefront interaction, in increasing order of intent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Search,
    View,
    Click,
    Purchase,
}

impl EventType {
    /// Whether the event's vector comes from a catalog entity rather than text.
    pub fn references_entity(&self) -> bool {
        !matches!(self, EventType::Search)
    }
}

/// One interaction as carried on the updates stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_event_shape", skip_on_field_errors = false))]
pub struct InteractionEvent {
    /// Content hash, see [`crate::publisher::compute_message_id`]
    #[validate(length(min = 1, max = 128))]
    pub message_id: String,
    /// The acting user
    pub entity_id: Uuid,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 512))]
    pub search_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referenced_entity_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StreamJob for InteractionEvent {
    fn job_id(&self) -> String {
        self.message_id.clone()
    }
}

/// An interaction as submitted by the storefront, before it has an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_new_interaction_shape", skip_on_field_errors = false))]
pub struct NewInteraction {
    pub entity_id: Uuid,
    pub event_type: EventType,
    #[serde(default)]
    #[validate(length(min = 1, max = 512))]
    pub search_phrase: Option<String>,
    #[serde(default)]
    pub referenced_entity_id: Option<Uuid>,
    /// Defaults to the time of publishing
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn validate_event_shape(event: &InteractionEvent) -> Result<(), ValidationError> {
    check_shape(
        event.event_type,
        event.search_phrase.as_deref(),
        event.referenced_entity_id,
    )
}

fn validate_new_interaction_shape(input: &NewInteraction) -> Result<(), ValidationError> {
    check_shape(
        input.event_type,
        input.search_phrase.as_deref(),
        input.referenced_entity_id,
    )
}

/// SEARCH carries a non-blank phrase; every other type references an entity.
fn check_shape(
    event_type: EventType,
    search_phrase: Option<&str>,
    referenced_entity_id: Option<Uuid>,
) -> Result<(), ValidationError> {
    match event_type {
        EventType::Search => match search_phrase {
            Some(phrase) if !phrase.trim().is_empty() => Ok(()),
            _ => Err(ValidationError::new("search_phrase_required").with_message(Cow::Borrowed(
                "SEARCH events require a non-blank search_phrase",
            ))),
        },
        other => match referenced_entity_id {
            Some(_) => Ok(()),
            None => Err(ValidationError::new("referenced_entity_required")
                .with_message(Cow::Owned(format!(
                    "{} events require a referenced_entity_id",
                    other
                )))),
        },
    }
}

/// Result of publishing one interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub message_id: String,
    pub stream_id: String,
}

/// Which family of vectors a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Space {
    /// Interest vectors, one per user
    User,
    /// Catalog vectors, one per entity
    Entity,
}

impl Space {
    pub fn table_name(&self) -> &'static str {
        match self {
            Space::User => "user_embeddings",
            Space::Entity => "entity_embeddings",
        }
    }
}

/// A stored vector with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub owner_id: Uuid,
    pub vector: Vec<f32>,
    /// Starts at 1 and grows by exactly 1 per successful write
    pub version: i64,
    pub last_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingVector {
    /// First version of a vector for `owner_id`.
    pub fn first(owner_id: Uuid, vector: Vec<f32>, updated_at: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            vector,
            version: 1,
            last_updated_at: updated_at,
            created_at: Utc::now(),
        }
    }

    /// The record that replaces `self` on the next write.
    pub fn successor(&self, vector: Vec<f32>, updated_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: self.owner_id,
            vector,
            version: self.version + 1,
            last_updated_at: updated_at,
            created_at: self.created_at,
        }
    }

    /// Build the next record for `owner_id`, given whatever is currently stored.
    pub fn next(
        owner_id: Uuid,
        current: Option<&EmbeddingVector>,
        vector: Vec<f32>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        match current {
            Some(prior) => prior.successor(vector, updated_at),
            None => Self::first(owner_id, vector, updated_at),
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Outcome of a compare-and-set write.
#[derive(Debug, Clone, PartialEq)]
pub enum PutResult {
    Stored(EmbeddingVector),
    /// The stored version did not match the expected previous version
    Conflict { current_version: Option<i64> },
}

impl PutResult {
    pub fn is_conflict(&self) -> bool {
        matches!(self, PutResult::Conflict { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity_id: Uuid,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub items: Vec<ScoredEntity>,
    /// `false` when the list came from the non-personalized fallback
    pub personalized: bool,
}

/// Catalog mutation that a vector must follow.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    #[sea_orm(string_value = "create")]
    Create,
    #[sea_orm(string_value = "update")]
    Update,
    #[sea_orm(string_value = "delete")]
    Delete,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationStatus {
    /// Waiting for `next_retry_at`
    #[sea_orm(string_value = "failed")]
    Failed,
    /// Claimed by a coordinator
    #[sea_orm(string_value = "retrying")]
    Retrying,
    #[sea_orm(string_value = "resolved")]
    Resolved,
    /// Retry ceiling exceeded, only a manual retry revives it
    #[sea_orm(string_value = "abandoned")]
    Abandoned,
}

/// A catalog sync operation that failed and is owned by the retry coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub id: Uuid,
    pub target_id: Uuid,
    pub operation: OperationKind,
    pub attempts: i32,
    pub status: OperationStatus,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A catalog create/update/delete as carried on the catalog stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogChange {
    pub change_id: Uuid,
    pub entity_id: Uuid,
    pub operation: OperationKind,
    /// Text to encode. When absent the catalog is asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl CatalogChange {
    pub fn new(entity_id: Uuid, operation: OperationKind, text: Option<String>) -> Self {
        Self {
            change_id: Uuid::now_v7(),
            entity_id,
            operation,
            text,
            occurred_at: Utc::now(),
        }
    }
}

impl StreamJob for CatalogChange {
    fn job_id(&self) -> String {
        self.change_id.to_string()
    }
}
