use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stream_worker::{BreakerError, StreamError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Vector has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict for {owner_id}: expected previous version {expected:?}")]
    VersionConflict {
        owner_id: Uuid,
        expected: Option<i64>,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

impl EmbeddingError {
    /// Whether repeating the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::VersionConflict { .. }
                | EmbeddingError::ServiceUnavailable(_)
                | EmbeddingError::Encoder(_)
                | EmbeddingError::Database(_)
                | EmbeddingError::Cache(_)
                | EmbeddingError::Broker(_)
                | EmbeddingError::Catalog(_)
        )
    }

    /// Errors that say something about the health of the vector store.
    /// Conflicts and bad input are the caller's problem, not the dependency's.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, EmbeddingError::Database(_))
    }

    /// Errors that say the remote encoder is unhealthy.
    pub fn is_encoder_failure(&self) -> bool {
        matches!(self, EmbeddingError::Encoder(_))
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(err: reqwest::Error) -> Self {
        EmbeddingError::Encoder(err.to_string())
    }
}

impl From<validator::ValidationErrors> for EmbeddingError {
    fn from(err: validator::ValidationErrors) -> Self {
        EmbeddingError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for EmbeddingError {
    fn from(err: serde_json::Error) -> Self {
        EmbeddingError::Internal(format!("JSON error: {}", err))
    }
}

impl From<sea_orm::DbErr> for EmbeddingError {
    fn from(err: sea_orm::DbErr) -> Self {
        EmbeddingError::Database(err.to_string())
    }
}

impl From<BreakerError<EmbeddingError>> for EmbeddingError {
    fn from(err: BreakerError<EmbeddingError>) -> Self {
        match err {
            BreakerError::Open { name } => {
                EmbeddingError::ServiceUnavailable(format!("circuit '{}' is open", name))
            }
            BreakerError::Inner(e) => e,
        }
    }
}

impl From<StreamError> for EmbeddingError {
    fn from(err: StreamError) -> Self {
        EmbeddingError::Broker(err.to_string())
    }
}

/// Map onto the worker's redelivery decision.
impl From<EmbeddingError> for StreamError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::ServiceUnavailable(msg) => StreamError::CircuitOpen(msg),
            e if e.is_retryable() => StreamError::transient(e.to_string()),
            e => StreamError::permanent(e.to_string()),
        }
    }
}

impl IntoResponse for EmbeddingError {
    fn into_response(self) -> Response {
        let status = match &self {
            EmbeddingError::Validation(_) | EmbeddingError::DimensionMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            EmbeddingError::NotFound(_) => StatusCode::NOT_FOUND,
            EmbeddingError::VersionConflict { .. } => StatusCode::CONFLICT,
            EmbeddingError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EmbeddingError::Broker(_) | EmbeddingError::Encoder(_) | EmbeddingError::Catalog(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(
            EmbeddingError::VersionConflict {
                owner_id: Uuid::nil(),
                expected: Some(3)
            }
            .is_retryable()
        );
        assert!(EmbeddingError::Database("timeout".into()).is_retryable());
        assert!(!EmbeddingError::Validation("missing phrase".into()).is_retryable());
        assert!(
            !EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_stream_error_mapping() {
        let conflict: StreamError = EmbeddingError::VersionConflict {
            owner_id: Uuid::nil(),
            expected: None,
        }
        .into();
        assert!(conflict.is_transient());

        let invalid: StreamError = EmbeddingError::Validation("bad".into()).into();
        assert!(!invalid.is_transient());

        let open: StreamError = EmbeddingError::ServiceUnavailable("vector-store".into()).into();
        assert!(matches!(open, StreamError::CircuitOpen(_)));
    }

    #[test]
    fn test_open_breaker_maps_to_unavailable() {
        let err: EmbeddingError = BreakerError::<EmbeddingError>::Open {
            name: "vector-store".into(),
        }
        .into();
        assert!(matches!(err, EmbeddingError::ServiceUnavailable(_)));

        let inner: EmbeddingError =
            BreakerError::Inner(EmbeddingError::Database("down".into())).into();
        assert!(matches!(inner, EmbeddingError::Database(_)));
    }

    #[test]
    fn test_status_codes() {
        let not_found = EmbeddingError::NotFound(Uuid::nil()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let unavailable = EmbeddingError::ServiceUnavailable("x".into()).into_response();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let invalid = EmbeddingError::Validation("x".into()).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
