//! Stream error types.
//!
//! The category of an error decides what happens to the message:
//! - **Transient**: left unacknowledged and redelivered with backoff
//! - **Permanent**: dead-lettered and acknowledged

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
        }
    }
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Processing error: {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StreamError {
    /// Failure worth retrying through redelivery.
    pub fn transient(message: impl Into<String>) -> Self {
        StreamError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Failure that no amount of redelivery will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        StreamError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Redis(_) => ErrorCategory::Transient,
            StreamError::Serialization(_) => ErrorCategory::Permanent,
            StreamError::Processing { category, .. } => *category,
            StreamError::CircuitOpen(_) => ErrorCategory::Transient,
            StreamError::Config(_) => ErrorCategory::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// The consumer group was deleted under us.
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, StreamError::Redis(e) if e.to_string().contains("NOGROUP"))
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, StreamError::Redis(e) if e.is_io_error() || e.is_connection_dropped())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(StreamError::transient("version conflict").is_transient());
        assert!(!StreamError::permanent("unknown entity").is_transient());
        assert!(StreamError::CircuitOpen("vector-store".into()).is_transient());
        assert_eq!(
            StreamError::Serialization("bad json".into()).category(),
            ErrorCategory::Permanent
        );
    }

    #[test]
    fn test_from_serde_error_is_permanent() {
        let err: StreamError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert_eq!(err.category().as_str(), "permanent");
    }
}
