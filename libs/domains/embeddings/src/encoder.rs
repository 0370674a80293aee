//! Text-to-vector encoding.

use crate::error::{EmbeddingError, EmbeddingResult};
use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_or_default, env_required};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use stream_worker::CircuitBreaker;

/// Remote capability that turns free text into a fixed-length vector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorEncoder: Send + Sync {
    async fn encode(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Encoder name for logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl FromEnv for OpenAiConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let timeout_secs: u64 = core_config::env_parse("OPENAI_TIMEOUT_SECS", 10)?;
        Ok(Self {
            api_key: env_required("OPENAI_API_KEY")?,
            base_url: env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            model: env_or_default("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// OpenAI-compatible `/embeddings` endpoint, asked for vectors of exactly
/// `dimension` components.
pub struct OpenAiEncoder {
    client: Client,
    config: OpenAiConfig,
    dimension: usize,
}

impl OpenAiEncoder {
    pub fn new(config: OpenAiConfig, dimension: usize) -> EmbeddingResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EmbeddingError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            dimension,
        })
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl VectorEncoder for OpenAiEncoder {
    async fn encode(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: vec![text],
            dimensions: self.dimension,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Encoder(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        let mut data = response.json::<EmbeddingResponse>().await?.data;
        data.sort_by_key(|d| d.index);

        let embedding = data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Encoder("No embedding returned".to_string()))?;

        if embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Routes every encode through a shared circuit breaker so an encoder
/// outage fails fast instead of waiting out the HTTP timeout per call.
///
/// Only transport and API errors count against the breaker.
#[derive(Clone)]
pub struct GuardedEncoder {
    inner: Arc<dyn VectorEncoder>,
    breaker: CircuitBreaker,
}

impl GuardedEncoder {
    pub fn new(inner: Arc<dyn VectorEncoder>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl VectorEncoder for GuardedEncoder {
    async fn encode(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        Ok(self
            .breaker
            .call_with(
                || self.inner.encode(text),
                EmbeddingError::is_encoder_failure,
            )
            .await?)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
