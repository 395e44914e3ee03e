//! ============================================================================
//! Embedding Service - Vector embeddings for semantic memory search
//! ============================================================================
//! Generates text embeddings through an OpenAI-compatible API, or locally
//! with deterministic feature hashing when no API is configured.
//!
//! `ResilientEmbedder` wraps either backend with bounded retries and never
//! fails: on exhaustion it returns the zero vector of the configured
//! dimension so the turn can still be logged.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::retry::{with_retry, RetryConfig};
use crate::types::{MemoryError, MemoryResult};

/// Default embedding model (OpenAI compatible)
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Expected embedding dimension for text-embedding-3-small
pub const EMBEDDING_DIM: usize = 1536;

/// Default OpenAI API base URL
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Text to fixed-dimension vector
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn generate(&self, text: &str) -> MemoryResult<Vec<f32>>;

    /// Length of every vector this generator produces
    fn dimension(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// True for the zero vector substituted when embedding fails
pub fn is_sentinel(embedding: &[f32]) -> bool {
    embedding.iter().all(|v| *v == 0.0)
}

// ============================================================================
// Remote embeddings (OpenAI-compatible)
// ============================================================================

/// Embedding service for generating text vectors over HTTP
pub struct EmbeddingService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct EmbeddingUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

impl EmbeddingService {
    /// Create a new embedding service using the OpenAI API
    pub fn new_openai(api_key: String) -> Self {
        Self::new_custom(
            api_key,
            OPENAI_BASE_URL.to_string(),
            DEFAULT_EMBEDDING_MODEL.to_string(),
            EMBEDDING_DIM,
        )
    }

    /// Create with custom base URL, model and dimension
    pub fn new_custom(api_key: String, base_url: String, model: String, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimension,
        }
    }

    /// Apply a client-side request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> MemoryResult<Self> {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(self)
    }

    /// Generate embeddings for multiple texts
    pub async fn embed(&self, texts: Vec<String>) -> MemoryResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(format!("Failed to send embedding request: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MemoryError::Embedding(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(error) => error.error.message,
                Err(_) => body,
            };
            return Err(MemoryError::from_status(
                "Embedding API",
                status.as_u16(),
                message,
                MemoryError::Embedding,
            ));
        }

        let embedding_response: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            MemoryError::Embedding(format!("Failed to parse embedding response: {}", e))
        })?;

        if let Some(usage) = &embedding_response.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, embedding_response.model
            );
        }

        let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }

    /// Get the current model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl EmbeddingGenerator for EmbeddingService {
    async fn generate(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let embedding = self
            .embed(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Embedding("No embedding returned".to_string()))?;

        if embedding.len() != self.dimension {
            return Err(MemoryError::Embedding(format!(
                "Expected {}-dimensional embedding from {}, got {}",
                self.dimension,
                self.model,
                embedding.len()
            )));
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ============================================================================
// Local hashing embeddings
// ============================================================================

/// Deterministic bag-of-words embedder using FNV-1a token hashing.
/// Works offline; similar texts share buckets, so cosine similarity tracks
/// word overlap.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Normalized hashed vector for `text`. Empty text maps to the zero vector.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for raw_token in text.split(|c: char| !c.is_alphanumeric()) {
            if raw_token.is_empty() {
                continue;
            }
            let hash = fnv1a_hash(raw_token.to_lowercase().as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for component in &mut vector {
                *component /= magnitude;
            }
        }
        vector
    }
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[async_trait]
impl EmbeddingGenerator for HashingEmbedder {
    async fn generate(&self, text: &str) -> MemoryResult<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

// ============================================================================
// Degrading wrapper
// ============================================================================

/// Retries the inner generator and substitutes the zero vector on failure
#[derive(Clone)]
pub struct ResilientEmbedder {
    inner: Arc<dyn EmbeddingGenerator>,
    retry: RetryConfig,
}

impl ResilientEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingGenerator>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.name()
    }

    /// Embedding for `text`, or the zero vector if the backend is down
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        let inner = self.inner.clone();
        let result = with_retry(&self.retry, "embeddings.generate", || {
            let inner = inner.clone();
            async move { inner.generate(text).await }
        })
        .await;

        match result {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(
                    "Embedding backend {} unavailable, using zero vector: {}",
                    self.inner.name(),
                    e
                );
                vec![0.0; self.dimension()]
            }
        }
    }
}

/// Create the configured embedding backend
pub fn create_embedding_service(
    backend: &str,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    dimension: usize,
    timeout: Duration,
) -> MemoryResult<Arc<dyn EmbeddingGenerator>> {
    match backend {
        "openai" => {
            let key = api_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| MemoryError::Configuration(
                    "OPENAI_API_KEY is required for openai embeddings".to_string(),
                ))?;
            let service = EmbeddingService::new_custom(
                key,
                base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
                dimension,
            )
            .with_timeout(timeout)?;
            debug!("Using {} ({}) for embeddings", service.model(), service.base_url());
            Ok(Arc::new(service))
        }
        "hashing" => {
            debug!("Using local hashing embeddings ({} dims)", dimension);
            Ok(Arc::new(HashingEmbedder::new(dimension)))
        }
        other => Err(MemoryError::Configuration(format!(
            "Unknown embedding backend '{}'. Valid values: openai, hashing",
            other
        ))),
    }
}
