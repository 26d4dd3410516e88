use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::Embedder;
use crate::cache::EmbeddingCache;
use crate::error::{Result, TempographError};

/// Request structure for the embeddings API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

/// Response structure from the embeddings API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// One failed request, classified for retry.
struct RequestError {
    retryable: bool,
    error: TempographError,
}

/// OpenAI-compatible embeddings client
///
/// Handles batch embedding generation with retry logic and rate limiting.
/// Single-text calls go through an optional LRU cache.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    batch_size: usize,
    dimensions: usize,
    max_retries: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAIEmbedder {
    /// Create a new embedder
    ///
    /// # Arguments
    ///
    /// * `api_key` - API key sent as a bearer token
    /// * `model` - Model name (e.g., "text-embedding-3-small")
    /// * `batch_size` - Maximum number of texts per request (capped at 2048)
    /// * `dimensions` - Expected vector dimension; other sizes are rejected
    pub fn new(api_key: String, model: String, batch_size: usize, dimensions: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TempographError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            batch_size: batch_size.clamp(1, 2048),
            dimensions,
            max_retries: 3,
            cache: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Make a single API request
    async fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RequestError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.model.starts_with("text-embedding-3").then_some(self.dimensions),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RequestError {
                retryable: e.is_timeout() || e.is_connect(),
                error: TempographError::Embedding(format!("Network error: {}", e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(RequestError {
                retryable: is_retryable(status),
                error: TempographError::Embedding(format!("API error {}: {}", status, body)),
            });
        }

        let mut result: EmbeddingResponse = response.json().await.map_err(|e| RequestError {
            retryable: false,
            error: TempographError::Embedding(format!("Failed to parse response: {}", e)),
        })?;
        result.data.sort_by_key(|d| d.index);

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Request with exponential backoff on 429/5xx and transport failures
    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.request(texts).await {
                Ok(embeddings) => {
                    log::debug!(
                        "Embedding API call for {} texts took {:?} (attempt {})",
                        texts.len(),
                        start.elapsed(),
                        attempt + 1
                    );
                    return self.check_shape(texts.len(), embeddings);
                }
                Err(e) if e.retryable && attempt < self.max_retries => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, self.max_retries, e.error);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.error),
            }
        }
    }

    fn check_shape(&self, expected: usize, embeddings: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if embeddings.len() != expected {
            return Err(TempographError::Embedding(format!(
                "Expected {} embeddings, got {}",
                expected,
                embeddings.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimensions) {
            return Err(TempographError::Embedding(format!(
                "Unexpected embedding dimension: expected {}, got {}",
                self.dimensions,
                bad.len()
            )));
        }
        Ok(embeddings)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("Embedding cache hit");
                return Ok(cached);
            }
        }

        let mut embeddings = self.request_with_retry(&[text.to_string()]).await?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| TempographError::Embedding("Empty response from embeddings API".to_string()))?;

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            all.extend(self.request_with_retry(chunk).await?);

            // Small pause between full batches to stay under rate limits
            if chunk.len() == self.batch_size {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
