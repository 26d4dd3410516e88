use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::{LlmClient, LlmRequest, Message};
use crate::cache::ResponseCache;
use crate::error::{Result, TempographError};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client
///
/// Retries 429/5xx with exponential backoff. Identical requests are answered from an
/// optional LRU cache keyed by a digest of model and messages.
pub struct OpenAiChatClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_retries: usize,
    cache: Option<Arc<ResponseCache>>,
}

impl OpenAiChatClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TempographError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.0,
            max_retries: 3,
            cache: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn cache_key(&self, messages: &[Message]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        for m in messages {
            hasher.update([0u8]);
            hasher.update(format!("{:?}", m.role).as_bytes());
            hasher.update([0u8]);
            hasher.update(m.content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// One HTTP round trip. `Err((retryable, error))` on failure.
    async fn complete(&self, messages: &[Message]) -> std::result::Result<String, (bool, TempographError)> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                (
                    e.is_timeout() || e.is_connect(),
                    TempographError::Llm(format!("Network error: {}", e)),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            return Err((retryable, TempographError::Llm(format!("API error {}: {}", status, text))));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| (false, TempographError::Llm(format!("Failed to parse response: {}", e))))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| (false, TempographError::Llm("Response contained no content".to_string())))
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn generate(&self, request: &LlmRequest) -> Result<String> {
        let key = self.cache_key(&request.messages);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key) {
                log::debug!("LLM cache hit for {}", request.kind);
                return Ok(hit);
            }
        }

        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);
        let text = loop {
            match self.complete(&request.messages).await {
                Ok(text) => break text,
                Err((true, e)) if attempt < self.max_retries => {
                    log::warn!("LLM retry {}/{} for {} after error: {}", attempt + 1, self.max_retries, request.kind, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err((_, e)) => return Err(e),
            }
        };
        log::debug!("LLM {} call took {:?} (attempt {})", request.kind, start.elapsed(), attempt + 1);

        if let Some(cache) = &self.cache {
            cache.put(key, text.clone());
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::PromptKind;

    fn client() -> OpenAiChatClient {
        OpenAiChatClient::new("test-key".to_string(), "gpt-4o-mini".to_string()).unwrap()
    }

    #[test]
    fn test_cache_key_depends_on_content_and_role() {
        let c = client();
        let a = c.cache_key(&[Message::user("hello")]);
        let b = c.cache_key(&[Message::system("hello")]);
        let a2 = c.cache_key(&[Message::user("hello")]);
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_cached_response_skips_network() {
        let cache = Arc::new(ResponseCache::new(4));
        let c = client().with_base_url("http://127.0.0.1:9/").with_cache(cache.clone());
        let request = LlmRequest::new(PromptKind::ExtractEntities, vec![Message::user("Alice")]);
        cache.put(c.cache_key(&request.messages), "Alice|Person".to_string());

        assert_eq!(c.generate(&request).await.unwrap(), "Alice|Person");
    }

    #[test]
    fn test_user_text_is_last_user_message() {
        let request = LlmRequest::new(
            PromptKind::SummarizeCommunity,
            vec![Message::system("sys"), Message::user("first"), Message::user("second")],
        );
        assert_eq!(request.user_text(), "second");
    }
}
