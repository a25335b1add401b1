//! Pluggable embedding provider.
//!
//! Production uses an OpenAI-compatible HTTP endpoint; tests inject a
//! deterministic provider. An absent provider is a supported mode: the zoo
//! degrades to lexical-only search.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    config::ToolZooConfig,
    error::{GatewayError, GatewayResult},
};

/// Truncation bound for embedded text.
const MAX_TEXT_CHARS: usize = 8000;
const TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>>;
    fn dimensions(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbeddings {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddings {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        dimensions: usize,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http_client,
            endpoint,
            api_key,
            model,
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>> {
        let text = if text.len() > MAX_TEXT_CHARS {
            debug!(
                "truncating embedding input from {} to {} chars",
                text.len(),
                MAX_TEXT_CHARS
            );
            let mut end = MAX_TEXT_CHARS;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        } else {
            text
        };

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Embedding(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Embedding(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Embedding(format!("decode response: {}", e)))?;

        let values = json["data"]
            .as_array()
            .and_then(|data| data.first())
            .and_then(|first| first["embedding"].as_array())
            .ok_or_else(|| GatewayError::Embedding("malformed embeddings response".into()))?;

        let embedding: Vec<f32> = values
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|v| v as f32)
            .collect();

        if embedding.is_empty() {
            return Err(GatewayError::Embedding("empty embedding returned".into()));
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Build a provider from config. `None` means lexical-only operation.
pub fn provider_from_config(
    config: &ToolZooConfig,
) -> Option<std::sync::Arc<dyn EmbeddingProvider>> {
    let endpoint = config.embedding_endpoint.clone()?;
    let api_key = std::env::var(&config.embedding_api_key_env).ok();
    if api_key.is_none() {
        info!(
            "embedding endpoint configured without {} set; sending unauthenticated requests",
            config.embedding_api_key_env
        );
    }
    info!(
        model = %config.embedding_model,
        endpoint = %endpoint,
        "semantic search enabled"
    );
    Some(std::sync::Arc::new(HttpEmbeddings::new(
        endpoint,
        api_key,
        config.embedding_model.clone(),
        config.embedding_dimensions,
    )))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_disabled_without_endpoint() {
        let config = ToolZooConfig::default();
        assert!(provider_from_config(&config).is_none());
    }

    #[test]
    fn test_provider_enabled_with_endpoint() {
        let config = ToolZooConfig {
            embedding_endpoint: Some("http://localhost:11434/v1/embeddings".into()),
            ..Default::default()
        };
        let provider = provider_from_config(&config).expect("provider");
        assert_eq!(provider.model_name(), "text-embedding-3-small");
        assert_eq!(provider.dimensions(), 1536);
    }
}
