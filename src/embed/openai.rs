//! Remote embeddings through an OpenAI-compatible `/embeddings` endpoint

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingResponse {
    /// Vectors in input order; the API tags each item with its input index
    fn into_ordered(mut self, expected: usize) -> Result<Vec<Vec<f32>>> {
        if self.data.len() != expected {
            return Err(Error::Embedding(format!(
                "Malformed embeddings response: expected {} vectors, got {}",
                expected,
                self.data.len()
            )));
        }
        if self.data.iter().all(|d| d.index.is_some()) {
            self.data.sort_by_key(|d| d.index);
        }
        Ok(self.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Collapse newlines and whitespace runs into single spaces
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct OpenAiEmbedder {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    dimension: usize,
    retries: usize,
}

impl OpenAiEmbedder {
    /// Create an embedder reading the API key from the configured env var
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.openai_api_key().ok_or_else(|| {
            Error::Config(format!(
                "{} environment variable not set (required when embedding.use_openai = true)",
                config.openai_api_key_env
            ))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let mut base = config.openai_base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)?.join("embeddings")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: config.openai_model.clone(),
            dimension: config.resolved_dimension()?,
            retries: config.max_retries,
        })
    }

    async fn send_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };

        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }

            let response = self
                .client
                .post(self.endpoint.clone())
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
                            Error::Embedding(format!("Malformed embeddings response: {}", e))
                        })?;
                        return parsed.into_ordered(inputs.len());
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = Error::Embedding(format!("OpenAI API error {}: {}", status, body));

                    // Rate limited or server error: retry. Other client errors are final.
                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(attempt, %status, "Retrying embeddings request");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Embeddings request failed");
                    last_err = Some(Error::Embedding(e.to_string()));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::Embedding("Embeddings request failed after retries".to_string())
        }))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<String> = texts.iter().map(|t| normalize_whitespace(t)).collect();
        self.send_with_retry(&inputs).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
