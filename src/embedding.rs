//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `POST /v1/embeddings` endpoint.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Providers make exactly one HTTP call per [`embed`](EmbeddingProvider::embed)
//! and never retry on their own: they classify the failure into an
//! [`EmbedError`] and leave the retry policy to
//! [`EmbeddingGenerator`](crate::embedder::EmbeddingGenerator).
//!
//! # Error Classification
//!
//! | Response | Error |
//! |----------|-------|
//! | HTTP 429, 503, 529, or a body mentioning "overloaded" | [`EmbedError::Overloaded`] |
//! | HTTP 401, 403 | [`EmbedError::Unauthorized`] |
//! | Anything else (other 4xx/5xx, network, malformed JSON) | [`EmbedError::Failed`] |
//!
//! Also provides [`vec_to_blob`] / [`blob_to_vec`] for the BLOB column
//! encoding used by the `embeddings` table.

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Failure of a single embedding request.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Transient capacity problem; worth retrying after a pause.
    #[error("embedding provider overloaded: {0}")]
    Overloaded(String),
    /// Credentials rejected; retrying cannot help.
    #[error("embedding provider rejected credentials: {0}")]
    Unauthorized(String),
    #[error("embedding request failed: {0}")]
    Failed(String),
}

impl EmbedError {
    pub fn is_overloaded(&self) -> bool {
        matches!(self, EmbedError::Overloaded(_))
    }
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        EmbedError::Failed(err.to_string())
    }
}

/// Trait for embedding providers.
///
/// The returned vectors must be in the same order as `texts`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Expected vector length, if configured. Batches whose vectors differ
    /// are dropped by the generator.
    fn dims(&self) -> Option<usize>;

    /// Embed a batch of texts with one provider call.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Map an unsuccessful HTTP response to an [`EmbedError`].
pub fn classify_failure(provider: &str, status: StatusCode, body: &str) -> EmbedError {
    let message = format!("{} API error {}: {}", provider, status, body);
    let overloaded_status = matches!(status.as_u16(), 429 | 503 | 529);

    if overloaded_status || body.to_ascii_lowercase().contains("overloaded") {
        EmbedError::Overloaded(message)
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        EmbedError::Unauthorized(message)
    } else {
        EmbedError::Failed(message)
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI embeddings API (or a compatible gateway).
///
/// The API key is read once, at construction, from the environment variable
/// named by `embedding.api_key_env`.
pub struct OpenAIProvider {
    model: String,
    dims: Option<usize>,
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` is not set or the API key variable is
    /// missing or empty. The embedding step treats both as "unconfigured".
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;

        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };

        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let endpoint = format!("{}/v1/embeddings", base.trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            api_key,
            endpoint,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if let Some(dims) = self.dims {
            body["dimensions"] = serde_json::json!(dims);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_failure("OpenAI", status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        parse_openai_response(&json)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Items are re-sorted by their `index` field so the result lines up with
/// the request even if the server reorders them.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Failed("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (fallback_index, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_index);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Failed("Invalid OpenAI response: missing embedding".into()))?;

        indexed.push((index, numeric_vector(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

fn numeric_vector(values: &[serde_json::Value]) -> Result<Vec<f32>, EmbedError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbedError::Failed("Embedding value must be numeric".into()))
        })
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default `http://localhost:11434`).
/// The model decides the output size; `dims` is only checked, not requested.
pub struct OllamaProvider {
    model: String,
    dims: Option<usize>,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims: config.dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> Option<usize> {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EmbedError::Failed(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_failure("Ollama", status, &body_text));
        }

        let json: serde_json::Value = response.json().await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EmbedError::Failed("Invalid Ollama response: missing embeddings array".into())
        })?;

    embeddings
        .iter()
        .map(|embedding| {
            let values = embedding.as_array().ok_or_else(|| {
                EmbedError::Failed("Invalid Ollama response: embedding is not an array".into())
            })?;
            numeric_vector(values)
        })
        .collect()
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
///
/// # Errors
///
/// `"disabled"`, unknown names, and providers missing required settings
/// (model, API key) all return an error.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use paper_relay::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
