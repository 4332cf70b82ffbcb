//! Embedding providers for the [`EmbeddingModel`] trait.
//!
//! - **[`HashingEmbedder`]** (`provider = "hashing"`): deterministic, offline, no model download.
//! - **[`LocalEmbedder`]** (`provider = "local"`): fastembed ONNX models such as all-MiniLM-L6-v2;
//!   no network calls after the first model download.
//! - **[`OpenAIEmbedder`]** (`provider = "openai"`): `POST /v1/embeddings`.
//! - **[`OllamaEmbedder`]** (`provider = "ollama"`): `POST /api/embed` on a local Ollama.
//!
//! Use [`create_embedder`] to build the one named in the configuration.
//!
//! # Retry Strategy
//!
//! The HTTP providers retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use policy_qa_core::embedding::{check_batch, ensure_embeddable, EmbeddingModel, HashingEmbedder};
use policy_qa_core::error::EmbeddingError;
use policy_qa_core::models::EmbeddingVector;

use crate::config::EmbeddingConfig;

/// Build the embedder selected by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hashing"` | [`HashingEmbedder`] |
/// | `"local"` | [`LocalEmbedder`] (requires the `local-embeddings` feature) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingModel>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(policy_qa_core::embedding::HASHING_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!(
            "Local embedding provider requires --features local-embeddings (or use provider = \"hashing\")"
        ),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ HTTP retry ============

/// POST `body` to `url`, retrying transient failures.
async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value, EmbeddingError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, url, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| EmbeddingError::Provider(format!("invalid JSON: {}", e)));
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = EmbeddingError::Provider(format!("API error {}: {}", status, body_text));

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(EmbeddingError::Provider(format!(
                    "connection error ({}): {}",
                    url, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| EmbeddingError::Provider("failed after retries".into())))
}

fn parse_vectors(value: Option<&serde_json::Value>) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
    let items = value
        .and_then(|v| v.as_array())
        .ok_or_else(|| EmbeddingError::Provider("response missing embeddings".into()))?;
    items
        .iter()
        .map(|item| -> Result<EmbeddingVector, EmbeddingError> {
            item.as_array()
                .ok_or_else(|| EmbeddingError::Provider("embedding is not an array".into()))?
                .iter()
                .map(|v| {
                    v.as_f64()
                        .map(|f| f as f32)
                        .ok_or_else(|| EmbeddingError::Provider("non-numeric embedding value".into()))
                })
                .collect()
        })
        .collect()
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ============ OpenAI ============

/// Embeddings from the OpenAI API (or any compatible endpoint set via
/// `embedding.url`). Reads the key from `OPENAI_API_KEY`.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            api_key,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or(EmbeddingError::BatchLength {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for t in texts {
            ensure_embeddable(t)?;
        }
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;

        // Responses carry an explicit index; order by it.
        let mut data: Vec<serde_json::Value> = json
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .ok_or_else(|| EmbeddingError::Provider("response missing data array".into()))?;
        data.sort_by_key(|item| item.get("index").and_then(|i| i.as_u64()).unwrap_or(0));
        let embeddings: Vec<serde_json::Value> = data
            .into_iter()
            .filter_map(|mut item| item.get_mut("embedding").map(serde_json::Value::take))
            .collect();

        let vectors = parse_vectors(Some(&serde_json::Value::Array(embeddings)))?;
        check_batch(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or(EmbeddingError::BatchLength {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for t in texts {
            ensure_embeddable(t)?;
        }
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json =
            post_json_with_retry(&self.client, &self.url, None, &body, self.max_retries).await?;
        let vectors = parse_vectors(json.get("embeddings"))?;
        check_batch(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Local (fastembed) ============

/// Known local models and their output dimensionality.
pub fn local_model_dims(name: &str) -> Option<usize> {
    match name {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => Some(384),
        "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "multilingual-e5-base" => Some(768),
        "bge-large-en-v1.5" | "multilingual-e5-large" => Some(1024),
        _ => None,
    }
}

/// Local ONNX inference via fastembed. The model is loaded on first use
/// and kept for the life of the embedder.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        to_fastembed_model(&model_name)?;
        let dims = match (config.dims, local_model_dims(&model_name)) {
            (Some(d), _) => d,
            (None, Some(d)) => d,
            (None, None) => bail!("embedding.dims required for local model '{}'", model_name),
        };
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, \
             multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingModel for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or(EmbeddingError::BatchLength {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for t in texts {
            ensure_embeddable(t)?;
        }

        let slot = Arc::clone(&self.model);
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let inputs = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| EmbeddingError::Provider("local model lock poisoned".into()))?;
            if guard.is_none() {
                let which = to_fastembed_model(&name).map_err(|e| EmbeddingError::Provider(e.to_string()))?;
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(which).with_show_download_progress(true),
                )
                .map_err(|e| {
                    EmbeddingError::Provider(format!("failed to initialize local model: {}", e))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| EmbeddingError::Provider("local model unavailable".into()))?;
            model
                .embed(inputs, Some(batch_size))
                .map_err(|e| EmbeddingError::Provider(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| EmbeddingError::Provider(format!("embedding task failed: {}", e)))??;

        check_batch(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}
