//! HTTP client for the external ML inference service.
//!
//! Models run in a separate service; this core only speaks the typed
//! `embed`/`nli` contract over HTTP. Requests retry with exponential
//! backoff; a service-side `ok: false` is surfaced as a typed error rather
//! than retried.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Settings;

/// Errors from the ML service client.
#[derive(Debug, thiserror::Error)]
pub enum MlClientError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("nli failed: {0}")]
    Nli(String),

    #[error("ml request failed: {0}")]
    Request(String),
}

/// One NLI input pair.
#[derive(Debug, Clone, Serialize)]
pub struct NliPair {
    pub pair_id: String,
    pub premise: String,
    pub nli_hypothesis: String,
}

/// One NLI verdict.
#[derive(Debug, Clone, Deserialize)]
pub struct NliVerdict {
    pub pair_id: String,
    /// `supports`, `refutes`, or `neutral`.
    pub stance: String,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    ok: bool,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NliResponse {
    ok: bool,
    #[serde(default)]
    results: Vec<NliVerdict>,
    #[serde(default)]
    error: Option<String>,
}

/// Typed client for the ML service.
pub struct MlClient {
    settings: Arc<Settings>,
    client: reqwest::Client,
}

impl MlClient {
    pub fn new(settings: Arc<Settings>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.ml.timeout_secs))
            .build()?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.settings.ml.base_url.trim_end_matches('/'))
    }

    async fn post_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, MlClientError> {
        let url = self.endpoint(path);
        let max_retries = self.settings.ml.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_retries {
            match self.client.post(&url).json(body).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => match response.json::<T>().await {
                        Ok(parsed) => return Ok(parsed),
                        Err(e) => last_error = e.to_string(),
                    },
                    Err(e) => {
                        warn!(path, attempt = attempt + 1, error = %e, "ML service HTTP error");
                        last_error = e.to_string();
                    }
                },
                Err(e) => {
                    warn!(path, attempt = attempt + 1, error = %e, "ML service request error");
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < max_retries {
                let delay = self.settings.ml.retry_delay_secs * f64::from(2u32.pow(attempt));
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        Err(MlClientError::Request(last_error))
    }

    /// Embed a batch of texts. Empty input short-circuits to an empty
    /// result without a network round-trip.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MlClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response: EmbedResponse = self
            .post_with_retry("/embed", &serde_json::json!({ "texts": texts, "batch_size": 8 }))
            .await?;
        if !response.ok {
            let error = response.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(MlClientError::Embedding(error));
        }
        Ok(response.embeddings)
    }

    /// Judge stance for a batch of premise/hypothesis pairs.
    pub async fn nli(&self, pairs: &[NliPair]) -> Result<Vec<NliVerdict>, MlClientError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let response: NliResponse = self
            .post_with_retry("/nli", &serde_json::json!({ "pairs": pairs }))
            .await?;
        if !response.ok {
            let error = response.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(MlClientError::Nli(error));
        }
        Ok(response.results)
    }

    /// Ask the service to preload models. Failure is logged, not fatal.
    pub async fn warmup(&self) {
        match self
            .post_with_retry::<serde_json::Value>("/warmup", &serde_json::json!({}))
            .await
        {
            Ok(_) => info!("ML service warmup completed"),
            Err(e) => warn!(error = %e, "ML service warmup failed"),
        }
    }
}

impl std::fmt::Debug for MlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlClient")
            .field("base_url", &self.settings.ml.base_url)
            .finish()
    }
}
