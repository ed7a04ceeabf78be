//! Embedding capability seam and the HTTP embedding-deployment client.

use crate::config::Deployment;
use crate::error::{LlmError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Batch embedding capability. The retrieval index records the vector
/// dimension on first write and rejects writes of a different dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Azure-OpenAI-style embedding deployment client.
pub struct AzureEmbedder {
    deployment: Deployment,
    client: reqwest::Client,
}

impl AzureEmbedder {
    pub fn new(deployment: Deployment, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { deployment, client }
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            self.deployment.endpoint.trim_end_matches('/'),
            self.deployment.deployment,
            self.deployment.api_version,
        )
    }
}

#[async_trait]
impl Embedder for AzureEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.deployment.api_key)
            .json(&serde_json::json!({ "input": texts }))
            .send()
            .await
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::EmbeddingFailed(format!("{status}: {text}")).into());
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::EmbeddingFailed(e.to_string()))?;

        let data = payload["data"]
            .as_array()
            .ok_or_else(|| LlmError::EmbeddingFailed("missing data array".to_string()))?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item["embedding"]
                .as_array()
                .ok_or_else(|| LlmError::EmbeddingFailed("missing embedding".to_string()))?;
            vectors.push(
                embedding
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }

        if vectors.len() != texts.len() {
            return Err(LlmError::EmbeddingFailed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            ))
            .into());
        }

        Ok(vectors)
    }
}
