// ── Adapter: Embedding Provider ────────────────────────────────────────────
// Calls an Ollama or OpenAI-compatible embedding API. Every returned vector
// is checked against the configured dimension; a model swap that changes
// dimensionality must come through an embed_version bump and reindex, never
// silently.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{EmbeddingProvider, Transport};
use crate::atoms::error::{EngineError, EngineResult};

pub struct HttpEmbeddingProvider {
    transport: Transport,
    base_url: String,
    model_id: String,
    expected_dim: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(transport: Transport, base_url: &str, model_id: &str, expected_dim: usize) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id: model_id.to_string(),
            expected_dim,
        }
    }

    fn extract_vector(value: &Value) -> Option<Vec<f32>> {
        // Ollama /api/embed returns { embeddings: [[f32...]] }; some versions
        // return singular { embedding: [f32...] }; OpenAI-compatible returns
        // { data: [{ embedding: [f32...] }] }.
        let array = value["embeddings"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|e| e.as_array())
            .or_else(|| value["embedding"].as_array())
            .or_else(|| value["data"][0]["embedding"].as_array())?;
        let vec: Vec<f32> = array
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vec.is_empty() {
            None
        } else {
            Some(vec)
        }
    }

    fn check_dim(&self, vec: Vec<f32>) -> EngineResult<Vec<f32>> {
        if vec.len() != self.expected_dim {
            return Err(EngineError::invalid(format!(
                "embedding: model '{}' returned {} dims, config says {}",
                self.model_id,
                vec.len(),
                self.expected_dim
            )));
        }
        Ok(vec)
    }

    async fn embed_ollama(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model_id, "input": text });
        let value = self
            .transport
            .request_json(|| self.transport.client.post(&url).json(&body))
            .await?;
        Self::extract_vector(&value)
            .ok_or_else(|| EngineError::Permanent("embedding: no vector in reply".into()))
    }

    async fn embed_openai(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({ "model": self.model_id, "input": text });
        let value = self
            .transport
            .request_json(|| self.transport.client.post(&url).json(&body))
            .await?;
        Self::extract_vector(&value)
            .ok_or_else(|| EngineError::Permanent("embedding: no vector in reply".into()))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let vec = match self.embed_ollama(text).await {
            Ok(v) => v,
            Err(EngineError::Permanent(_)) => self.embed_openai(text).await?,
            Err(other) => return Err(other),
        };
        self.check_dim(vec)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
