// ── Adapter: LLM Provider ──────────────────────────────────────────────────
// One-shot, non-streaming completions. Tries the Ollama generate API first
// (the local default), then falls back to the OpenAI-compatible chat
// completions shape so any hosted endpoint works with the same config.

use async_trait::async_trait;
use log::info;
use serde_json::json;

use super::{LlmProvider, Transport};
use crate::atoms::error::{EngineError, EngineResult};

pub struct HttpLlmProvider {
    transport: Transport,
    base_url: String,
    model_id: String,
}

impl HttpLlmProvider {
    pub fn new(transport: Transport, base_url: &str, model_id: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id: model_id.to_string(),
        }
    }

    /// Ollama format: POST /api/generate { model, prompt, stream: false }
    /// → { response: "..." }
    async fn complete_ollama(&self, prompt: &str) -> EngineResult<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": self.model_id,
            "prompt": prompt,
            "stream": false,
        });
        let value = self
            .transport
            .request_json(|| self.transport.client.post(&url).json(&body))
            .await?;
        value["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::Permanent("llm: no 'response' field in reply".into()))
    }

    /// OpenAI-compatible format: POST /v1/chat/completions
    /// → { choices: [{ message: { content } }] }
    async fn complete_openai(&self, prompt: &str) -> EngineResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model_id,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let value = self
            .transport
            .request_json(|| self.transport.client.post(&url).json(&body))
            .await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                EngineError::Permanent("llm: no choices[0].message.content in reply".into())
            })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(&self, prompt: &str) -> EngineResult<String> {
        match self.complete_ollama(prompt).await {
            Ok(text) => Ok(text),
            // The breaker already gated availability; only shape mismatches
            // fall through to the OpenAI-compatible endpoint.
            Err(EngineError::Permanent(first)) => {
                info!("[llm] Ollama shape rejected ({}) — trying OpenAI-compatible endpoint", first);
                self.complete_openai(prompt).await
            }
            Err(other) => Err(other),
        }
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
