// ── Moniteur Engine: External Adapters ─────────────────────────────────────
// Typed clients for every external collaborator: node-data provider,
// node-control daemon, LLM, and embedding service. The engine only ever
// sees the traits below (held as Arc<dyn …>), so the test suites swap in
// mocks without touching engine code.
//
// Adapter rules (enforced here, nowhere else):
//   • per-call timeout (client-level, from config)
//   • retries with backoff + jitter, only on transient failures
//   • per-target circuit breaker with half-open probes
//   • error mapping into the seven engine kinds at this boundary
//   • request / error / latency metrics labelled by target

pub mod embedding;
pub mod llm;
pub mod node_control;
pub mod node_data;

pub use embedding::HttpEmbeddingProvider;
pub use llm::HttpLlmProvider;
pub use node_control::HttpNodeControl;
pub use node_data::HttpNodeDataProvider;

use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChannelPolicy, ChannelState, NodeSnapshot};
use crate::engine::http::{
    is_retryable_status, parse_retry_after, retry_delay, Admission, CircuitBreaker, MAX_RETRIES,
};
use crate::engine::metrics::Metrics;

// ── Traits ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait NodeDataProvider: Send + Sync {
    async fn fetch_node_snapshot(&self, node_pubkey: &str) -> EngineResult<NodeSnapshot>;
    async fn fetch_channels(&self, node_pubkey: &str) -> EngineResult<Vec<ChannelState>>;
}

#[async_trait]
pub trait NodeControl: Send + Sync {
    /// `idempotency_key` is the decision id; the daemon deduplicates on it,
    /// so retried dispatches are safe.
    async fn open_channel(
        &self,
        idempotency_key: &str,
        peer_pubkey: &str,
        amount_sat: u64,
    ) -> EngineResult<()>;

    async fn close_channel(&self, idempotency_key: &str, channel_id: &str) -> EngineResult<()>;

    async fn update_policy(
        &self,
        idempotency_key: &str,
        channel_id: &str,
        policy: &ChannelPolicy,
    ) -> EngineResult<()>;
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One-shot completion; the prompt carries its own output-format
    /// instructions. Returns the raw model text.
    async fn complete(&self, prompt: &str) -> EngineResult<String>;

    fn model_id(&self) -> &str;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;

    fn model_id(&self) -> &str;
}

// ── Shared transport ───────────────────────────────────────────────────────

/// Everything an HTTP adapter needs to make one guarded call: the shared
/// client, its breaker, and the metrics registry.
pub struct Transport {
    pub client: reqwest::Client,
    pub target: &'static str,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
}

impl Transport {
    /// Issue a request with retry + breaker + metrics. `make` is called once
    /// per attempt so bodies and headers are rebuilt fresh.
    ///
    /// Success is any 2xx; the body is parsed as JSON (empty body → null).
    pub async fn request_json(
        &self,
        make: impl Fn() -> reqwest::RequestBuilder,
    ) -> EngineResult<Value> {
        // Breaker gate; open circuits fail fast without burning a request.
        let admission = match self.breaker.admit() {
            Ok(a) => a,
            Err(cooldown_secs) => {
                self.metrics.record_external_error(self.target, "unavailable");
                self.publish_breaker_state();
                return Err(EngineError::Unavailable(format!(
                    "{}: circuit open, retry in {}s",
                    self.target, cooldown_secs
                )));
            }
        };

        match admission {
            // Half-open: exactly one attempt, outcome reported to the gate.
            Admission::Probe(permit) => {
                let outcome = self.attempt(&make).await.map_err(|(e, _)| e);
                // A permanent 4xx still proves the target is reachable;
                // only availability failures re-open the circuit.
                let target_up = match &outcome {
                    Ok(_) => true,
                    Err(e) => !e.retriable(),
                };
                self.breaker.finish_probe(permit, target_up);
                self.publish_breaker_state();
                outcome
            }
            Admission::Closed => {
                let mut retry_after: Option<u64> = None;
                let mut last_err = EngineError::transient(format!("{}: no attempt made", self.target));
                for attempt in 0..=MAX_RETRIES {
                    if attempt > 0 {
                        let delay = retry_delay(attempt - 1, retry_after.take()).await;
                        warn!(
                            "[{}] retry {}/{} after {}ms",
                            self.target,
                            attempt,
                            MAX_RETRIES,
                            delay.as_millis()
                        );
                    }
                    match self.attempt(&make).await {
                        Ok(value) => {
                            self.breaker.record_success();
                            self.publish_breaker_state();
                            return Ok(value);
                        }
                        Err((err, server_retry_after)) => {
                            retry_after = server_retry_after;
                            let retriable = err.retriable();
                            if retriable {
                                // Only availability failures count toward the
                                // breaker; a 4xx is our fault, not the target's.
                                self.breaker.record_failure();
                            }
                            self.publish_breaker_state();
                            last_err = err;
                            if !retriable {
                                break;
                            }
                        }
                    }
                }
                Err(last_err)
            }
        }
    }

    fn publish_breaker_state(&self) {
        self.metrics
            .set_breaker_state(self.target, self.breaker.state() as u8);
    }

    /// One request/response cycle. Errors carry the server's Retry-After
    /// (seconds) when it sent one.
    async fn attempt(
        &self,
        make: &impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Value, (EngineError, Option<u64>)> {
        let start = Instant::now();
        let response = make().send().await;
        self.metrics
            .record_external_call(self.target, start.elapsed().as_secs_f64());

        let resp = match response {
            Ok(r) => r,
            Err(e) => {
                let err: EngineError = e.into();
                self.metrics.record_external_error(self.target, err.kind().as_str());
                return Err((err, None));
            }
        };

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| {
                let err =
                    EngineError::Permanent(format!("{}: bad response body: {}", self.target, e));
                self.metrics.record_external_error(self.target, err.kind().as_str());
                (err, None)
            });
        }

        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        let err = classify_status(self.target, status, &body);
        self.metrics.record_external_error(self.target, err.kind().as_str());
        Err((err, retry_after))
    }
}

/// Map an HTTP status + body into an engine error kind.
fn classify_status(target: &str, status: u16, body: &str) -> EngineError {
    let detail = format!("{}: HTTP {} — {}", target, status, truncate(body, 200));
    if is_retryable_status(status) {
        EngineError::Transient(detail)
    } else {
        EngineError::Permanent(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
