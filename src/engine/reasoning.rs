// ── Moniteur Engine: Reasoning Service ─────────────────────────────────────
// Composes a prompt from retrieved context + the live node snapshot, calls
// the LLM, and parses the reply against the expected JSON shape. One
// "repair" retry on parse failure, then `Permanent`. Outputs are cached by
// (retrieval fingerprint, model_id, prompt_version, task).
//
// This service never takes decisions and never writes state other than the
// answer cache. The prompt asks for observations and candidates; numeric
// fee targets are the decision engine's job.

use log::{info, warn};
use std::sync::Arc;

use crate::atoms::constants::ANSWER_CACHE_PREFIX;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Hit, NodeSnapshot, ReasoningOutput, ReasoningTask};
use crate::engine::adapters::LlmProvider;
use crate::engine::metrics::Metrics;
use crate::engine::store::Store;

/// Version tag of the prompt templates below. Participates in every answer
/// cache key; bump on any template change.
pub const PROMPT_VERSION: &str = "v1";

/// The JSON shape the model must produce, spelled out in the prompt.
const OUTPUT_SCHEMA: &str = r#"{
  "summary": "one-paragraph assessment",
  "findings": ["short factual observation", "..."],
  "candidate_peers": [{"pubkey": "hex", "alias": "name", "rationale": "why"}],
  "channel_notes": [{"channel_id": "id", "observation": "what stands out"}]
}"#;

fn task_instruction(task: ReasoningTask) -> &'static str {
    match task {
        ReasoningTask::DailyReport => {
            "Write the daily operational assessment of this node: overall health, \
             liquidity posture, and routing performance. Put the narrative in \
             `summary` and the notable facts in `findings`."
        }
        ReasoningTask::FeeRecommendation => {
            "Assess the fee positioning of this node's channels against the \
             retrieved context. For each channel that looks mispriced, add a \
             `channel_notes` entry describing the imbalance or missed revenue. \
             Do NOT propose numeric fee rates — describe observations only."
        }
        ReasoningTask::ChannelRecommendation => {
            "From the retrieved context, list peers this node should consider \
             opening channels to, as `candidate_peers` with a one-line rationale \
             each. Exclude peers it is already connected to."
        }
    }
}

/// Build the full prompt for one reasoning call.
pub fn build_prompt(
    task: ReasoningTask,
    snapshot: &NodeSnapshot,
    hits: &[Hit],
    max_hits: usize,
) -> String {
    let mut context = String::new();
    for (i, hit) in hits.iter().take(max_hits).enumerate() {
        context.push_str(&format!(
            "--- context {} (source: {}, type: {}) ---\n{}\n",
            i + 1,
            hit.source_uri,
            hit.doc_type,
            hit.text
        ));
    }

    format!(
        "You are the analysis engine of a Lightning node optimization service.\n\
         Task: {task}\n\n\
         Node snapshot:\n{snapshot}\n\n\
         Retrieved context:\n{context}\n\
         Respond with ONLY a JSON object of exactly this shape:\n{schema}\n",
        task = task_instruction(task),
        snapshot = serde_json::to_string_pretty(snapshot).unwrap_or_default(),
        context = context,
        schema = OUTPUT_SCHEMA,
    )
}

/// Pull the first JSON object out of a model reply; tolerates code fences
/// and prose around the payload, nothing more.
pub fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&reply[start..=end])
}

pub fn parse_output(reply: &str) -> EngineResult<ReasoningOutput> {
    let json = extract_json(reply)
        .ok_or_else(|| EngineError::invalid("reasoning: reply contains no JSON object"))?;
    serde_json::from_str::<ReasoningOutput>(json)
        .map_err(|e| EngineError::invalid(format!("reasoning: schema mismatch: {}", e)))
}

pub struct ReasoningService {
    llm: Arc<dyn LlmProvider>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    max_hits: usize,
    answer_cache_ttl_s: u64,
}

impl ReasoningService {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        max_hits: usize,
        answer_cache_ttl_s: u64,
    ) -> Self {
        Self { llm, store, metrics, max_hits, answer_cache_ttl_s }
    }

    /// `cache_scope` is the retrieval service's "{embed_version}:{fingerprint}"
    /// pair; None (no alias yet) disables caching for the call.
    pub async fn reason(
        &self,
        snapshot: &NodeSnapshot,
        hits: &[Hit],
        task: ReasoningTask,
        cache_scope: Option<&str>,
    ) -> EngineResult<ReasoningOutput> {
        // Empty corpus short-circuit: deterministic, no model call.
        if hits.is_empty() {
            return Ok(ReasoningOutput::empty_context());
        }

        let cache_key = cache_scope.map(|scope| {
            format!(
                "{}:{}:{}:{}:{}",
                ANSWER_CACHE_PREFIX,
                scope,
                self.llm.model_id(),
                PROMPT_VERSION,
                task.as_str()
            )
        });

        if let Some(key) = &cache_key {
            if let Some(cached) = self.store.cache_get(key)? {
                if let Ok(output) = serde_json::from_str::<ReasoningOutput>(&cached) {
                    self.metrics.record_cache("answer", true);
                    return Ok(output);
                }
            }
            self.metrics.record_cache("answer", false);
        }

        let prompt = build_prompt(task, snapshot, hits, self.max_hits);
        let reply = self.llm.complete(&prompt).await?;

        let output = match parse_output(&reply) {
            Ok(output) => output,
            Err(first_err) => {
                // One repair round: feed the broken reply back with the schema.
                warn!("[reasoning] Parse failed ({}) — attempting repair", first_err);
                let repair_prompt = format!(
                    "Your previous reply could not be parsed: {err}\n\
                     Previous reply:\n{reply}\n\n\
                     Respond again with ONLY a valid JSON object of exactly this \
                     shape:\n{schema}\n",
                    err = first_err,
                    reply = reply,
                    schema = OUTPUT_SCHEMA,
                );
                let repaired = self.llm.complete(&repair_prompt).await?;
                parse_output(&repaired).map_err(|e| {
                    EngineError::Permanent(format!("reasoning: repair failed: {}", e))
                })?
            }
        };

        if let Some(key) = &cache_key {
            self.store
                .cache_set(key, &serde_json::to_string(&output)?, self.answer_cache_ttl_s)?;
        }
        info!(
            "[reasoning] {} for {}: {} finding(s), {} candidate(s)",
            task.as_str(),
            snapshot.node_pubkey,
            output.findings.len(),
            output.candidate_peers.len()
        );
        Ok(output)
    }

    /// Free-form answer over retrieved context for the RAG query endpoint.
    /// No node snapshot, no schema; a plain grounded reply, cached under
    /// the same scope convention as task outputs.
    pub async fn answer(
        &self,
        query: &str,
        hits: &[Hit],
        cache_scope: Option<&str>,
    ) -> EngineResult<String> {
        if hits.is_empty() {
            return Ok("No indexed context is available for this query.".into());
        }

        let cache_key = cache_scope.map(|scope| {
            format!(
                "{}:{}:{}:{}:qa",
                ANSWER_CACHE_PREFIX,
                scope,
                self.llm.model_id(),
                PROMPT_VERSION
            )
        });
        if let Some(key) = &cache_key {
            if let Some(cached) = self.store.cache_get(key)? {
                self.metrics.record_cache("answer", true);
                return Ok(cached);
            }
            self.metrics.record_cache("answer", false);
        }

        let mut context = String::new();
        for (i, hit) in hits.iter().take(self.max_hits).enumerate() {
            context.push_str(&format!("--- context {} ---\n{}\n", i + 1, hit.text));
        }
        let prompt = format!(
            "Answer the question using ONLY the context below. If the context \
             does not contain the answer, say so.\n\nQuestion: {}\n\n{}",
            query, context
        );
        let reply = self.llm.complete(&prompt).await?;

        if let Some(key) = &cache_key {
            self.store.cache_set(key, &reply, self.answer_cache_ttl_s)?;
        }
        Ok(reply)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::FeeStats;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted LLM: pops replies front-to-back; panics when exhausted.
    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                calls: Mutex::new(0),
            }
        }
        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(&self, _prompt: &str) -> EngineResult<String> {
            *self.calls.lock() += 1;
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(EngineError::permanent("script exhausted"));
            }
            Ok(replies.remove(0))
        }
        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn snapshot() -> NodeSnapshot {
        NodeSnapshot {
            node_pubkey: "02abc".into(),
            captured_at: "2026-07-01T00:00:00Z".into(),
            capacity_sat: 10_000_000,
            num_channels_active: 5,
            num_channels_total: 6,
            local_balance_sat: 4_000_000,
            remote_balance_sat: 5_000_000,
            centrality_score: 0.4,
            routing_success_rate: 0.85,
            reputation_score: 0.7,
            uptime_ratio: 0.99,
            fee_stats: FeeStats::default(),
        }
    }

    fn one_hit() -> Vec<Hit> {
        vec![Hit {
            chunk_id: "c1".into(),
            document_id: "d1".into(),
            ordinal: 0,
            text: "peers with high centrality forward more".into(),
            score: 0.9,
            doc_type: "node_doc".into(),
            related_node: None,
            language: "en".into(),
            source_uri: "file:///x".into(),
        }]
    }

    const GOOD_REPLY: &str = r#"Here you go:
    {"summary": "healthy", "findings": ["ok"], "candidate_peers": [], "channel_notes": []}"#;

    fn service(llm: Arc<ScriptedLlm>) -> ReasoningService {
        ReasoningService::new(
            llm,
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(Metrics::new()),
            6,
            3600,
        )
    }

    #[tokio::test]
    async fn empty_hits_short_circuit_without_llm_call() {
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let svc = service(llm.clone());
        let out = svc
            .reason(&snapshot(), &[], ReasoningTask::DailyReport, None)
            .await
            .unwrap();
        assert!(out.no_context);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn good_reply_parses_with_surrounding_prose() {
        let llm = Arc::new(ScriptedLlm::new(&[GOOD_REPLY]));
        let svc = service(llm.clone());
        let out = svc
            .reason(&snapshot(), &one_hit(), ReasoningTask::DailyReport, None)
            .await
            .unwrap();
        assert_eq!(out.summary, "healthy");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn broken_reply_is_repaired_once() {
        let llm = Arc::new(ScriptedLlm::new(&["not json at all", GOOD_REPLY]));
        let svc = service(llm.clone());
        let out = svc
            .reason(&snapshot(), &one_hit(), ReasoningTask::FeeRecommendation, None)
            .await
            .unwrap();
        assert_eq!(out.summary, "healthy");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn second_parse_failure_is_permanent() {
        let llm = Arc::new(ScriptedLlm::new(&["garbage", "{\"still\": garbage"]));
        let svc = service(llm.clone());
        let err = svc
            .reason(&snapshot(), &one_hit(), ReasoningTask::DailyReport, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn answer_cache_prevents_second_call() {
        let llm = Arc::new(ScriptedLlm::new(&[GOOD_REPLY]));
        let svc = service(llm.clone());
        let scope = Some("v1:deadbeef");
        let a = svc
            .reason(&snapshot(), &one_hit(), ReasoningTask::DailyReport, scope)
            .await
            .unwrap();
        let b = svc
            .reason(&snapshot(), &one_hit(), ReasoningTask::DailyReport, scope)
            .await
            .unwrap();
        assert_eq!(a.summary, b.summary);
        assert_eq!(llm.call_count(), 1); // second served from cache
    }

    #[test]
    fn extract_json_tolerates_fences() {
        let reply = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json(reply), Some("{\"a\": 1}"));
        assert!(extract_json("no braces here").is_none());
    }

    #[test]
    fn prompt_embeds_snapshot_hits_and_schema() {
        let prompt = build_prompt(ReasoningTask::ChannelRecommendation, &snapshot(), &one_hit(), 6);
        assert!(prompt.contains("02abc"));
        assert!(prompt.contains("high centrality"));
        assert!(prompt.contains("candidate_peers"));
    }

    #[test]
    fn prompt_caps_hits_at_max() {
        let hits: Vec<Hit> = (0..10)
            .map(|i| {
                let mut h = one_hit().remove(0);
                h.text = format!("context body {}", i);
                h
            })
            .collect();
        let prompt = build_prompt(ReasoningTask::DailyReport, &snapshot(), &hits, 3);
        assert!(prompt.contains("context body 2"));
        assert!(!prompt.contains("context body 3"));
    }
}
