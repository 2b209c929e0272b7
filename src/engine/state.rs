// ── Moniteur Engine: State ─────────────────────────────────────────────────
// Everything with a lifetime lives here, constructed once at startup and
// passed down explicitly; no ambient singletons. The `with_adapters`
// constructor lets the test suites inject mock adapters behind the same
// trait objects the HTTP clients implement.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::error::EngineResult;
use crate::engine::adapters::{
    EmbeddingProvider, HttpEmbeddingProvider, HttpLlmProvider, HttpNodeControl,
    HttpNodeDataProvider, LlmProvider, NodeControl, NodeDataProvider, Transport,
};
use crate::engine::config::Config;
use crate::engine::decisions::DecisionEngine;
use crate::engine::http::{build_client, BreakerRegistry};
use crate::engine::index::IndexManager;
use crate::engine::ingest::Ingestor;
use crate::engine::metrics::Metrics;
use crate::engine::reasoning::ReasoningService;
use crate::engine::reports::ReportGenerator;
use crate::engine::retrieval::RetrievalService;
use crate::engine::scheduler::Scheduler;
use crate::engine::store::Store;

/// The logical vector alias every query resolves through.
pub const VECTOR_ALIAS: &str = "docs";

pub struct EngineState {
    pub config: Config,
    pub store: Arc<Store>,
    pub metrics: Arc<Metrics>,
    pub breakers: Arc<BreakerRegistry>,
    pub index: Arc<IndexManager>,
    pub ingestor: Arc<Ingestor>,
    pub retrieval: Arc<RetrievalService>,
    pub reasoning: Arc<ReasoningService>,
    pub decisions: Arc<DecisionEngine>,
    pub reports: Arc<ReportGenerator>,
    pub scheduler: Arc<Scheduler>,
    /// Set once at shutdown; every loop in the engine checks it.
    pub shutdown: Arc<AtomicBool>,
}

impl EngineState {
    /// Production constructor: opens the store and builds HTTP adapters.
    pub fn new(config: Config) -> EngineResult<Self> {
        let store = Arc::new(Store::open(&config.db_path())?);
        let metrics = Arc::new(Metrics::new());
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.failure_threshold,
            config.breaker.failure_window_s,
            config.breaker.reset_timeout_s,
            config.breaker.half_open_max_probes,
        ));

        let transport = |target: &'static str, timeout_s: u64| Transport {
            client: build_client(Duration::from_secs(timeout_s)),
            target,
            breaker: breakers.get(target),
            metrics: metrics.clone(),
        };

        let node_data: Arc<dyn NodeDataProvider> = Arc::new(HttpNodeDataProvider::new(
            transport("node_data", config.node_data.timeout_s),
            &config.node_data.base_url,
        ));
        let node_control: Arc<dyn NodeControl> = Arc::new(HttpNodeControl::new(
            transport("node_ctl", config.node_control.timeout_s),
            &config.node_control.base_url,
        ));
        let llm: Arc<dyn LlmProvider> = Arc::new(HttpLlmProvider::new(
            transport("llm", config.llm.timeout_s),
            &config.llm.base_url,
            &config.llm.model_id,
        ));
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
            transport("embedding", config.embedding.timeout_s),
            &config.embedding.base_url,
            &config.embedding.model_id,
            config.embedding.dim,
        ));

        Ok(Self::with_adapters(
            config,
            store,
            metrics,
            breakers,
            node_data,
            node_control,
            llm,
            embedder,
        ))
    }

    /// Wire the engine over explicit adapters; the test-suite entry point.
    #[allow(clippy::too_many_arguments)]
    pub fn with_adapters(
        config: Config,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
        breakers: Arc<BreakerRegistry>,
        node_data: Arc<dyn NodeDataProvider>,
        node_control: Arc<dyn NodeControl>,
        llm: Arc<dyn LlmProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let index = Arc::new(IndexManager::new(store.clone(), VECTOR_ALIAS));
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            embedder.clone(),
            &config.embedding.version,
        ));
        let retrieval = Arc::new(RetrievalService::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            metrics.clone(),
            config.retrieval.clone(),
        ));
        let reasoning = Arc::new(ReasoningService::new(
            llm,
            store.clone(),
            metrics.clone(),
            config.reasoning.max_hits,
            config.retrieval.answer_cache_ttl_s,
        ));
        let decisions = Arc::new(DecisionEngine::new(
            store.clone(),
            node_data.clone(),
            node_control,
            metrics.clone(),
            config.heuristic.clone(),
            config.limits.clone(),
            config.dry_run,
        ));
        let reports = Arc::new(ReportGenerator::new(
            store.clone(),
            node_data,
            retrieval.clone(),
            reasoning.clone(),
            decisions.clone(),
            metrics.clone(),
            Duration::from_secs(config.scheduler.per_report_timeout_s),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            reports.clone(),
            metrics.clone(),
            config.scheduler.clone(),
            config.limits.max_attempts_per_day,
            shutdown.clone(),
        ));

        Self {
            config,
            store,
            metrics,
            breakers,
            index,
            ingestor,
            retrieval,
            reasoning,
            decisions,
            reports,
            scheduler,
            shutdown,
        }
    }

    /// Readiness: alias resolvable AND store reachable AND cache reachable.
    pub fn ready(&self) -> bool {
        let alias_ok = matches!(self.index.current(), Ok(Some(_)));
        let store_ok = self.store.ping().is_ok();
        let cache_ok = self.store.cache_get("health:probe").is_ok();
        alias_ok && store_ok && cache_ok
    }

    /// Kick off an ingestion job into the current building index.
    pub fn start_ingest(self: &Arc<Self>, source_uri: &str) -> EngineResult<String> {
        let index_name = self.index.ensure_building(&self.config.embedding.version)?;
        let job_id = self.ingestor.register(source_uri);
        let state = self.clone();
        let job = job_id.clone();
        let uri = source_uri.to_string();
        tokio::spawn(async move {
            state
                .ingestor
                .run(&job, &uri, &index_name, &state.shutdown)
                .await;
        });
        Ok(job_id)
    }

    /// Refresh breaker gauges, then render the registry.
    pub fn render_metrics(&self) -> String {
        for (target, breaker_state) in self.breakers.states() {
            self.metrics.set_breaker_state(&target, breaker_state);
        }
        self.metrics.render()
    }
}
