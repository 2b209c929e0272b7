// ── Moniteur Engine: Retrieval Service ─────────────────────────────────────
// Hybrid retrieval over the current alias: cosine similarity on the vector
// leg, FTS5 BM25 on the lexical leg, merged with weighted reciprocal rank
// fusion. Results are cached under a fingerprint of
// (normalized query, embed_version, filters, k) so identical queries within
// the TTL return byte-identical orderings.

use log::warn;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::constants::{RETRIEVAL_CACHE_PREFIX, RETRIEVAL_CANDIDATE_FACTOR, RRF_K};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Hit, RetrievalFilters};
use crate::engine::adapters::EmbeddingProvider;
use crate::engine::config::RetrievalConfig;
use crate::engine::index::IndexManager;
use crate::engine::metrics::Metrics;
use crate::engine::store::Store;

pub struct RetrievalService {
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<IndexManager>,
    metrics: Arc<Metrics>,
    config: RetrievalConfig,
}

/// Lowercase + collapse internal whitespace, so trivially different
/// spellings share a cache fingerprint.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Stable hex fingerprint over the full retrieval input.
pub fn fingerprint(query: &str, embed_version: &str, filters: &RetrievalFilters, k: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0u8]);
    hasher.update(embed_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(filters.canonical().as_bytes());
    hasher.update([0u8]);
    hasher.update(k.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

/// Weighted reciprocal rank fusion over the two ranked candidate lists.
/// Each leg contributes `weight / (60 + rank + 1)` per candidate; ties are
/// broken by (document_id, ordinal) ascending so ordering is deterministic.
pub fn rrf_fuse(vector_hits: &[Hit], lexical_hits: &[Hit], vector_weight: f64, k: usize) -> Vec<Hit> {
    let lexical_weight = 1.0 - vector_weight;
    let mut fused: std::collections::HashMap<String, (Hit, f64)> = std::collections::HashMap::new();

    for (rank, hit) in vector_hits.iter().enumerate() {
        let contribution = vector_weight / (RRF_K + rank as f64 + 1.0);
        fused
            .entry(hit.chunk_id.clone())
            .and_modify(|(_, s)| *s += contribution)
            .or_insert_with(|| (hit.clone(), contribution));
    }
    for (rank, hit) in lexical_hits.iter().enumerate() {
        let contribution = lexical_weight / (RRF_K + rank as f64 + 1.0);
        fused
            .entry(hit.chunk_id.clone())
            .and_modify(|(_, s)| *s += contribution)
            .or_insert_with(|| (hit.clone(), contribution));
    }

    let mut ranked: Vec<(Hit, f64)> = fused.into_values().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (a.0.document_id.as_str(), a.0.ordinal)
                    .cmp(&(b.0.document_id.as_str(), b.0.ordinal))
            })
    });
    ranked.truncate(k);
    ranked
        .into_iter()
        .map(|(mut hit, score)| {
            hit.score = score;
            hit
        })
        .collect()
}

impl RetrievalService {
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<IndexManager>,
        metrics: Arc<Metrics>,
        config: RetrievalConfig,
    ) -> Self {
        Self { store, embedder, index, metrics, config }
    }

    /// Current embed_version as seen through the alias, if any.
    pub fn current_embed_version(&self) -> EngineResult<Option<(String, String)>> {
        let Some(index_name) = self.index.current()? else {
            return Ok(None);
        };
        let Some(meta) = self.store.get_index(&index_name)? else {
            return Ok(None);
        };
        Ok(Some((index_name, meta.embed_version)))
    }

    /// Hybrid retrieval with cache. `k` falls back to the configured value.
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        k: Option<usize>,
    ) -> EngineResult<Vec<Hit>> {
        let k = k.unwrap_or(self.config.k).max(1);
        let deadline = Duration::from_secs(self.config.timeout_s);
        tokio::time::timeout(deadline, self.retrieve_inner(query, filters, k))
            .await
            .map_err(|_| EngineError::Timeout(format!("retrieval exceeded {}s", deadline.as_secs())))?
    }

    async fn retrieve_inner(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        k: usize,
    ) -> EngineResult<Vec<Hit>> {
        // Empty corpus: no alias yet → nothing to retrieve.
        let Some((index_name, embed_version)) = self.current_embed_version()? else {
            return Ok(vec![]);
        };

        let fp = fingerprint(query, &embed_version, filters, k);
        let cache_key = format!("{}:{}:{}", RETRIEVAL_CACHE_PREFIX, embed_version, fp);

        if let Some(cached) = self.store.cache_get(&cache_key)? {
            if let Ok(hits) = serde_json::from_str::<Vec<Hit>>(&cached) {
                self.metrics.record_cache("retrieval", true);
                return Ok(hits);
            }
        }
        self.metrics.record_cache("retrieval", false);

        let candidates = k * RETRIEVAL_CANDIDATE_FACTOR;

        // Vector leg. An embedder outage degrades to lexical-only retrieval
        // rather than failing the caller.
        let vector_hits = match self.embedder.embed(&normalize_query(query)).await {
            Ok(query_vec) => {
                self.store
                    .vector_search(&index_name, &query_vec, filters, candidates)?
            }
            Err(e) => {
                warn!("[retrieval] Query embed failed ({}) — lexical only", e);
                vec![]
            }
        };

        // Lexical leg.
        let lexical_hits =
            self.store
                .lexical_search(query, &embed_version, filters, candidates)?;

        let hits = rrf_fuse(&vector_hits, &lexical_hits, self.config.vector_weight, k);

        self.store
            .cache_set(&cache_key, &serde_json::to_string(&hits)?, self.config.cache_ttl_s)?;
        Ok(hits)
    }

    /// Cache fingerprint for the caller's (query, k) under the live
    /// embed_version; reused by the reasoning answer cache.
    pub fn fingerprint_for(
        &self,
        query: &str,
        filters: &RetrievalFilters,
        k: Option<usize>,
    ) -> EngineResult<Option<String>> {
        let k = k.unwrap_or(self.config.k).max(1);
        Ok(self
            .current_embed_version()?
            .map(|(_, version)| (fingerprint(query, &version, filters, k), version))
            .map(|(fp, version)| format!("{}:{}", version, fp)))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Chunk, Document};
    use async_trait::async_trait;

    /// Two-dimensional toy embedder: "fee"-flavored texts point along x,
    /// everything else along y.
    struct ToyEmbedder;

    #[async_trait]
    impl EmbeddingProvider for ToyEmbedder {
        async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
            if text.contains("fee") {
                Ok(vec![1.0, 0.1])
            } else {
                Ok(vec![0.1, 1.0])
            }
        }
        fn model_id(&self) -> &str {
            "toy"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
            Err(EngineError::transient("embedder down"))
        }
        fn model_id(&self) -> &str {
            "down"
        }
    }

    fn hit(chunk_id: &str, doc: &str, ordinal: u32) -> Hit {
        Hit {
            chunk_id: chunk_id.into(),
            document_id: doc.into(),
            ordinal,
            text: String::new(),
            score: 0.0,
            doc_type: "node_doc".into(),
            related_node: None,
            language: "en".into(),
            source_uri: "file:///x".into(),
        }
    }

    fn service(embedder: Arc<dyn EmbeddingProvider>) -> (RetrievalService, Arc<IndexManager>, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let index = Arc::new(IndexManager::new(store.clone(), "docs"));
        let name = index.begin_reindex("v1").unwrap();
        let svc = RetrievalService::new(
            store,
            embedder,
            index.clone(),
            Arc::new(Metrics::new()),
            RetrievalConfig::default(),
        );
        (svc, index, name)
    }

    fn seed(svc: &RetrievalService, index_name: &str, id: &str, text: &str, vector: &[f32]) {
        let doc = Document {
            id: format!("doc-{}", id),
            source_uri: format!("file:///{}", id),
            content: text.into(),
            doc_type: "node_doc".into(),
            related_node: None,
            language: "en".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        svc.store.upsert_document(&doc).unwrap();
        svc.store
            .upsert_chunk(&Chunk {
                id: id.into(),
                document_id: doc.id.clone(),
                ordinal: 0,
                text: text.into(),
                token_count: 4,
                embed_version: "v1".into(),
            })
            .unwrap();
        svc.store.upsert_embedding(index_name, id, "toy", "v1", vector).unwrap();
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let index = Arc::new(IndexManager::new(store.clone(), "docs"));
        let svc = RetrievalService::new(
            store,
            Arc::new(ToyEmbedder),
            index,
            Arc::new(Metrics::new()),
            RetrievalConfig::default(),
        );
        let hits = svc.retrieve("anything", &RetrievalFilters::default(), None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn hybrid_retrieval_prefers_agreeing_candidates() {
        let (svc, index, name) = service(Arc::new(ToyEmbedder));
        seed(&svc, &name, "c-fee", "channel fee policy tuning", &[1.0, 0.1]);
        seed(&svc, &name, "c-uptime", "node uptime and availability", &[0.1, 1.0]);
        index.finalize(&name).unwrap();

        let hits = svc
            .retrieve("fee policy", &RetrievalFilters::default(), Some(2))
            .await
            .unwrap();
        assert!(!hits.is_empty());
        // "c-fee" wins both legs, so it must rank first.
        assert_eq!(hits[0].chunk_id, "c-fee");
    }

    #[tokio::test]
    async fn repeated_query_is_served_from_cache_with_same_order() {
        let (svc, index, name) = service(Arc::new(ToyEmbedder));
        seed(&svc, &name, "c1", "fee rates and routing", &[1.0, 0.0]);
        seed(&svc, &name, "c2", "fee schedules and peers", &[0.9, 0.2]);
        index.finalize(&name).unwrap();

        let first = svc.retrieve("fee", &RetrievalFilters::default(), Some(2)).await.unwrap();
        // Mutate the corpus; the cached ordering must not change within TTL.
        svc.store.purge_document("doc-c1").unwrap();
        let second = svc.retrieve("fee", &RetrievalFilters::default(), Some(2)).await.unwrap();
        let ids =
            |hits: &[Hit]| hits.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn embedder_outage_degrades_to_lexical() {
        let (svc, index, name) = service(Arc::new(FailingEmbedder));
        seed(&svc, &name, "c1", "routing fees on lightning", &[1.0, 0.0]);
        index.finalize(&name).unwrap();

        let hits = svc
            .retrieve("routing fees", &RetrievalFilters::default(), Some(3))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let f = RetrievalFilters::default();
        let a = fingerprint("Fee  Policy", "v1", &f, 8);
        let b = fingerprint("fee policy", "v1", &f, 8);
        assert_eq!(a, b); // normalization folds case/whitespace
        assert_ne!(a, fingerprint("fee policy", "v2", &f, 8));
        assert_ne!(a, fingerprint("fee policy", "v1", &f, 9));
    }

    #[test]
    fn rrf_ties_break_by_document_then_ordinal() {
        // Identical contributions for all: each appears at rank 0 of one leg.
        let v = vec![hit("b", "docB", 0)];
        let l = vec![hit("a", "docA", 0)];
        let fused = rrf_fuse(&v, &l, 0.5, 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].document_id, "docA");
        assert_eq!(fused[1].document_id, "docB");
    }

    #[test]
    fn rrf_candidate_in_both_legs_outranks_single_leg() {
        let v = vec![hit("x", "doc1", 0), hit("y", "doc2", 0)];
        let l = vec![hit("x", "doc1", 0)];
        let fused = rrf_fuse(&v, &l, 0.5, 10);
        assert_eq!(fused[0].chunk_id, "x");
        assert!(fused[0].score > fused[1].score);
    }
}
