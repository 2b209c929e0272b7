// ── Moniteur Engine: Ingestion Pipeline ────────────────────────────────────
// Pulls documents from a source URI, normalizes them into content-addressed
// Document records, chunks, embeds, and upserts into the *building* vector
// index. Jobs run as spawned tasks; callers poll `status(job_id)`.
//
// Failure semantics: per-item failures are recorded and the job continues;
// the job as a whole fails only past `MAX_ITEM_FAILURE_RATIO`. Retriable
// embed errors requeue the item up to 3 times.

pub mod chunker;

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::atoms::constants::{INGEST_ITEM_MAX_RETRIES, MAX_ITEM_FAILURE_RATIO};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Chunk, Document, JobState, JobStatus};
use crate::engine::adapters::EmbeddingProvider;
use crate::engine::store::Store;

/// How many per-item error strings a job retains for `status()`.
const MAX_RECORDED_ERRORS: usize = 20;

/// Hex SHA-256, truncated to 32 chars; plenty for identity, short enough
/// to read in logs.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]); // separator so ("ab","c") ≠ ("a","bc")
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..32].to_string()
}

/// Deterministic document id: same source + same content → same id.
pub fn document_id(source_uri: &str, content: &str) -> String {
    content_hash(&["doc", source_uri, content])
}

/// Deterministic chunk id: stable across re-ingestion of identical content
/// under the same embed_version.
pub fn chunk_id(document_id: &str, embed_version: &str, ordinal: u32, text: &str) -> String {
    content_hash(&["chunk", document_id, embed_version, &ordinal.to_string(), text])
}

/// A raw item pulled from a source before normalization.
struct RawItem {
    source_uri: String,
    content: String,
    doc_type: String,
    related_node: Option<String>,
}

pub struct Ingestor {
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    jobs: Mutex<HashMap<String, JobStatus>>,
    embed_version: String,
    /// Client for https:// sources (documents, not adapters).
    fetch_client: reqwest::Client,
}

impl Ingestor {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn EmbeddingProvider>, embed_version: &str) -> Self {
        Self {
            store,
            embedder,
            jobs: Mutex::new(HashMap::new()),
            embed_version: embed_version.to_string(),
            fetch_client: crate::engine::http::build_client(std::time::Duration::from_secs(30)),
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().get(job_id).cloned()
    }

    /// Register a queued job and return its id. The caller spawns `run`.
    pub fn register(&self, source_uri: &str) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let status = JobStatus {
            job_id: job_id.clone(),
            source_uri: source_uri.to_string(),
            state: JobState::Queued,
            total_items: 0,
            succeeded_items: 0,
            failed_items: 0,
            errors: vec![],
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
        };
        self.jobs.lock().insert(job_id.clone(), status);
        job_id
    }

    fn update_job(&self, job_id: &str, f: impl FnOnce(&mut JobStatus)) {
        if let Some(job) = self.jobs.lock().get_mut(job_id) {
            f(job);
        }
    }

    /// Execute a registered job against the given building index.
    /// `shutdown` stops the job between items; committed writes remain.
    pub async fn run(
        &self,
        job_id: &str,
        source_uri: &str,
        index_name: &str,
        shutdown: &AtomicBool,
    ) {
        self.update_job(job_id, |j| j.state = JobState::Running);

        let items = match self.resolve_source(source_uri).await {
            Ok(items) => items,
            Err(e) => {
                warn!("[ingest] Source {} unresolvable: {}", source_uri, e);
                self.update_job(job_id, |j| {
                    j.state = JobState::Failed;
                    j.errors.push(format!("source: {}", e));
                    j.finished_at = Some(Utc::now().to_rfc3339());
                });
                return;
            }
        };

        let total = items.len() as u32;
        self.update_job(job_id, |j| j.total_items = total);
        info!("[ingest] Job {}: {} item(s) from {}", &job_id[..8], total, source_uri);

        let mut succeeded = 0u32;
        let mut failed = 0u32;
        for item in items {
            if shutdown.load(Ordering::Relaxed) {
                self.update_job(job_id, |j| {
                    j.state = JobState::Failed;
                    j.errors.push("cancelled by shutdown".into());
                    j.finished_at = Some(Utc::now().to_rfc3339());
                });
                return;
            }

            match self.ingest_item(&item, index_name).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    warn!("[ingest] Item {} failed: {}", item.source_uri, e);
                    self.update_job(job_id, |j| {
                        if j.errors.len() < MAX_RECORDED_ERRORS {
                            j.errors.push(format!("{}: {}", item.source_uri, e));
                        }
                    });
                }
            }
            self.update_job(job_id, |j| {
                j.succeeded_items = succeeded;
                j.failed_items = failed;
            });
        }

        let ratio = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
        let final_state = if ratio > MAX_ITEM_FAILURE_RATIO {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        self.update_job(job_id, |j| {
            j.state = final_state;
            j.finished_at = Some(Utc::now().to_rfc3339());
        });
        info!(
            "[ingest] Job {} finished: {:?} ({}/{} ok)",
            &job_id[..8],
            final_state,
            succeeded,
            total
        );
    }

    /// Normalize one raw item into a Document and index all of its chunks.
    /// Retriable embed failures requeue the chunk up to 3 times.
    async fn ingest_item(&self, item: &RawItem, index_name: &str) -> EngineResult<()> {
        let doc_id = document_id(&item.source_uri, &item.content);
        let doc = Document {
            id: doc_id.clone(),
            source_uri: item.source_uri.clone(),
            content: item.content.clone(),
            doc_type: item.doc_type.clone(),
            related_node: item.related_node.clone(),
            language: "en".into(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.upsert_document(&doc)?;

        for (ordinal, text) in chunker::chunk_text(&item.content).into_iter().enumerate() {
            let ordinal = ordinal as u32;
            let cid = chunk_id(&doc_id, &self.embed_version, ordinal, &text);
            let chunk = Chunk {
                id: cid.clone(),
                document_id: doc_id.clone(),
                ordinal,
                text: text.clone(),
                token_count: chunker::estimate_tokens(&text),
                embed_version: self.embed_version.clone(),
            };

            let vector = self.embed_with_requeue(&text).await?;
            self.store.upsert_chunk(&chunk)?;
            self.store.upsert_embedding(
                index_name,
                &cid,
                self.embedder.model_id(),
                &self.embed_version,
                &vector,
            )?;
        }
        Ok(())
    }

    async fn embed_with_requeue(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut last = EngineError::transient("embed: not attempted");
        for attempt in 0..=INGEST_ITEM_MAX_RETRIES {
            match self.embedder.embed(text).await {
                Ok(v) => return Ok(v),
                Err(e) if e.retriable() && attempt < INGEST_ITEM_MAX_RETRIES => {
                    warn!("[ingest] Embed retry {}/{}: {}", attempt + 1, INGEST_ITEM_MAX_RETRIES, e);
                    last = e;
                    tokio::time::sleep(std::time::Duration::from_millis(250 * (attempt as u64 + 1)))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    // ── Source resolution ──────────────────────────────────────────────────

    async fn resolve_source(&self, source_uri: &str) -> EngineResult<Vec<RawItem>> {
        if let Some(path) = source_uri.strip_prefix("file://") {
            return self.resolve_file(path);
        }
        if source_uri.starts_with("https://") || source_uri.starts_with("http://") {
            return self.resolve_http(source_uri).await;
        }
        if source_uri == "decisions://recent" {
            return self.resolve_recent_decisions();
        }
        Err(EngineError::invalid(format!("unsupported source uri '{}'", source_uri)))
    }

    fn resolve_file(&self, path: &str) -> EngineResult<Vec<RawItem>> {
        let meta = std::fs::metadata(path)
            .map_err(|_| EngineError::not_found(format!("no such path: {}", path)))?;
        let mut items = Vec::new();
        if meta.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let p = entry.path();
                let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
                if !matches!(ext, "md" | "txt" | "json") {
                    continue;
                }
                if let Ok(content) = std::fs::read_to_string(&p) {
                    items.push(RawItem {
                        source_uri: format!("file://{}", p.display()),
                        content,
                        doc_type: "node_doc".into(),
                        related_node: None,
                    });
                }
            }
        } else {
            let content = std::fs::read_to_string(path)?;
            items.push(RawItem {
                source_uri: format!("file://{}", path),
                content,
                doc_type: "node_doc".into(),
                related_node: None,
            });
        }
        Ok(items)
    }

    async fn resolve_http(&self, url: &str) -> EngineResult<Vec<RawItem>> {
        let resp = self.fetch_client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::transient(format!(
                "fetch {}: HTTP {}",
                url,
                resp.status().as_u16()
            )));
        }
        let content = resp.text().await?;
        Ok(vec![RawItem {
            source_uri: url.to_string(),
            content,
            doc_type: "network_doc".into(),
            related_node: None,
        }])
    }

    /// Re-ingest the rationale of recent decisions so future retrieval can
    /// cite what the engine did and why.
    fn resolve_recent_decisions(&self) -> EngineResult<Vec<RawItem>> {
        let since = (Utc::now() - chrono::Duration::days(30)).to_rfc3339();
        // One document per node; content is the concatenated rationales.
        let mut per_node: HashMap<String, Vec<String>> = HashMap::new();
        for user in self.store.report_enabled_users()? {
            let Some(pubkey) = user.lightning_pubkey else { continue };
            for d in self.store.decisions_for_node_since(&pubkey, &since)? {
                per_node.entry(pubkey.clone()).or_default().push(format!(
                    "[{}] {} ({}): {}",
                    d.created_at,
                    d.decision_type.as_str(),
                    d.status.as_str(),
                    d.rationale_text
                ));
            }
        }
        Ok(per_node
            .into_iter()
            .map(|(node, lines)| RawItem {
                source_uri: format!("decisions://recent/{}", node),
                content: lines.join("\n"),
                doc_type: "decision".into(),
                related_node: Some(node),
            })
            .collect())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
