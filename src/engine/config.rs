// ── Moniteur Engine: Configuration ─────────────────────────────────────────
//
// One typed configuration object, loaded once at process start and validated
// before anything else is constructed. Every section has serde defaults so a
// partial TOML file works, but unknown keys are rejected; a typo in an
// operator's config is a startup error, not a silently ignored knob.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::atoms::error::{EngineError, EngineResult};

// ── Sections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1".into(), port: 8480 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// UTC wall-clock fire time.
    pub hour: u8,
    pub minute: u8,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub per_report_timeout_s: u64,
    pub graceful_timeout_s: u64,
    /// Base of the per-user retry backoff (30s × 2^(k−1)).
    pub retry_base_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            hour: 6,
            minute: 0,
            max_concurrent: 10,
            max_retries: 3,
            per_report_timeout_s: 300,
            graceful_timeout_s: 60,
            retry_base_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeuristicWeights {
    pub centrality: f64,
    pub capacity: f64,
    pub reputation: f64,
    pub fees: f64,
    pub uptime: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self { centrality: 0.4, capacity: 0.2, reputation: 0.2, fees: 0.1, uptime: 0.1 }
    }
}

impl HeuristicWeights {
    pub fn sum(&self) -> f64 {
        self.centrality + self.capacity + self.reputation + self.fees + self.uptime
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeuristicConfig {
    pub weights: HeuristicWeights,
    /// Fee decisions below this confidence are suppressed.
    pub confidence_threshold: f64,
    /// Minimum peer score for an open_channel recommendation.
    pub peer_score_threshold: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            weights: HeuristicWeights::default(),
            confidence_threshold: 0.6,
            peer_score_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub k: usize,
    pub cache_ttl_s: u64,
    pub answer_cache_ttl_s: u64,
    /// Weight of the vector leg in rank fusion ([0,1]; lexical gets 1−w).
    pub vector_weight: f64,
    pub timeout_s: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: 8, cache_ttl_s: 3_600, answer_cache_ttl_s: 3_600, vector_weight: 0.5, timeout_s: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_s: u64,
    pub reset_timeout_s: u64,
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, failure_window_s: 60, reset_timeout_s: 30, half_open_max_probes: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model_id: String,
    /// Embed version tag; participates in chunk ids, index names, and every
    /// dependent cache key. Bump it to trigger a full reindex.
    pub version: String,
    pub dim: usize,
    pub timeout_s: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model_id: "nomic-embed-text".into(),
            version: "v1".into(),
            dim: 768,
            timeout_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    pub base_url: String,
    pub model_id: String,
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model_id: "llama3.1:8b".into(),
            timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub base_url: String,
    pub timeout_s: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:9735".into(), timeout_s: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReasoningConfig {
    /// Maximum retrieval hits included in a prompt.
    pub max_hits: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self { max_hits: 6 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_open_per_run: usize,
    pub max_attempts_per_day: u32,
    /// Concurrent decision applications per node (same-channel decisions
    /// are always serialized regardless).
    pub max_apply_per_node: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_open_per_run: 3, max_attempts_per_day: 3, max_apply_per_node: 4 }
    }
}

// ── Root ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Decisions are produced and stored but never dispatched while true.
    pub dry_run: bool,
    /// Directory for the SQLite store. Empty → platform data dir.
    pub data_dir: String,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub heuristic: HeuristicConfig,
    pub retrieval: RetrievalConfig,
    pub breaker: BreakerConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub node_data: EndpointConfig,
    pub node_control: EndpointConfig,
    pub reasoning: ReasoningConfig,
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dry_run: true,
            data_dir: String::new(),
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            heuristic: HeuristicConfig::default(),
            retrieval: RetrievalConfig::default(),
            breaker: BreakerConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            node_data: EndpointConfig::default(),
            node_control: EndpointConfig::default(),
            reasoning: ReasoningConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or defaults when the file does not exist.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            Self::from_toml(&raw)?
        } else {
            log::info!("[config] {} not found — using defaults", path.display());
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> EngineResult<Self> {
        toml::from_str(raw).map_err(|e| EngineError::invalid(format!("config: {}", e)))
    }

    /// Resolved path for the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        let dir = if self.data_dir.is_empty() {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("moniteur")
        } else {
            PathBuf::from(&self.data_dir)
        };
        dir.join("moniteur.db")
    }

    /// Structural validation. Runs once at load; nothing downstream
    /// re-checks these.
    pub fn validate(&self) -> EngineResult<()> {
        let w = &self.heuristic.weights;
        if (w.sum() - 1.0).abs() >= 1e-9 {
            return Err(EngineError::invalid(format!(
                "heuristic.weights must sum to 1.0 (got {})",
                w.sum()
            )));
        }
        for (name, v) in [
            ("heuristic.weights.centrality", w.centrality),
            ("heuristic.weights.capacity", w.capacity),
            ("heuristic.weights.reputation", w.reputation),
            ("heuristic.weights.fees", w.fees),
            ("heuristic.weights.uptime", w.uptime),
            ("heuristic.confidence_threshold", self.heuristic.confidence_threshold),
            ("heuristic.peer_score_threshold", self.heuristic.peer_score_threshold),
            ("retrieval.vector_weight", self.retrieval.vector_weight),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::invalid(format!("{} = {} outside [0,1]", name, v)));
            }
        }
        if self.scheduler.hour > 23 {
            return Err(EngineError::invalid("scheduler.hour must be 0..=23"));
        }
        if self.scheduler.minute > 59 {
            return Err(EngineError::invalid("scheduler.minute must be 0..=59"));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(EngineError::invalid("scheduler.max_concurrent must be ≥ 1"));
        }
        if self.retrieval.k == 0 {
            return Err(EngineError::invalid("retrieval.k must be ≥ 1"));
        }
        if self.embedding.dim == 0 {
            return Err(EngineError::invalid("embedding.dim must be ≥ 1"));
        }
        if self.embedding.version.is_empty()
            || self.embedding.version.contains(':')
            || self.embedding.version.contains('*')
        {
            // The version tag is spliced into cache keys and index names.
            return Err(EngineError::invalid("embedding.version must be a plain tag"));
        }
        if self.limits.max_apply_per_node == 0 {
            return Err(EngineError::invalid("limits.max_apply_per_node must be ≥ 1"));
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!((HeuristicWeights::default().sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_toml_merges_over_defaults() {
        let cfg = Config::from_toml(
            r#"
            dry_run = false

            [scheduler]
            hour = 4
            minute = 30
            "#,
        )
        .unwrap();
        assert!(!cfg.dry_run);
        assert_eq!(cfg.scheduler.hour, 4);
        assert_eq!(cfg.scheduler.minute, 30);
        assert_eq!(cfg.scheduler.max_concurrent, 10); // untouched default
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml("[scheduler]\nhuor = 4\n").unwrap_err();
        assert!(err.to_string().contains("huor"));
    }

    #[test]
    fn bad_weight_sum_fails_validation() {
        let cfg = Config::from_toml(
            r#"
            [heuristic.weights]
            centrality = 0.5
            capacity = 0.5
            reputation = 0.5
            fees = 0.0
            uptime = 0.0
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_hour_fails_validation() {
        let mut cfg = Config::default();
        cfg.scheduler.hour = 24;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn embed_version_must_be_plain() {
        let mut cfg = Config::default();
        cfg.embedding.version = "v1:*".into();
        assert!(cfg.validate().is_err());
    }
}
