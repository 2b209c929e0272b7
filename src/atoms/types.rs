// ── Moniteur Atoms: Pure Data Types ────────────────────────────────────────
// All plain struct/enum definitions with no logic beyond small helpers.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

use serde::{Deserialize, Serialize};

use crate::atoms::error::{EngineError, EngineResult};

// ── Documents & chunks ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub content: String,
    pub doc_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_node: Option<String>,
    pub language: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub token_count: u32,
    pub embed_version: String,
}

// ── Node & channel state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeStats {
    pub avg_fee_rate_ppm: u32,
    pub avg_base_fee_msat: u32,
    /// Routing revenue earned over the trailing 7 days, in msat.
    pub revenue_msat_7d: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_pubkey: String,
    pub captured_at: String,
    pub capacity_sat: u64,
    pub num_channels_active: u32,
    pub num_channels_total: u32,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
    pub centrality_score: f64,
    pub routing_success_rate: f64,
    pub reputation_score: f64,
    pub uptime_ratio: f64,
    pub fee_stats: FeeStats,
}

impl NodeSnapshot {
    /// Boundary validation; adapters reject snapshots that violate the
    /// structural invariants instead of letting them poison the engine.
    pub fn validate(&self) -> EngineResult<()> {
        if self.local_balance_sat + self.remote_balance_sat > self.capacity_sat {
            return Err(EngineError::invalid(format!(
                "snapshot for {}: local+remote balance exceeds capacity",
                self.node_pubkey
            )));
        }
        if self.num_channels_active > self.num_channels_total {
            return Err(EngineError::invalid(format!(
                "snapshot for {}: active channels exceed total",
                self.node_pubkey
            )));
        }
        for (name, v) in [
            ("centrality_score", self.centrality_score),
            ("routing_success_rate", self.routing_success_rate),
            ("reputation_score", self.reputation_score),
            ("uptime_ratio", self.uptime_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::invalid(format!(
                    "snapshot for {}: {} = {} outside [0,1]",
                    self.node_pubkey, name, v
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub base_fee_msat: u32,
    pub fee_rate_ppm: u32,
    pub time_lock_delta: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: String,
    pub node_pubkey: String,
    pub peer_pubkey: String,
    pub capacity_sat: u64,
    pub local_balance_sat: u64,
    pub active: bool,
    pub policy: ChannelPolicy,
    pub last_seen_at: String,
}

// ── Decisions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    OpenChannel,
    CloseChannel,
    UpdateFee,
    Rebalance,
    Noop,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::OpenChannel => "open_channel",
            DecisionType::CloseChannel => "close_channel",
            DecisionType::UpdateFee => "update_fee",
            DecisionType::Rebalance => "rebalance",
            DecisionType::Noop => "noop",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "open_channel" => Ok(DecisionType::OpenChannel),
            "close_channel" => Ok(DecisionType::CloseChannel),
            "update_fee" => Ok(DecisionType::UpdateFee),
            "rebalance" => Ok(DecisionType::Rebalance),
            "noop" => Ok(DecisionType::Noop),
            other => Err(EngineError::invalid(format!("decision type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Applied,
    Rejected,
    RolledBack,
    Failed,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Applied => "applied",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::RolledBack => "rolled_back",
            DecisionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "pending" => Ok(DecisionStatus::Pending),
            "applied" => Ok(DecisionStatus::Applied),
            "rejected" => Ok(DecisionStatus::Rejected),
            "rolled_back" => Ok(DecisionStatus::RolledBack),
            "failed" => Ok(DecisionStatus::Failed),
            other => Err(EngineError::invalid(format!("decision status '{}'", other))),
        }
    }
}

/// The action a decision carries. Also serves as the reversal payload in a
/// rollback entry (an open is reversed by a close, a fee update by the
/// prior policy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionPayload {
    OpenChannel { peer_pubkey: String, amount_sat: u64 },
    CloseChannel { channel_id: String },
    UpdateFee { channel_id: String, policy: ChannelPolicy },
    Rebalance { from_channel: String, to_channel: String, amount_sat: u64 },
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub node_pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub decision_type: DecisionType,
    pub payload: DecisionPayload,
    pub rationale_text: String,
    pub score: f64,
    pub created_at: String,
    pub status: DecisionStatus,
    /// Short machine-readable reason for rejected/failed states
    /// (e.g. "dry_run", "timeout").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub decision_id: String,
    /// State captured immediately before dispatch, as reported by the node
    /// daemon. JSON so each decision type can snapshot what it needs.
    pub prior_state: serde_json::Value,
    pub reversal: DecisionPayload,
    pub created_at: String,
}

// ── Users & reports ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lightning_pubkey: Option<String>,
    pub daily_report_enabled: bool,
    pub timezone: String,
    pub notification_channels: Vec<String>,
    /// When true, decisions from this user's report runs are dispatched to
    /// the node daemon instead of stopping at the dry-run gate.
    pub apply_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Running => "running",
            ReportStatus::Succeeded => "succeeded",
            ReportStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "running" => Ok(ReportStatus::Running),
            "succeeded" => Ok(ReportStatus::Succeeded),
            "failed" => Ok(ReportStatus::Failed),
            other => Err(EngineError::invalid(format!("report status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub report_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub node_pubkey: String,
    /// UTC date, "YYYY-MM-DD".
    pub report_date: String,
    pub generation_status: ReportStatus,
    pub attempt_count: u32,
    pub sections: Vec<ReportSection>,
    pub decisions_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

// ── Retrieval ──────────────────────────────────────────────────────────────

/// A retrieval result: one chunk plus its source metadata and fused score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub score: f64,
    pub doc_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_node: Option<String>,
    pub language: String,
    pub source_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// RFC 3339 timestamp; only documents created strictly after it match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_after: Option<String>,
}

impl RetrievalFilters {
    pub fn is_empty(&self) -> bool {
        self.doc_type.is_none()
            && self.related_node.is_none()
            && self.language.is_none()
            && self.created_after.is_none()
    }

    /// Stable textual form for fingerprinting. Field order is fixed.
    pub fn canonical(&self) -> String {
        format!(
            "type={};node={};lang={};after={}",
            self.doc_type.as_deref().unwrap_or(""),
            self.related_node.as_deref().unwrap_or(""),
            self.language.as_deref().unwrap_or(""),
            self.created_after.as_deref().unwrap_or(""),
        )
    }
}

// ── Reasoning ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningTask {
    DailyReport,
    FeeRecommendation,
    ChannelRecommendation,
}

impl ReasoningTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningTask::DailyReport => "daily_report",
            ReasoningTask::FeeRecommendation => "fee_recommendation",
            ReasoningTask::ChannelRecommendation => "channel_recommendation",
        }
    }
}

/// A peer the reasoning layer suggests connecting to. The decision engine
/// re-scores candidates itself; `rationale` is carried into the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePeer {
    pub pubkey: String,
    #[serde(default)]
    pub alias: String,
    pub rationale: String,
}

/// A per-channel observation from the reasoning layer (never a number;
/// fee targets are computed by the decision engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelNote {
    pub channel_id: String,
    pub observation: String,
}

/// Structured output of one reasoning call. One shape for all tasks; the
/// prompt schema tells the model which fields matter for the task at hand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningOutput {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub candidate_peers: Vec<CandidatePeer>,
    #[serde(default)]
    pub channel_notes: Vec<ChannelNote>,
    /// Set when retrieval produced no context and no model call was made.
    #[serde(default)]
    pub no_context: bool,
}

impl ReasoningOutput {
    /// Deterministic output for an empty corpus: no findings, no candidates.
    pub fn empty_context() -> Self {
        ReasoningOutput {
            summary: "No indexed context was available for this analysis.".into(),
            no_context: true,
            ..Default::default()
        }
    }
}

// ── Ingestion jobs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub source_uri: String,
    pub state: JobState,
    pub total_items: u32,
    pub succeeded_items: u32,
    pub failed_items: u32,
    /// One entry per failed item, capped by the pipeline.
    pub errors: Vec<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

// ── Vector indexes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Building,
    Ready,
    Retired,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Building => "building",
            IndexState::Ready => "ready",
            IndexState::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "building" => Ok(IndexState::Building),
            "ready" => Ok(IndexState::Ready),
            "retired" => Ok(IndexState::Retired),
            other => Err(EngineError::invalid(format!("index state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexMeta {
    pub name: String,
    pub embed_version: String,
    pub state: IndexState,
    pub created_at: String,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> NodeSnapshot {
        NodeSnapshot {
            node_pubkey: "02abc".into(),
            captured_at: "2026-01-01T00:00:00Z".into(),
            capacity_sat: 10_000_000,
            num_channels_active: 8,
            num_channels_total: 10,
            local_balance_sat: 4_000_000,
            remote_balance_sat: 5_000_000,
            centrality_score: 0.4,
            routing_success_rate: 0.9,
            reputation_score: 0.7,
            uptime_ratio: 0.99,
            fee_stats: FeeStats::default(),
        }
    }

    #[test]
    fn snapshot_validates() {
        assert!(snapshot().validate().is_ok());
    }

    #[test]
    fn snapshot_rejects_balance_overflow() {
        let mut s = snapshot();
        s.local_balance_sat = 6_000_000;
        s.remote_balance_sat = 5_000_000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn snapshot_rejects_active_over_total() {
        let mut s = snapshot();
        s.num_channels_active = 11;
        assert!(s.validate().is_err());
    }

    #[test]
    fn snapshot_rejects_ratio_out_of_range() {
        let mut s = snapshot();
        s.uptime_ratio = 1.2;
        assert!(s.validate().is_err());
    }

    #[test]
    fn filters_canonical_is_stable() {
        let f = RetrievalFilters {
            doc_type: Some("node_doc".into()),
            related_node: None,
            language: Some("en".into()),
            created_after: None,
        };
        assert_eq!(f.canonical(), "type=node_doc;node=;lang=en;after=");
    }

    #[test]
    fn decision_payload_roundtrips_json() {
        let p = DecisionPayload::UpdateFee {
            channel_id: "ch1".into(),
            policy: ChannelPolicy { base_fee_msat: 1000, fee_rate_ppm: 400, time_lock_delta: 40 },
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: DecisionPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
