// ── Moniteur Engine: Daily Report Generator ────────────────────────────────
// Assembles one user's daily report: fresh node state via the data adapter,
// three retrieval+reasoning passes (daily narrative, fee stance, peer
// candidates), the decision engine over the results, and the section
// assembly. Idempotent on (user_id, report_date); a succeeded report is
// returned as-is, concurrent creators resolve through the store's
// uniqueness constraint.

use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ChannelState, DailyReport, Decision, NodeSnapshot, ReasoningOutput, ReasoningTask,
    ReportSection, ReportStatus, RetrievalFilters, UserProfile,
};
use crate::engine::decisions::DecisionEngine;
use crate::engine::adapters::NodeDataProvider;
use crate::engine::metrics::Metrics;
use crate::engine::reasoning::ReasoningService;
use crate::engine::retrieval::RetrievalService;
use crate::engine::store::Store;

pub struct ReportGenerator {
    store: Arc<Store>,
    node_data: Arc<dyn NodeDataProvider>,
    retrieval: Arc<RetrievalService>,
    reasoning: Arc<ReasoningService>,
    decisions: Arc<DecisionEngine>,
    metrics: Arc<Metrics>,
    per_report_timeout: Duration,
}

/// Task-specific retrieval query for one node.
fn task_query(task: ReasoningTask, node_pubkey: &str) -> String {
    match task {
        ReasoningTask::DailyReport => {
            format!("operational health liquidity routing performance of node {}", node_pubkey)
        }
        ReasoningTask::FeeRecommendation => {
            format!("channel fee policy routing revenue liquidity pressure node {}", node_pubkey)
        }
        ReasoningTask::ChannelRecommendation => {
            format!("well connected peers channel partners network topology for {}", node_pubkey)
        }
    }
}

/// Human-readable roll-up of one run's decisions, e.g.
/// "2 update_fee rejected (dry_run), 1 noop rejected".
pub fn summarize_decisions(decisions: &[Decision]) -> String {
    if decisions.is_empty() {
        return "no decisions".into();
    }
    let mut counts: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for d in decisions {
        let reason = d
            .status_reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        *counts
            .entry(format!("{} {}{}", d.decision_type.as_str(), d.status.as_str(), reason))
            .or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(label, n)| format!("{} {}", n, label))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ReportGenerator {
    pub fn new(
        store: Arc<Store>,
        node_data: Arc<dyn NodeDataProvider>,
        retrieval: Arc<RetrievalService>,
        reasoning: Arc<ReasoningService>,
        decisions: Arc<DecisionEngine>,
        metrics: Arc<Metrics>,
        per_report_timeout: Duration,
    ) -> Self {
        Self { store, node_data, retrieval, reasoning, decisions, metrics, per_report_timeout }
    }

    /// Generate (or return) the report for `(user_id, report_date)`.
    pub async fn generate(&self, user_id: &str, report_date: &str) -> EngineResult<DailyReport> {
        // Idempotency: a succeeded report is final.
        if let Some(existing) = self.store.get_report(user_id, report_date)? {
            if existing.generation_status == ReportStatus::Succeeded {
                return Ok(existing);
            }
        }

        let user = self
            .store
            .get_user(user_id)?
            .ok_or_else(|| EngineError::not_found(format!("user {}", user_id)))?;
        let pubkey = user
            .lightning_pubkey
            .clone()
            .ok_or_else(|| EngineError::invalid(format!("user {} has no lightning_pubkey", user_id)))?;

        let report_id = self.ensure_report_row(&user, report_date)?;
        let attempt = self.store.claim_report_attempt(&report_id)?;
        info!("[reports] {} / {} attempt {}", user_id, report_date, attempt);

        let outcome = tokio::time::timeout(
            self.per_report_timeout,
            self.generate_inner(&user, &pubkey),
        )
        .await;

        match outcome {
            Ok(Ok((sections, summary))) => {
                self.store.mark_report_succeeded(
                    &report_id,
                    &pubkey,
                    &sections,
                    &summary,
                    &Utc::now().to_rfc3339(),
                )?;
                self.metrics.record_report("succeeded");
                self.store
                    .get_report_by_id(&report_id)?
                    .ok_or_else(|| EngineError::not_found(format!("report {}", report_id)))
            }
            Ok(Err(e)) => {
                warn!("[reports] {} / {} failed: {}", user_id, report_date, e);
                self.store.mark_report_failed(&report_id, e.kind().as_str())?;
                self.metrics.record_report("failed");
                Err(e)
            }
            Err(_elapsed) => {
                warn!("[reports] {} / {} timed out", user_id, report_date);
                self.store.mark_report_failed(&report_id, "timeout")?;
                self.metrics.record_report("timeout");
                Err(EngineError::Timeout(format!(
                    "report generation exceeded {}s",
                    self.per_report_timeout.as_secs()
                )))
            }
        }
    }

    /// Create or reuse the report row; `Conflict` means another worker won
    /// the race, so re-read theirs.
    fn ensure_report_row(&self, user: &UserProfile, report_date: &str) -> EngineResult<String> {
        if let Some(existing) = self.store.get_report(&user.user_id, report_date)? {
            return Ok(existing.report_id);
        }
        let report = DailyReport {
            report_id: uuid::Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            tenant_id: user.tenant_id.clone(),
            node_pubkey: user.lightning_pubkey.clone().unwrap_or_default(),
            report_date: report_date.to_string(),
            generation_status: ReportStatus::Pending,
            attempt_count: 0,
            sections: vec![],
            decisions_summary: String::new(),
            generated_at: None,
            failure_reason: None,
        };
        match self.store.insert_report(&report) {
            Ok(()) => Ok(report.report_id),
            Err(EngineError::Conflict(_)) => {
                let other = self
                    .store
                    .get_report(&user.user_id, report_date)?
                    .ok_or_else(|| EngineError::Conflict("report row vanished".into()))?;
                Ok(other.report_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_task(
        &self,
        task: ReasoningTask,
        snapshot: &NodeSnapshot,
    ) -> EngineResult<ReasoningOutput> {
        let query = task_query(task, &snapshot.node_pubkey);
        let filters = RetrievalFilters::default();
        let hits = self.retrieval.retrieve(&query, &filters, None).await?;
        let scope = self.retrieval.fingerprint_for(&query, &filters, None)?;
        self.reasoning.reason(snapshot, &hits, task, scope.as_deref()).await
    }

    async fn generate_inner(
        &self,
        user: &UserProfile,
        pubkey: &str,
    ) -> EngineResult<(Vec<ReportSection>, String)> {
        let snapshot = self.node_data.fetch_node_snapshot(pubkey).await?;
        let channels = self.node_data.fetch_channels(pubkey).await?;

        let daily = self.run_task(ReasoningTask::DailyReport, &snapshot).await?;
        let fees = self.run_task(ReasoningTask::FeeRecommendation, &snapshot).await?;
        let peers = self.run_task(ReasoningTask::ChannelRecommendation, &snapshot).await?;

        let decisions = self
            .decisions
            .evaluate(&snapshot, &channels, &fees, &peers, user.apply_enabled)
            .await?;
        let summary = summarize_decisions(&decisions);

        Ok((assemble_sections(&snapshot, &channels, &daily, &fees, &peers, &decisions), summary))
    }
}

/// Build the user-facing sections from engine outputs and raw state.
pub fn assemble_sections(
    snapshot: &NodeSnapshot,
    channels: &[ChannelState],
    daily: &ReasoningOutput,
    fees: &ReasoningOutput,
    peers: &ReasoningOutput,
    decisions: &[Decision],
) -> Vec<ReportSection> {
    let mut sections = Vec::with_capacity(6);

    let mut health = daily.summary.clone();
    for finding in &daily.findings {
        health.push_str(&format!("\n• {}", finding));
    }
    sections.push(ReportSection { title: "Health Summary".into(), body: health });

    let total = snapshot.capacity_sat.max(1) as f64;
    sections.push(ReportSection {
        title: "Liquidity".into(),
        body: format!(
            "Capacity {} sat — local {:.1}%, remote {:.1}% across {} channels ({} active).",
            snapshot.capacity_sat,
            100.0 * snapshot.local_balance_sat as f64 / total,
            100.0 * snapshot.remote_balance_sat as f64 / total,
            snapshot.num_channels_total,
            snapshot.num_channels_active,
        ),
    });

    let inactive: Vec<&str> = channels
        .iter()
        .filter(|c| !c.active)
        .map(|c| c.channel_id.as_str())
        .collect();
    sections.push(ReportSection {
        title: "Routing Performance".into(),
        body: format!(
            "Routing success rate {:.1}% — uptime {:.1}%, 7d revenue {} msat.{}",
            100.0 * snapshot.routing_success_rate,
            100.0 * snapshot.uptime_ratio,
            snapshot.fee_stats.revenue_msat_7d,
            if inactive.is_empty() {
                String::new()
            } else {
                format!(" Inactive channels: {}.", inactive.join(", "))
            }
        ),
    });

    let mut fee_body = fees.summary.clone();
    for note in &fees.channel_notes {
        fee_body.push_str(&format!("\n• {}: {}", note.channel_id, note.observation));
    }
    sections.push(ReportSection { title: "Fee Strategy".into(), body: fee_body });

    let mut rec_body = peers.summary.clone();
    for candidate in &peers.candidate_peers {
        rec_body.push_str(&format!("\n• {} — {}", candidate.pubkey, candidate.rationale));
    }
    sections.push(ReportSection { title: "Recommendations".into(), body: rec_body });

    sections.push(ReportSection {
        title: "Decisions".into(),
        body: decisions
            .iter()
            .map(|d| {
                format!(
                    "{} [{}{}] {}",
                    d.decision_type.as_str(),
                    d.status.as_str(),
                    d.status_reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default(),
                    d.rationale_text
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
    });

    sections
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{DecisionPayload, DecisionStatus, DecisionType, FeeStats};

    fn snapshot() -> NodeSnapshot {
        NodeSnapshot {
            node_pubkey: "02abc".into(),
            captured_at: "2026-07-01T00:00:00Z".into(),
            capacity_sat: 10_000_000,
            num_channels_active: 4,
            num_channels_total: 5,
            local_balance_sat: 6_000_000,
            remote_balance_sat: 3_000_000,
            centrality_score: 0.4,
            routing_success_rate: 0.85,
            reputation_score: 0.7,
            uptime_ratio: 0.99,
            fee_stats: FeeStats { avg_fee_rate_ppm: 300, avg_base_fee_msat: 1000, revenue_msat_7d: 9000 },
        }
    }

    fn decision(dt: DecisionType, status: DecisionStatus, reason: Option<&str>) -> Decision {
        Decision {
            decision_id: "d".into(),
            node_pubkey: "02abc".into(),
            channel_id: None,
            decision_type: dt,
            payload: DecisionPayload::Noop,
            rationale_text: "r".into(),
            score: 0.5,
            created_at: "2026-07-01T00:00:00Z".into(),
            status,
            status_reason: reason.map(String::from),
        }
    }

    #[test]
    fn summary_groups_by_type_status_reason() {
        let ds = vec![
            decision(DecisionType::UpdateFee, DecisionStatus::Rejected, Some("dry_run")),
            decision(DecisionType::UpdateFee, DecisionStatus::Rejected, Some("dry_run")),
            decision(DecisionType::Noop, DecisionStatus::Rejected, Some("noop")),
        ];
        let s = summarize_decisions(&ds);
        assert!(s.contains("2 update_fee rejected (dry_run)"));
        assert!(s.contains("1 noop rejected (noop)"));
        assert_eq!(summarize_decisions(&[]), "no decisions");
    }

    #[test]
    fn sections_cover_all_six_topics() {
        let daily = ReasoningOutput { summary: "fine".into(), ..Default::default() };
        let sections = assemble_sections(
            &snapshot(),
            &[],
            &daily,
            &ReasoningOutput::default(),
            &ReasoningOutput::default(),
            &[decision(DecisionType::Noop, DecisionStatus::Rejected, Some("noop"))],
        );
        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "Health Summary",
                "Liquidity",
                "Routing Performance",
                "Fee Strategy",
                "Recommendations",
                "Decisions"
            ]
        );
        assert!(sections[1].body.contains("60.0%"));
    }
}
