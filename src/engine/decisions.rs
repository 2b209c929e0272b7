// ── Moniteur Engine: Scoring & Decision Engine ─────────────────────────────
// Turns reasoning output + raw node state into typed Decision records under
// the shadow/apply safety regime.
//
// Division of labor (deliberate): every NUMBER here is closed-form and
// deterministic; node scores, fee targets, confidence. The reasoning layer
// contributes rationale text and candidate peers, never the numbers, so two
// runs over the same state always price the same way.
//
// Application semantics: dry-run persists decisions and stops them at the
// gate (`rejected`/`dry_run`); live mode dispatches through the node-control
// adapter with the decision id as idempotency key, captures the prior state
// into the rollback ledger, and serializes same-channel decisions while
// letting distinct channels proceed concurrently up to a per-node cap.

use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::atoms::constants::{FEE_MIN_RELATIVE_CHANGE, FEE_RATE_PPM_MAX, FEE_RATE_PPM_MIN};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ChannelPolicy, ChannelState, Decision, DecisionPayload, DecisionStatus, DecisionType,
    NodeSnapshot, ReasoningOutput,
};
use crate::engine::config::{HeuristicConfig, HeuristicWeights, LimitsConfig};
use crate::engine::adapters::{NodeControl, NodeDataProvider};
use crate::engine::metrics::Metrics;
use crate::engine::store::Store;

// ── Scoring (pure) ─────────────────────────────────────────────────────────

/// Min-max normalize `values` into [0,1]. A constant cohort maps to 0.5;
/// with no spread there is nothing to rank on.
pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < 1e-12 {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

/// `fee_penalty = min(1, fee_rate_ppm / 2500)`; expensive nodes score lower.
pub fn fee_penalty(fee_rate_ppm: u32) -> f64 {
    (fee_rate_ppm as f64 / FEE_RATE_PPM_MAX as f64).min(1.0)
}

/// The weighted multi-criteria node score. Monotone non-decreasing in every
/// positively-weighted input.
pub fn score_node(
    weights: &HeuristicWeights,
    centrality: f64,
    capacity_norm: f64,
    reputation: f64,
    avg_fee_rate_ppm: u32,
    uptime: f64,
) -> f64 {
    weights.centrality * centrality
        + weights.capacity * capacity_norm
        + weights.reputation * reputation
        + weights.fees * (1.0 - fee_penalty(avg_fee_rate_ppm))
        + weights.uptime * uptime
}

// ── Fee targeting (pure) ───────────────────────────────────────────────────

/// Closed-form fee target for one channel, bounded to [50, 2500] ppm.
///
/// Factors (all multiplicative on the current rate):
///   liquidity  — scarce local balance raises fees, excess lowers them
///   success    — persistently failing routes argue for cheaper routing
///   centrality; a well-connected peer supports a premium
///   revenue    — a silent week nudges the price down to attract flow
pub fn fee_target_ppm(channel: &ChannelState, node: &NodeSnapshot, peer_centrality: f64) -> u32 {
    let current = channel.policy.fee_rate_ppm.max(1) as f64;

    let outbound_ratio = if channel.capacity_sat == 0 {
        0.5
    } else {
        channel.local_balance_sat as f64 / channel.capacity_sat as f64
    };
    let liquidity = 1.0 + (0.5 - outbound_ratio); // [0.5, 1.5]
    let success = 0.75 + 0.5 * node.routing_success_rate; // [0.75, 1.25]
    let centrality = 0.9 + 0.2 * peer_centrality; // [0.9, 1.1]
    let revenue = if node.fee_stats.revenue_msat_7d == 0 { 0.9 } else { 1.0 };

    let target = current * liquidity * success * centrality * revenue;
    (target.round() as i64).clamp(FEE_RATE_PPM_MIN as i64, FEE_RATE_PPM_MAX as i64) as u32
}

/// Confidence in a fee recommendation; a measure of data quality, not of
/// the target's magnitude. Gated against `confidence_threshold` before a
/// decision is emitted.
pub fn fee_confidence(node: &NodeSnapshot) -> f64 {
    let activity = if node.num_channels_total == 0 {
        0.0
    } else {
        node.num_channels_active as f64 / node.num_channels_total as f64
    };
    (0.1 + 0.4 * node.uptime_ratio + 0.3 * node.routing_success_rate + 0.2 * activity)
        .clamp(0.0, 1.0)
}

/// Suggested funding for a recommended channel: 5% of our capacity,
/// clamped to a sane band.
pub fn suggested_channel_sat(own_capacity_sat: u64) -> u64 {
    (own_capacity_sat / 20).clamp(500_000, 5_000_000)
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub struct DecisionEngine {
    store: Arc<Store>,
    node_data: Arc<dyn NodeDataProvider>,
    node_control: Arc<dyn NodeControl>,
    metrics: Arc<Metrics>,
    heuristic: HeuristicConfig,
    limits: LimitsConfig,
    dry_run: bool,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<Store>,
        node_data: Arc<dyn NodeDataProvider>,
        node_control: Arc<dyn NodeControl>,
        metrics: Arc<Metrics>,
        heuristic: HeuristicConfig,
        limits: LimitsConfig,
        dry_run: bool,
    ) -> Self {
        Self { store, node_data, node_control, metrics, heuristic, limits, dry_run }
    }

    fn new_decision(
        node_pubkey: &str,
        channel_id: Option<String>,
        decision_type: DecisionType,
        payload: DecisionPayload,
        rationale: String,
        score: f64,
    ) -> Decision {
        Decision {
            decision_id: uuid::Uuid::new_v4().to_string(),
            node_pubkey: node_pubkey.to_string(),
            channel_id,
            decision_type,
            payload,
            rationale_text: rationale,
            score,
            created_at: Utc::now().to_rfc3339(),
            status: DecisionStatus::Pending,
            status_reason: None,
        }
    }

    /// Build fee-update decisions for every channel whose closed-form target
    /// clears both gates (>10% relative change, confidence ≥ threshold).
    pub fn fee_decisions(
        &self,
        node: &NodeSnapshot,
        channels: &[ChannelState],
        reasoning: &ReasoningOutput,
    ) -> Vec<Decision> {
        let confidence = fee_confidence(node);
        let notes: HashMap<&str, &str> = reasoning
            .channel_notes
            .iter()
            .map(|n| (n.channel_id.as_str(), n.observation.as_str()))
            .collect();

        let mut decisions = Vec::new();
        for channel in channels.iter().filter(|c| c.active) {
            let target = fee_target_ppm(channel, node, node.centrality_score);
            let current = channel.policy.fee_rate_ppm;
            let relative = (target as f64 - current as f64).abs() / (current.max(1) as f64);
            if relative <= FEE_MIN_RELATIVE_CHANGE
                || confidence < self.heuristic.confidence_threshold
            {
                continue;
            }

            let rationale = match notes.get(channel.channel_id.as_str()) {
                Some(observation) => (*observation).to_string(),
                None => format!(
                    "fee {} → {} ppm (balance ratio {:.2}, success {:.2})",
                    current,
                    target,
                    channel.local_balance_sat as f64 / channel.capacity_sat.max(1) as f64,
                    node.routing_success_rate
                ),
            };

            let policy = ChannelPolicy { fee_rate_ppm: target, ..channel.policy.clone() };
            decisions.push(Self::new_decision(
                &node.node_pubkey,
                Some(channel.channel_id.clone()),
                DecisionType::UpdateFee,
                DecisionPayload::UpdateFee { channel_id: channel.channel_id.clone(), policy },
                rationale,
                confidence,
            ));
        }
        decisions
    }

    /// Build open-channel decisions from the reasoning layer's candidates:
    /// re-score each against the cohort, keep those above the threshold and
    /// not already connected, cap at `max_open_per_run`.
    pub async fn channel_decisions(
        &self,
        node: &NodeSnapshot,
        channels: &[ChannelState],
        reasoning: &ReasoningOutput,
    ) -> Vec<Decision> {
        if reasoning.candidate_peers.is_empty() {
            return Vec::new();
        }
        let connected: HashSet<&str> = channels.iter().map(|c| c.peer_pubkey.as_str()).collect();

        // Fetch candidate snapshots; unreachable candidates drop out.
        let mut scored: Vec<(NodeSnapshot, String)> = Vec::new();
        for candidate in &reasoning.candidate_peers {
            if connected.contains(candidate.pubkey.as_str())
                || candidate.pubkey == node.node_pubkey
            {
                continue;
            }
            match self.node_data.fetch_node_snapshot(&candidate.pubkey).await {
                Ok(snapshot) => scored.push((snapshot, candidate.rationale.clone())),
                Err(e) => {
                    warn!("[decisions] Candidate {} dropped: {}", candidate.pubkey, e)
                }
            }
        }
        if scored.is_empty() {
            return Vec::new();
        }

        let capacities: Vec<f64> = scored.iter().map(|(s, _)| s.capacity_sat as f64).collect();
        let normalized = min_max_normalize(&capacities);

        let mut ranked: Vec<(f64, &NodeSnapshot, &String)> = scored
            .iter()
            .zip(normalized)
            .map(|((snapshot, rationale), capacity_norm)| {
                let score = score_node(
                    &self.heuristic.weights,
                    snapshot.centrality_score,
                    capacity_norm,
                    snapshot.reputation_score,
                    snapshot.fee_stats.avg_fee_rate_ppm,
                    snapshot.uptime_ratio,
                );
                (score, snapshot, rationale)
            })
            .filter(|(score, _, _)| *score >= self.heuristic.peer_score_threshold)
            .collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.node_pubkey.cmp(&b.1.node_pubkey))
        });
        ranked.truncate(self.limits.max_open_per_run);

        ranked
            .into_iter()
            .map(|(score, peer, rationale)| {
                Self::new_decision(
                    &node.node_pubkey,
                    None,
                    DecisionType::OpenChannel,
                    DecisionPayload::OpenChannel {
                        peer_pubkey: peer.node_pubkey.clone(),
                        amount_sat: suggested_channel_sat(node.capacity_sat),
                    },
                    rationale.clone(),
                    score,
                )
            })
            .collect()
    }

    /// Full evaluation for one node: fee + channel decisions, falling back
    /// to a single noop when nothing clears the gates. Decisions are
    /// persisted as `pending`, then run through the application gate.
    pub async fn evaluate(
        &self,
        node: &NodeSnapshot,
        channels: &[ChannelState],
        fee_reasoning: &ReasoningOutput,
        channel_reasoning: &ReasoningOutput,
        apply_enabled: bool,
    ) -> EngineResult<Vec<Decision>> {
        // No indexed context means the reasoning layer saw nothing; the
        // engine degrades to noop rather than acting on numbers alone.
        let mut decisions = if fee_reasoning.no_context {
            Vec::new()
        } else {
            self.fee_decisions(node, channels, fee_reasoning)
        };
        decisions.extend(self.channel_decisions(node, channels, channel_reasoning).await);

        if decisions.is_empty() {
            decisions.push(Self::new_decision(
                &node.node_pubkey,
                None,
                DecisionType::Noop,
                DecisionPayload::Noop,
                "no action cleared the decision gates".into(),
                0.0,
            ));
        }

        for d in &decisions {
            self.store.insert_decision(d)?;
            self.metrics.record_decision(d.decision_type.as_str(), d.status.as_str());
        }

        self.apply_all(decisions, channels, apply_enabled).await
    }

    /// Application gate. Same-channel decisions run in issuance order;
    /// distinct channels proceed concurrently up to `max_apply_per_node`.
    async fn apply_all(
        &self,
        decisions: Vec<Decision>,
        channels: &[ChannelState],
        apply_enabled: bool,
    ) -> EngineResult<Vec<Decision>> {
        let prior_policies: HashMap<String, ChannelPolicy> = channels
            .iter()
            .map(|c| (c.channel_id.clone(), c.policy.clone()))
            .collect();

        // Group by channel id (issuance order preserved); channel-less
        // decisions form singleton groups.
        let mut groups: Vec<Vec<Decision>> = Vec::new();
        let mut group_of: HashMap<String, usize> = HashMap::new();
        for d in decisions {
            match &d.channel_id {
                Some(ch) => match group_of.get(ch) {
                    Some(&idx) => groups[idx].push(d),
                    None => {
                        group_of.insert(ch.clone(), groups.len());
                        groups.push(vec![d]);
                    }
                },
                None => groups.push(vec![d]),
            }
        }

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.limits.max_apply_per_node));
        let tasks = groups.into_iter().map(|group| {
            let semaphore = semaphore.clone();
            let prior = &prior_policies;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let mut done = Vec::with_capacity(group.len());
                for decision in group {
                    done.push(self.apply_one(decision, prior, apply_enabled).await);
                }
                done
            }
        });

        let mut applied: Vec<Decision> = join_all(tasks).await.into_iter().flatten().collect();
        // Stable order for callers/reports.
        applied.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.decision_id.cmp(&b.decision_id)));
        Ok(applied)
    }

    async fn apply_one(
        &self,
        decision: Decision,
        prior_policies: &HashMap<String, ChannelPolicy>,
        apply_enabled: bool,
    ) -> Decision {
        // Noop never reaches the daemon.
        if decision.decision_type == DecisionType::Noop {
            return self.finish(decision, DecisionStatus::Rejected, Some("noop"));
        }

        // Shadow regime: dry-run globally, or this user has not opted in.
        if self.dry_run || !apply_enabled {
            let reason = if self.dry_run { "dry_run" } else { "apply_disabled" };
            return self.finish(decision, DecisionStatus::Rejected, Some(reason));
        }

        // Capture the prior state BEFORE dispatch so the ledger is complete
        // even if a later snapshot is unavailable.
        let (prior_state, reversal) = match &decision.payload {
            DecisionPayload::UpdateFee { channel_id, .. } => {
                match prior_policies.get(channel_id) {
                    Some(policy) => (
                        serde_json::to_value(policy).unwrap_or_default(),
                        DecisionPayload::UpdateFee {
                            channel_id: channel_id.clone(),
                            policy: policy.clone(),
                        },
                    ),
                    None => {
                        return self.finish(decision, DecisionStatus::Failed, Some("unknown_channel"));
                    }
                }
            }
            DecisionPayload::OpenChannel { peer_pubkey, .. } => (
                serde_json::json!({ "channel_with": peer_pubkey, "existed": false }),
                // An open is reversed by closing the resulting channel; the
                // daemon resolves the channel from the idempotency key.
                DecisionPayload::CloseChannel { channel_id: decision.decision_id.clone() },
            ),
            DecisionPayload::CloseChannel { channel_id } => (
                serde_json::json!({ "channel_id": channel_id, "active": true }),
                DecisionPayload::Noop, // a close is not mechanically reversible
            ),
            DecisionPayload::Rebalance { .. } | DecisionPayload::Noop => {
                (serde_json::Value::Null, DecisionPayload::Noop)
            }
        };

        match self.dispatch(&decision.decision_id, &decision.payload).await {
            Ok(()) => {
                let entry = crate::atoms::types::RollbackEntry {
                    decision_id: decision.decision_id.clone(),
                    prior_state,
                    reversal,
                    created_at: Utc::now().to_rfc3339(),
                };
                if let Err(e) = self.store.insert_rollback_entry(&entry) {
                    // Conflict here means a duplicate apply; the first wins.
                    warn!("[decisions] Ledger write for {}: {}", decision.decision_id, e);
                }
                self.finish(decision, DecisionStatus::Applied, None)
            }
            Err(e) => {
                warn!("[decisions] Dispatch {} failed: {}", decision.decision_id, e);
                self.finish(decision, DecisionStatus::Failed, Some(e.kind().as_str()))
            }
        }
    }

    async fn dispatch(&self, decision_id: &str, payload: &DecisionPayload) -> EngineResult<()> {
        match payload {
            DecisionPayload::UpdateFee { channel_id, policy } => {
                self.node_control.update_policy(decision_id, channel_id, policy).await
            }
            DecisionPayload::OpenChannel { peer_pubkey, amount_sat } => {
                self.node_control.open_channel(decision_id, peer_pubkey, *amount_sat).await
            }
            DecisionPayload::CloseChannel { channel_id } => {
                self.node_control.close_channel(decision_id, channel_id).await
            }
            DecisionPayload::Rebalance { .. } => Err(EngineError::invalid(
                "rebalance dispatch is not supported by the node daemon",
            )),
            DecisionPayload::Noop => Ok(()),
        }
    }

    fn finish(&self, mut decision: Decision, to: DecisionStatus, reason: Option<&str>) -> Decision {
        if let Err(e) =
            self.store
                .transition_decision(&decision.decision_id, DecisionStatus::Pending, to, reason)
        {
            warn!("[decisions] Transition {} → {}: {}", decision.decision_id, to.as_str(), e);
        }
        decision.status = to;
        decision.status_reason = reason.map(|s| s.to_string());
        self.metrics.record_decision(decision.decision_type.as_str(), to.as_str());
        decision
    }

    /// Replay the reversal payload of an applied decision. Succeeds only
    /// from `applied`; transitions to `rolled_back` exactly once.
    pub async fn rollback(&self, decision_id: &str) -> EngineResult<Decision> {
        let decision = self
            .store
            .get_decision(decision_id)?
            .ok_or_else(|| EngineError::not_found(format!("decision {}", decision_id)))?;
        if decision.status != DecisionStatus::Applied {
            return Err(EngineError::Conflict(format!(
                "decision {} is {}, only applied decisions roll back",
                decision_id,
                decision.status.as_str()
            )));
        }
        let entry = self
            .store
            .get_rollback_entry(decision_id)?
            .ok_or_else(|| EngineError::not_found(format!("rollback entry for {}", decision_id)))?;

        // Idempotency key distinct from the original dispatch.
        let key = format!("{}:rollback", decision_id);
        self.dispatch(&key, &entry.reversal).await?;

        self.store.transition_decision(
            decision_id,
            DecisionStatus::Applied,
            DecisionStatus::RolledBack,
            Some("rollback"),
        )?;
        self.metrics
            .record_decision(decision.decision_type.as_str(), DecisionStatus::RolledBack.as_str());
        info!("[decisions] Rolled back {}", decision_id);

        let mut rolled = decision;
        rolled.status = DecisionStatus::RolledBack;
        rolled.status_reason = Some("rollback".into());
        Ok(rolled)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::FeeStats;

    fn weights() -> HeuristicWeights {
        HeuristicWeights::default()
    }

    fn node(centrality: f64, success: f64, uptime: f64) -> NodeSnapshot {
        NodeSnapshot {
            node_pubkey: "02self".into(),
            captured_at: "2026-07-01T00:00:00Z".into(),
            capacity_sat: 20_000_000,
            num_channels_active: 9,
            num_channels_total: 10,
            local_balance_sat: 10_000_000,
            remote_balance_sat: 9_000_000,
            centrality_score: centrality,
            routing_success_rate: success,
            reputation_score: 0.7,
            uptime_ratio: uptime,
            fee_stats: FeeStats { avg_fee_rate_ppm: 300, avg_base_fee_msat: 1000, revenue_msat_7d: 5000 },
        }
    }

    fn channel(id: &str, fee_ppm: u32, local: u64, capacity: u64) -> ChannelState {
        ChannelState {
            channel_id: id.into(),
            node_pubkey: "02self".into(),
            peer_pubkey: format!("02peer{}", id),
            capacity_sat: capacity,
            local_balance_sat: local,
            active: true,
            policy: ChannelPolicy { base_fee_msat: 1000, fee_rate_ppm: fee_ppm, time_lock_delta: 40 },
            last_seen_at: "2026-07-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn score_is_monotone_in_centrality() {
        let w = weights();
        let low = score_node(&w, 0.3, 0.5, 0.7, 300, 0.9);
        let high = score_node(&w, 0.300001, 0.5, 0.7, 300, 0.9);
        assert!(high > low);
    }

    #[test]
    fn score_is_monotone_in_every_weighted_input() {
        let w = weights();
        let base = score_node(&w, 0.3, 0.5, 0.7, 300, 0.9);
        assert!(score_node(&w, 0.3, 0.6, 0.7, 300, 0.9) > base); // capacity
        assert!(score_node(&w, 0.3, 0.5, 0.8, 300, 0.9) > base); // reputation
        assert!(score_node(&w, 0.3, 0.5, 0.7, 200, 0.9) > base); // cheaper fees
        assert!(score_node(&w, 0.3, 0.5, 0.7, 300, 0.95) > base); // uptime
    }

    #[test]
    fn fee_penalty_saturates_at_one() {
        assert_eq!(fee_penalty(2500), 1.0);
        assert_eq!(fee_penalty(5000), 1.0);
        assert!(fee_penalty(250) < 0.2);
    }

    #[test]
    fn min_max_handles_constant_cohort() {
        assert_eq!(min_max_normalize(&[5.0, 5.0, 5.0]), vec![0.5, 0.5, 0.5]);
        let n = min_max_normalize(&[0.0, 5.0, 10.0]);
        assert_eq!(n, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn fee_target_stays_in_bounds() {
        let n = node(0.9, 1.0, 1.0);
        // Extremely scarce local liquidity on an expensive channel.
        let ch = channel("ch1", 2400, 0, 1_000_000);
        let t = fee_target_ppm(&ch, &n, 0.9);
        assert!(t <= FEE_RATE_PPM_MAX);
        // Dirt-cheap channel with all-local balance cannot go below the floor.
        let ch2 = channel("ch2", 60, 1_000_000, 1_000_000);
        let t2 = fee_target_ppm(&ch2, &n, 0.1);
        assert!(t2 >= FEE_RATE_PPM_MIN);
    }

    #[test]
    fn excess_outbound_liquidity_lowers_fees() {
        let n = node(0.3, 0.6, 0.99);
        // All balance local → channel is not attracting inbound flow.
        let ch = channel("ch1", 1000, 1_000_000, 1_000_000);
        let t = fee_target_ppm(&ch, &n, 0.3);
        assert!(t < 1000, "expected a cut, got {}", t);
        // Scarce local balance → protect remaining liquidity with higher fees.
        let ch2 = channel("ch2", 1000, 0, 1_000_000);
        let t2 = fee_target_ppm(&ch2, &n, 0.3);
        assert!(t2 > 1000, "expected a raise, got {}", t2);
    }

    #[test]
    fn confidence_tracks_data_quality() {
        assert!(fee_confidence(&node(0.4, 0.9, 0.99)) >= 0.6);
        let mut sparse = node(0.4, 0.2, 0.4);
        sparse.num_channels_active = 1;
        assert!(fee_confidence(&sparse) < 0.6);
    }

    #[test]
    fn suggested_channel_size_is_clamped() {
        assert_eq!(suggested_channel_sat(1_000_000), 500_000);
        assert_eq!(suggested_channel_sat(40_000_000), 2_000_000);
        assert_eq!(suggested_channel_sat(1_000_000_000), 5_000_000);
    }
}
