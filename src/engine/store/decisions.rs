// ── Store: Decision Ledger & Rollback Entries ──────────────────────────────
// Payloads and prior-state snapshots are stored as JSON text; everything
// queried on has its own column. Status transitions are guarded UPDATEs so
// illegal jumps (e.g. rolling back a pending decision) fail loudly.

use rusqlite::params;

use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    Decision, DecisionPayload, DecisionStatus, DecisionType, RollbackEntry,
};

impl Decision {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let payload_json: String = row.get(4)?;
        let type_str: String = row.get(3)?;
        let status_str: String = row.get(8)?;
        Ok(Decision {
            decision_id: row.get(0)?,
            node_pubkey: row.get(1)?,
            channel_id: row.get(2)?,
            decision_type: DecisionType::parse(&type_str).unwrap_or(DecisionType::Noop),
            payload: serde_json::from_str(&payload_json).unwrap_or(DecisionPayload::Noop),
            rationale_text: row.get(5)?,
            score: row.get(6)?,
            created_at: row.get(7)?,
            status: DecisionStatus::parse(&status_str).unwrap_or(DecisionStatus::Failed),
            status_reason: row.get(9)?,
        })
    }
}

const DECISION_COLUMNS: &str = "decision_id, node_pubkey, channel_id, decision_type, payload,
                                rationale_text, score, created_at, status, status_reason";

impl Store {
    pub fn insert_decision(&self, d: &Decision) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO decisions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                DECISION_COLUMNS
            ),
            params![
                d.decision_id,
                d.node_pubkey,
                d.channel_id,
                d.decision_type.as_str(),
                serde_json::to_string(&d.payload)?,
                d.rationale_text,
                d.score,
                d.created_at,
                d.status.as_str(),
                d.status_reason,
            ],
        )?;
        Ok(())
    }

    pub fn get_decision(&self, decision_id: &str) -> EngineResult<Option<Decision>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM decisions WHERE decision_id = ?1",
            DECISION_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![decision_id], Decision::from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Guarded status transition: succeeds only when the row is currently in
    /// `expected_from`. A zero-row update surfaces as `Conflict` so callers
    /// learn another writer got there first.
    pub fn transition_decision(
        &self,
        decision_id: &str,
        expected_from: DecisionStatus,
        to: DecisionStatus,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE decisions SET status = ?3, status_reason = ?4
             WHERE decision_id = ?1 AND status = ?2",
            params![decision_id, expected_from.as_str(), to.as_str(), reason],
        )?;
        if n == 0 {
            return Err(EngineError::Conflict(format!(
                "decision {} is not in state '{}'",
                decision_id,
                expected_from.as_str()
            )));
        }
        Ok(())
    }

    /// Decisions created on or after `since` for one node, newest first.
    pub fn decisions_for_node_since(
        &self,
        node_pubkey: &str,
        since: &str,
    ) -> EngineResult<Vec<Decision>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM decisions
             WHERE node_pubkey = ?1 AND created_at >= ?2
             ORDER BY created_at DESC",
            DECISION_COLUMNS
        ))?;
        let decisions = stmt
            .query_map(params![node_pubkey, since], Decision::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(decisions)
    }

    // ── Rollback entries ───────────────────────────────────────────────────

    /// Insert the rollback entry for a freshly applied decision. At most one
    /// per decision; a second insert is a `Conflict`.
    pub fn insert_rollback_entry(&self, e: &RollbackEntry) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO rollback_entries (decision_id, prior_state, reversal, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                e.decision_id,
                serde_json::to_string(&e.prior_state)?,
                serde_json::to_string(&e.reversal)?,
                e.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_rollback_entry(&self, decision_id: &str) -> EngineResult<Option<RollbackEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT decision_id, prior_state, reversal, created_at
             FROM rollback_entries WHERE decision_id = ?1",
        )?;
        let row: Option<(String, String, String, String)> = stmt
            .query_map(params![decision_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .next()
            .transpose()?;
        match row {
            None => Ok(None),
            Some((decision_id, prior, reversal, created_at)) => Ok(Some(RollbackEntry {
                decision_id,
                prior_state: serde_json::from_str(&prior)?,
                reversal: serde_json::from_str(&reversal)?,
                created_at,
            })),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::ChannelPolicy;

    fn decision(id: &str, status: DecisionStatus) -> Decision {
        Decision {
            decision_id: id.into(),
            node_pubkey: "02abc".into(),
            channel_id: Some("ch1".into()),
            decision_type: DecisionType::UpdateFee,
            payload: DecisionPayload::UpdateFee {
                channel_id: "ch1".into(),
                policy: ChannelPolicy { base_fee_msat: 500, fee_rate_ppm: 200, time_lock_delta: 40 },
            },
            rationale_text: "imbalance".into(),
            score: 0.7,
            created_at: "2026-01-01T00:00:00Z".into(),
            status,
            status_reason: None,
        }
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let d = decision("d1", DecisionStatus::Pending);
        store.insert_decision(&d).unwrap();
        let back = store.get_decision("d1").unwrap().unwrap();
        assert_eq!(back.decision_type, DecisionType::UpdateFee);
        assert_eq!(back.payload, d.payload);
        assert_eq!(back.status, DecisionStatus::Pending);
    }

    #[test]
    fn duplicate_decision_id_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.insert_decision(&decision("d1", DecisionStatus::Pending)).unwrap();
        let err = store.insert_decision(&decision("d1", DecisionStatus::Pending)).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn transition_guards_current_state() {
        let store = Store::open_in_memory().unwrap();
        store.insert_decision(&decision("d1", DecisionStatus::Pending)).unwrap();
        store
            .transition_decision("d1", DecisionStatus::Pending, DecisionStatus::Applied, None)
            .unwrap();
        // Applying again from 'pending' must fail; the row moved on.
        let err = store
            .transition_decision("d1", DecisionStatus::Pending, DecisionStatus::Applied, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(
            store.get_decision("d1").unwrap().unwrap().status,
            DecisionStatus::Applied
        );
    }

    #[test]
    fn rollback_entry_is_unique_per_decision() {
        let store = Store::open_in_memory().unwrap();
        store.insert_decision(&decision("d1", DecisionStatus::Applied)).unwrap();
        let entry = RollbackEntry {
            decision_id: "d1".into(),
            prior_state: serde_json::json!({"fee_rate_ppm": 400}),
            reversal: DecisionPayload::UpdateFee {
                channel_id: "ch1".into(),
                policy: ChannelPolicy { base_fee_msat: 1000, fee_rate_ppm: 400, time_lock_delta: 40 },
            },
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        store.insert_rollback_entry(&entry).unwrap();
        assert!(matches!(
            store.insert_rollback_entry(&entry).unwrap_err(),
            EngineError::Conflict(_)
        ));
        let back = store.get_rollback_entry("d1").unwrap().unwrap();
        assert_eq!(back.reversal, entry.reversal);
    }
}
