// ── Store: Daily Reports ───────────────────────────────────────────────────
// The UNIQUE(user_id, report_date) constraint is the idempotency anchor for
// the scheduler path: a second writer hits `Conflict` and re-reads instead
// of duplicating work. Terminal transitions are single UPDATEs, so readers
// observe them linearizably through the connection mutex.

use rusqlite::params;

use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{DailyReport, ReportSection, ReportStatus};

impl DailyReport {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(5)?;
        let sections_json: String = row.get(7)?;
        Ok(DailyReport {
            report_id: row.get(0)?,
            user_id: row.get(1)?,
            tenant_id: row.get(2)?,
            node_pubkey: row.get(3)?,
            report_date: row.get(4)?,
            generation_status: ReportStatus::parse(&status).unwrap_or(ReportStatus::Failed),
            attempt_count: row.get(6)?,
            sections: serde_json::from_str::<Vec<ReportSection>>(&sections_json)
                .unwrap_or_default(),
            decisions_summary: row.get(8)?,
            generated_at: row.get(9)?,
            failure_reason: row.get(10)?,
        })
    }
}

const REPORT_COLUMNS: &str = "report_id, user_id, tenant_id, node_pubkey, report_date,
                              generation_status, attempt_count, sections, decisions_summary,
                              generated_at, failure_reason";

impl Store {
    pub fn get_report(&self, user_id: &str, report_date: &str) -> EngineResult<Option<DailyReport>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM daily_reports WHERE user_id = ?1 AND report_date = ?2",
            REPORT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![user_id, report_date], DailyReport::from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_report_by_id(&self, report_id: &str) -> EngineResult<Option<DailyReport>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM daily_reports WHERE report_id = ?1",
            REPORT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![report_id], DailyReport::from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Create the report row in `pending`. `Conflict` means another writer
    /// created it first; re-read and continue.
    pub fn insert_report(&self, r: &DailyReport) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO daily_reports ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                REPORT_COLUMNS
            ),
            params![
                r.report_id,
                r.user_id,
                r.tenant_id,
                r.node_pubkey,
                r.report_date,
                r.generation_status.as_str(),
                r.attempt_count,
                serde_json::to_string(&r.sections)?,
                r.decisions_summary,
                r.generated_at,
                r.failure_reason,
            ],
        )?;
        Ok(())
    }

    /// Claim a report row for a generation attempt: bumps attempt_count and
    /// moves pending/failed → running. Succeeds only from a claimable state.
    pub fn claim_report_attempt(&self, report_id: &str) -> EngineResult<u32> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE daily_reports
             SET generation_status = 'running', attempt_count = attempt_count + 1,
                 failure_reason = NULL
             WHERE report_id = ?1 AND generation_status IN ('pending', 'failed', 'running')",
            params![report_id],
        )?;
        if n == 0 {
            return Err(EngineError::Conflict(format!(
                "report {} is not claimable",
                report_id
            )));
        }
        let attempts: u32 = conn.query_row(
            "SELECT attempt_count FROM daily_reports WHERE report_id = ?1",
            params![report_id],
            |r| r.get(0),
        )?;
        Ok(attempts)
    }

    pub fn mark_report_succeeded(
        &self,
        report_id: &str,
        node_pubkey: &str,
        sections: &[ReportSection],
        decisions_summary: &str,
        generated_at: &str,
    ) -> EngineResult<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE daily_reports
             SET generation_status = 'succeeded', node_pubkey = ?2, sections = ?3,
                 decisions_summary = ?4, generated_at = ?5, failure_reason = NULL
             WHERE report_id = ?1 AND generation_status = 'running'",
            params![
                report_id,
                node_pubkey,
                serde_json::to_string(sections)?,
                decisions_summary,
                generated_at,
            ],
        )?;
        if n == 0 {
            return Err(EngineError::Conflict(format!(
                "report {} is not running — cannot mark succeeded",
                report_id
            )));
        }
        Ok(())
    }

    pub fn mark_report_failed(&self, report_id: &str, reason: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE daily_reports SET generation_status = 'failed', failure_reason = ?2
             WHERE report_id = ?1 AND generation_status = 'running'",
            params![report_id, reason],
        )?;
        Ok(())
    }

    /// Count of reports currently `running`; used by scheduler tests to
    /// assert the concurrency bound.
    pub fn running_report_count(&self) -> EngineResult<u32> {
        let conn = self.lock();
        let n: u32 = conn.query_row(
            "SELECT COUNT(*) FROM daily_reports WHERE generation_status = 'running'",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    /// TTL purge: delete reports whose report_date is older than `cutoff`
    /// (a "YYYY-MM-DD" string). Returns rows removed.
    pub fn purge_reports_before(&self, cutoff: &str) -> EngineResult<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM daily_reports WHERE report_date < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str, user: &str, date: &str) -> DailyReport {
        DailyReport {
            report_id: id.into(),
            user_id: user.into(),
            tenant_id: "default".into(),
            node_pubkey: "02abc".into(),
            report_date: date.into(),
            generation_status: ReportStatus::Pending,
            attempt_count: 0,
            sections: vec![],
            decisions_summary: String::new(),
            generated_at: None,
            failure_reason: None,
        }
    }

    #[test]
    fn compound_uniqueness_holds() {
        let store = Store::open_in_memory().unwrap();
        store.insert_report(&report("r1", "u1", "2026-07-01")).unwrap();
        let err = store.insert_report(&report("r2", "u1", "2026-07-01")).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        // Different date is fine.
        store.insert_report(&report("r3", "u1", "2026-07-02")).unwrap();
    }

    #[test]
    fn claim_bumps_attempts_and_sets_running() {
        let store = Store::open_in_memory().unwrap();
        store.insert_report(&report("r1", "u1", "2026-07-01")).unwrap();
        assert_eq!(store.claim_report_attempt("r1").unwrap(), 1);
        assert_eq!(store.claim_report_attempt("r1").unwrap(), 2);
        let r = store.get_report("u1", "2026-07-01").unwrap().unwrap();
        assert_eq!(r.generation_status, ReportStatus::Running);
        assert_eq!(r.attempt_count, 2);
    }

    #[test]
    fn succeeded_is_terminal() {
        let store = Store::open_in_memory().unwrap();
        store.insert_report(&report("r1", "u1", "2026-07-01")).unwrap();
        store.claim_report_attempt("r1").unwrap();
        let sections = vec![ReportSection { title: "Health".into(), body: "ok".into() }];
        store
            .mark_report_succeeded("r1", "02abc", &sections, "1 noop", "2026-07-01T06:00:10Z")
            .unwrap();
        // Terminal: cannot claim again.
        assert!(store.claim_report_attempt("r1").is_err());
        let r = store.get_report("u1", "2026-07-01").unwrap().unwrap();
        assert_eq!(r.generation_status, ReportStatus::Succeeded);
        assert_eq!(r.sections.len(), 1);
    }

    #[test]
    fn failed_is_reclaimable() {
        let store = Store::open_in_memory().unwrap();
        store.insert_report(&report("r1", "u1", "2026-07-01")).unwrap();
        store.claim_report_attempt("r1").unwrap();
        store.mark_report_failed("r1", "timeout").unwrap();
        let r = store.get_report("u1", "2026-07-01").unwrap().unwrap();
        assert_eq!(r.generation_status, ReportStatus::Failed);
        assert_eq!(r.failure_reason.as_deref(), Some("timeout"));
        assert_eq!(store.claim_report_attempt("r1").unwrap(), 2);
    }

    #[test]
    fn purge_drops_old_reports() {
        let store = Store::open_in_memory().unwrap();
        store.insert_report(&report("r1", "u1", "2026-01-01")).unwrap();
        store.insert_report(&report("r2", "u2", "2026-07-01")).unwrap();
        let n = store.purge_reports_before("2026-04-01").unwrap();
        assert_eq!(n, 1);
        assert!(store.get_report("u2", "2026-07-01").unwrap().is_some());
    }
}
