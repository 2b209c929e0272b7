// ── Moniteur Engine: Daily Report Scheduler ────────────────────────────────
// A 60-second heartbeat loop that fires once per day at the configured UTC
// wall-clock time. Single-trigger semantics: a fire missed during downtime
// is not back-filled; on startup, a fire time already in the past counts
// as consumed and the next day's trigger applies.
//
// Per trigger: enumerate enrolled users, dispatch through a bounded worker
// pool, retry each user's report on non-permanent failures with 30s × 2^k
// backoff, and emit a pass summary. Shutdown stops new launches and gives
// in-flight reports `graceful_timeout` to finish; abandoned rows stay
// `running` and are picked up the next day unless the per-day attempt cap
// is spent.

use chrono::{DateTime, Timelike, Utc};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::atoms::constants::REPORT_TTL_DAYS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ReportStatus, UserProfile};
use crate::engine::config::SchedulerConfig;
use crate::engine::metrics::Metrics;
use crate::engine::reports::ReportGenerator;
use crate::engine::store::Store;

/// Heartbeat interval between trigger checks.
const HEARTBEAT_SECS: u64 = 60;

/// Upper bound on one whole scheduler pass.
const PASS_TIMEOUT_SECS: u64 = 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// True when `now` has reached today's fire time.
pub fn fire_time_reached(config: &SchedulerConfig, now: &DateTime<Utc>) -> bool {
    (now.hour() as u8, now.minute() as u8) >= (config.hour, config.minute)
}

pub struct Scheduler {
    store: Arc<Store>,
    generator: Arc<ReportGenerator>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
    max_attempts_per_day: u32,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        generator: Arc<ReportGenerator>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
        max_attempts_per_day: u32,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self { store, generator, metrics, config, max_attempts_per_day, shutdown }
    }

    /// The heartbeat loop. Runs until the shutdown flag is set.
    pub async fn run(&self) {
        // No back-fill: a fire time already past at startup is consumed.
        let now = Utc::now();
        let mut last_fired_date = if fire_time_reached(&self.config, &now) {
            Some(now.format("%Y-%m-%d").to_string())
        } else {
            None
        };
        info!(
            "[scheduler] Heartbeat started — daily fire at {:02}:{:02} UTC",
            self.config.hour, self.config.minute
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("[scheduler] Shutdown — heartbeat stopped");
                return;
            }

            let now = Utc::now();
            let today = now.format("%Y-%m-%d").to_string();
            if fire_time_reached(&self.config, &now) && last_fired_date.as_deref() != Some(&today) {
                last_fired_date = Some(today.clone());
                let pass = tokio::time::timeout(
                    Duration::from_secs(PASS_TIMEOUT_SECS),
                    self.run_pass(&today),
                )
                .await;
                match pass {
                    Ok(Ok(summary)) => info!(
                        "[scheduler] Pass {} done: {} ok, {} failed, {} skipped of {}",
                        today, summary.succeeded, summary.failed, summary.skipped, summary.total
                    ),
                    Ok(Err(e)) => warn!("[scheduler] Pass {} errored: {}", today, e),
                    Err(_) => warn!("[scheduler] Pass {} exceeded {}s", today, PASS_TIMEOUT_SECS),
                }
                self.housekeeping();
            }

            tokio::time::sleep(Duration::from_secs(HEARTBEAT_SECS)).await;
        }
    }

    /// One full pass over the enrolled users for `report_date`.
    pub async fn run_pass(&self, report_date: &str) -> EngineResult<PassSummary> {
        let users = self.store.report_enabled_users()?;
        let mut summary = PassSummary { total: users.len(), ..Default::default() };
        info!("[scheduler] Pass {}: {} enrolled user(s)", report_date, summary.total);

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_concurrent));
        let mut workers: JoinSet<UserOutcome> = JoinSet::new();

        for user in users {
            if self.shutdown.load(Ordering::Relaxed) {
                summary.skipped += 1;
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("scheduler semaphore closed");
            let generator = self.generator.clone();
            let store = self.store.clone();
            let date = report_date.to_string();
            let max_retries = self.config.max_retries;
            let retry_base = self.config.retry_base_secs;
            let max_attempts = self.max_attempts_per_day;
            let shutdown = self.shutdown.clone();
            workers.spawn(async move {
                let _permit = permit;
                run_user(
                    generator, store, user, &date, max_retries, retry_base, max_attempts, shutdown,
                )
                .await
            });
        }

        // Drain with a short poll so shutdown is observed between joins.
        loop {
            if workers.is_empty() {
                break;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                let graceful = Duration::from_secs(self.config.graceful_timeout_s);
                let drained = tokio::time::timeout(graceful, async {
                    while let Some(joined) = workers.join_next().await {
                        if let Ok(outcome) = joined {
                            tally(&mut summary, outcome);
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!(
                        "[scheduler] Graceful window elapsed — {} report(s) left running",
                        workers.len()
                    );
                    workers.abort_all();
                }
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), workers.join_next()).await {
                Ok(Some(joined)) => {
                    if let Ok(outcome) = joined {
                        tally(&mut summary, outcome);
                    }
                }
                Ok(None) => break,
                Err(_) => continue, // heartbeat tick; re-check shutdown
            }
        }

        self.metrics.add_counter("scheduler_pass_users_total", &[("outcome", "succeeded")], summary.succeeded as u64);
        self.metrics.add_counter("scheduler_pass_users_total", &[("outcome", "failed")], summary.failed as u64);
        self.metrics.add_counter("scheduler_pass_users_total", &[("outcome", "skipped")], summary.skipped as u64);
        Ok(summary)
    }

    /// Opportunistic sweeps after each pass: expired cache rows and reports
    /// past their 90-day TTL.
    fn housekeeping(&self) {
        if let Ok(n) = self.store.cache_purge_expired() {
            if n > 0 {
                info!("[scheduler] Swept {} expired cache row(s)", n);
            }
        }
        let cutoff = (Utc::now() - chrono::Duration::days(REPORT_TTL_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        match self.store.purge_reports_before(&cutoff) {
            Ok(n) if n > 0 => info!("[scheduler] Purged {} report(s) older than {}", n, cutoff),
            Ok(_) => {}
            Err(e) => warn!("[scheduler] Report purge failed: {}", e),
        }
    }
}

fn tally(summary: &mut PassSummary, outcome: UserOutcome) {
    match outcome {
        UserOutcome::Succeeded => summary.succeeded += 1,
        UserOutcome::Failed => summary.failed += 1,
        UserOutcome::Skipped => summary.skipped += 1,
    }
}

/// One user's report with retry. Non-permanent failures back off
/// `retry_base × 2^(k−1)` between attempts; the per-day attempt cap from
/// previous passes is honored before any work starts.
#[allow(clippy::too_many_arguments)]
async fn run_user(
    generator: Arc<ReportGenerator>,
    store: Arc<Store>,
    user: UserProfile,
    report_date: &str,
    max_retries: u32,
    retry_base_secs: u64,
    max_attempts_per_day: u32,
    shutdown: Arc<AtomicBool>,
) -> UserOutcome {
    // Attempt-cap check against work done by earlier passes/restarts.
    if let Ok(Some(existing)) = store.get_report(&user.user_id, report_date) {
        match existing.generation_status {
            ReportStatus::Succeeded => return UserOutcome::Succeeded,
            _ if existing.attempt_count >= max_attempts_per_day => {
                info!(
                    "[scheduler] {}: attempt cap reached ({}) — skipping",
                    user.user_id, existing.attempt_count
                );
                return UserOutcome::Skipped;
            }
            _ => {}
        }
    }

    for attempt in 1..=max_retries {
        match generator.generate(&user.user_id, report_date).await {
            Ok(_) => return UserOutcome::Succeeded,
            Err(e) if e.retriable() && attempt < max_retries => {
                if shutdown.load(Ordering::Relaxed) {
                    return UserOutcome::Failed;
                }
                let backoff = retry_base_secs * 2u64.pow(attempt - 1);
                warn!(
                    "[scheduler] {}: attempt {} failed ({}), retrying in {}s",
                    user.user_id, attempt, e, backoff
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
            Err(e) => {
                warn!("[scheduler] {}: giving up ({})", user.user_id, e);
                return UserOutcome::Failed;
            }
        }
    }
    UserOutcome::Failed
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(hour: u8, minute: u8) -> SchedulerConfig {
        SchedulerConfig { hour, minute, ..Default::default() }
    }

    #[test]
    fn fire_time_comparison() {
        let cfg = config(6, 0);
        let before = Utc.with_ymd_and_hms(2026, 7, 1, 5, 59, 0).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 6, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 7, 1, 23, 0, 0).unwrap();
        assert!(!fire_time_reached(&cfg, &before));
        assert!(fire_time_reached(&cfg, &at));
        assert!(fire_time_reached(&cfg, &after));
    }

    #[test]
    fn fire_time_with_minutes() {
        let cfg = config(6, 30);
        let just_before = Utc.with_ymd_and_hms(2026, 7, 1, 6, 29, 59).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 6, 30, 0).unwrap();
        assert!(!fire_time_reached(&cfg, &just_before));
        assert!(fire_time_reached(&cfg, &at));
    }
}
