// ── Moniteur Engine: HTTP Retry & Circuit Breakers ─────────────────────────
//
// Shared retry utilities used by every external adapter (node data provider,
// node-control daemon, LLM, embeddings).
//
// Features:
//   • Exponential backoff with ±25% jitter (base 1s, max 30s, 3 retries)
//   • Retry on 429 (rate limit), 500, 502, 503, 504
//   • Respects `Retry-After` header
//   • Per-target circuit breaker: closed → open → half-open with a bounded
//     probe count, exposed as a numeric state for the metrics gauge
//   • Shared reqwest::Client factory (one connection pool for all targets)

use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

// ── Constants ──────────────────────────────────────────────────────────────

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry delay in milliseconds (doubles each attempt).
const INITIAL_RETRY_DELAY_MS: u64 = 1_000;

/// Maximum retry delay cap in milliseconds (30 seconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Sleep with exponential backoff + ±25% jitter.
/// Respects Retry-After if the server sent one.
/// Returns the actual delay duration for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.min(10));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        // Use server-specified delay, but cap at 60s and floor at our computed backoff
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    let delay = Duration::from_millis(apply_jitter(delay_ms));
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(100);
    }
    let offset = (rand_jitter() % (2 * jitter_range + 1)) - jitter_range;
    let result = base_ms as i64 + offset;
    result.max(100) as u64
}

/// Simple jitter source using system clock nanos (no extra crate needed).
fn rand_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented; falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Circuit Breaker ────────────────────────────────────────────────────────

/// Numeric breaker state for the `circuit_breaker_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

/// A circuit breaker that trips open after N consecutive failures within a
/// rolling window, rejects calls for a cooldown, then admits a bounded
/// number of half-open probes.
///
/// States:
///   Closed   — normal operation, requests pass through
///   Open     — rejecting requests (cooldown active)
///   HalfOpen; cooldown expired, up to `half_open_max_probes` concurrent
///              probes allowed; success closes, failure re-opens
pub struct CircuitBreaker {
    /// Number of consecutive failures.
    consecutive_failures: AtomicU32,
    /// Timestamp (epoch secs) of the first failure in the current streak.
    streak_started_at: AtomicU64,
    /// Timestamp (epoch secs) when the circuit was tripped open; 0 = not open.
    tripped_at: AtomicU64,
    /// Probes currently in flight while half-open.
    inflight_probes: AtomicU32,
    /// Number of consecutive failures before tripping.
    threshold: u32,
    /// Failures only count toward the threshold within this window.
    failure_window_secs: u64,
    /// Cooldown period in seconds while circuit is open.
    reset_timeout_secs: u64,
    /// Concurrent probes admitted while half-open.
    half_open_max_probes: u32,
}

/// RAII guard for a half-open probe slot. Dropping without an explicit
/// success/failure report releases the slot (counts as neither).
pub struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    released: bool,
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.breaker.inflight_probes.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Outcome of `CircuitBreaker::admit`.
pub enum Admission<'a> {
    /// Circuit closed; proceed normally.
    Closed,
    /// Circuit half-open; proceed as a probe; hold the permit for the call.
    Probe(ProbePermit<'a>),
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    /// - `threshold`: consecutive failures before tripping (default 5)
    /// - `failure_window_secs`: streak must fit in this window (default 60)
    /// - `reset_timeout_secs`: cooldown before half-open (default 30)
    /// - `half_open_max_probes`: concurrent probes while half-open (default 1)
    pub const fn new(
        threshold: u32,
        failure_window_secs: u64,
        reset_timeout_secs: u64,
        half_open_max_probes: u32,
    ) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            streak_started_at: AtomicU64::new(0),
            tripped_at: AtomicU64::new(0),
            inflight_probes: AtomicU32::new(0),
            threshold,
            failure_window_secs,
            reset_timeout_secs,
            half_open_max_probes,
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Current state, for the metrics gauge.
    pub fn state(&self) -> BreakerState {
        let tripped = self.tripped_at.load(Ordering::SeqCst);
        if tripped == 0 {
            return BreakerState::Closed;
        }
        if Self::now_secs().saturating_sub(tripped) < self.reset_timeout_secs {
            BreakerState::Open
        } else {
            BreakerState::HalfOpen
        }
    }

    /// Ask to make a call. `Err` carries the seconds remaining in cooldown.
    pub fn admit(&self) -> Result<Admission<'_>, u64> {
        match self.state() {
            BreakerState::Closed => Ok(Admission::Closed),
            BreakerState::Open => {
                let tripped = self.tripped_at.load(Ordering::SeqCst);
                let elapsed = Self::now_secs().saturating_sub(tripped);
                Err(self.reset_timeout_secs.saturating_sub(elapsed))
            }
            BreakerState::HalfOpen => {
                // Admit at most half_open_max_probes concurrent probes.
                let prev = self.inflight_probes.fetch_add(1, Ordering::SeqCst);
                if prev >= self.half_open_max_probes {
                    self.inflight_probes.fetch_sub(1, Ordering::SeqCst);
                    return Err(0);
                }
                Ok(Admission::Probe(ProbePermit { breaker: self, released: false }))
            }
        }
    }

    /// Record a successful request; closes the circuit and resets counters.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.streak_started_at.store(0, Ordering::SeqCst);
        self.tripped_at.store(0, Ordering::SeqCst);
    }

    /// Record a failed request. While half-open this re-opens immediately
    /// with a fresh cooldown clock; while closed it counts toward the
    /// threshold within the rolling window.
    pub fn record_failure(&self) {
        let now = Self::now_secs();

        if self.state() == BreakerState::HalfOpen {
            self.tripped_at.store(now, Ordering::SeqCst);
            warn!("[breaker] Half-open probe failed — re-opening for {}s", self.reset_timeout_secs);
            return;
        }

        // Reset the streak if its first failure fell outside the window.
        let started = self.streak_started_at.load(Ordering::SeqCst);
        if started == 0 || now.saturating_sub(started) > self.failure_window_secs {
            self.streak_started_at.store(now, Ordering::SeqCst);
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold && self.tripped_at.load(Ordering::SeqCst) == 0 {
            self.tripped_at.store(now, Ordering::SeqCst);
            warn!(
                "[breaker] Tripped after {} consecutive failures — cooling down {}s",
                failures, self.reset_timeout_secs
            );
        }
    }

    /// Report the outcome of a probe admitted while half-open.
    pub fn finish_probe(&self, permit: ProbePermit<'_>, success: bool) {
        let mut permit = permit;
        permit.released = true;
        self.inflight_probes.fetch_sub(1, Ordering::SeqCst);
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }
}

// ── Per-target breaker registry ────────────────────────────────────────────

/// One breaker per external target, created lazily with shared settings.
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    threshold: u32,
    failure_window_secs: u64,
    reset_timeout_secs: u64,
    half_open_max_probes: u32,
}

impl BreakerRegistry {
    pub fn new(
        threshold: u32,
        failure_window_secs: u64,
        reset_timeout_secs: u64,
        half_open_max_probes: u32,
    ) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            threshold,
            failure_window_secs,
            reset_timeout_secs,
            half_open_max_probes,
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock();
        map.entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.threshold,
                    self.failure_window_secs,
                    self.reset_timeout_secs,
                    self.half_open_max_probes,
                ))
            })
            .clone()
    }

    /// (target, numeric state) pairs for the metrics gauge.
    pub fn states(&self) -> Vec<(String, u8)> {
        self.breakers
            .lock()
            .iter()
            .map(|(t, b)| (t.clone(), b.state() as u8))
            .collect()
    }
}

// ── Shared HTTP client ─────────────────────────────────────────────────────

/// Build the shared reqwest::Client used by all adapters; one connection
/// pool, rustls TLS, bounded connect timeout. The per-call timeout is set
/// by each adapter from config.
pub fn build_client(call_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(call_timeout)
        .build()
        .expect("failed to build reqwest client")
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn parse_retry_after_valid() {
        assert_eq!(parse_retry_after("5"), Some(5));
        assert_eq!(parse_retry_after(" 30 "), Some(30));
        assert_eq!(parse_retry_after("not-a-number"), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        for base in [100, 1000, 5000, 30_000] {
            let result = apply_jitter(base);
            let lower = (base as f64 * 0.7) as u64;
            let upper = (base as f64 * 1.3) as u64;
            assert!(
                result >= lower.max(100) && result <= upper,
                "jitter({}) = {} not in [{}, {}]",
                base,
                result,
                lower,
                upper
            );
        }
    }

    #[test]
    fn breaker_trips_after_threshold() {
        let cb = CircuitBreaker::new(5, 60, 30, 1);
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        cb.record_failure(); // 5th failure trips
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.admit().is_err());
    }

    #[test]
    fn breaker_resets_on_success() {
        let cb = CircuitBreaker::new(3, 60, 30, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed); // only 2 since reset
    }

    #[test]
    fn breaker_half_open_probe_success_closes() {
        let cb = CircuitBreaker::new(1, 60, 0, 1); // 0s cooldown → instant half-open
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let admission = cb.admit().expect("probe admitted");
        let permit = match admission {
            Admission::Probe(p) => p,
            Admission::Closed => panic!("expected probe"),
        };
        // A second concurrent probe must be rejected.
        assert!(cb.admit().is_err());

        cb.finish_probe(permit, true);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::new(1, 60, 1, 1);
        cb.record_failure();
        // Force the cooldown to appear elapsed.
        cb.tripped_at.store(CircuitBreaker::now_secs() - 2, Ordering::SeqCst);
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let permit = match cb.admit().expect("probe admitted") {
            Admission::Probe(p) => p,
            Admission::Closed => panic!("expected probe"),
        };
        cb.finish_probe(permit, false);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn breaker_streak_expires_outside_window() {
        let cb = CircuitBreaker::new(3, 1, 30, 1);
        cb.record_failure();
        cb.record_failure();
        // Age the streak past the window; the next failure starts a new one.
        cb.streak_started_at
            .store(CircuitBreaker::now_secs() - 5, Ordering::SeqCst);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_reuses_breaker_per_target() {
        let reg = BreakerRegistry::new(5, 60, 30, 1);
        let a = reg.get("node_data");
        let b = reg.get("node_data");
        assert!(Arc::ptr_eq(&a, &b));
        a.record_failure();
        let states = reg.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].1, 0);
    }
}
