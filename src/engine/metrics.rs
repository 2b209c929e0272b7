// ── Moniteur Engine: Metrics Registry ──────────────────────────────────────
//
// In-process counters, gauges, and histograms rendered in the Prometheus
// text exposition format at GET /metrics. Small and deliberately boring:
// label sets are short, series are keyed by a canonical "name{labels}"
// string, and rendering sorts keys so output is deterministic.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Instant;

/// Histogram bucket upper bounds, in seconds. Chosen for external-call and
/// report-generation latencies (10ms .. 5min).
const DURATION_BUCKETS: [f64; 10] =
    [0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0, 300.0];

#[derive(Default)]
struct Histogram {
    bucket_counts: [u64; DURATION_BUCKETS.len()],
    count: u64,
    sum: f64,
}

/// The process-wide metrics registry. One instance lives in `EngineState`;
/// components receive `&Metrics` and record through typed helpers.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
    histograms: Mutex<BTreeMap<String, Histogram>>,
}

/// Render a label set as `{k1="v1",k2="v2"}` (empty string for no labels).
fn label_suffix(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "'")))
        .collect();
    format!("{{{}}}", inner.join(","))
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Recording ──────────────────────────────────────────────────────────

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_counter(name, labels, 1);
    }

    pub fn add_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        let key = format!("{}{}", name, label_suffix(labels));
        *self.counters.lock().entry(key).or_insert(0) += delta;
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = format!("{}{}", name, label_suffix(labels));
        self.gauges.lock().insert(key, value);
    }

    pub fn observe_duration(&self, name: &str, labels: &[(&str, &str)], seconds: f64) {
        let key = format!("{}{}", name, label_suffix(labels));
        let mut map = self.histograms.lock();
        let h = map.entry(key).or_default();
        h.count += 1;
        h.sum += seconds;
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                h.bucket_counts[i] += 1;
            }
        }
    }

    /// Time a closure's wall clock into a histogram. For async callers use
    /// `Instant` + `observe_duration` directly.
    pub fn time<T>(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.observe_duration(name, labels, start.elapsed().as_secs_f64());
        out
    }

    // ── Domain helpers (keep label vocabularies in one place) ──────────────

    pub fn record_external_call(&self, target: &str, seconds: f64) {
        self.inc_counter("requests_total", &[("target", target)]);
        self.observe_duration("request_duration_seconds", &[("target", target)], seconds);
    }

    pub fn record_external_error(&self, target: &str, kind: &str) {
        self.inc_counter("external_call_errors_total", &[("target", target), ("kind", kind)]);
    }

    pub fn record_cache(&self, cache: &str, hit: bool) {
        let name = if hit { "cache_hits_total" } else { "cache_misses_total" };
        self.inc_counter(name, &[("cache", cache)]);
    }

    pub fn record_report(&self, outcome: &str) {
        self.inc_counter("reports_generated_total", &[("outcome", outcome)]);
    }

    pub fn record_decision(&self, decision_type: &str, status: &str) {
        self.inc_counter(
            "decisions_total",
            &[("type", decision_type), ("status", status)],
        );
    }

    pub fn set_breaker_state(&self, target: &str, state: u8) {
        self.set_gauge("circuit_breaker_state", &[("target", target)], state as f64);
    }

    // ── Rendering ──────────────────────────────────────────────────────────

    /// Prometheus text exposition format. Keys are BTreeMap-sorted so the
    /// output is stable between scrapes.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for (key, value) in self.counters.lock().iter() {
            out.push_str(&format!("{} {}\n", key, value));
        }

        for (key, value) in self.gauges.lock().iter() {
            out.push_str(&format!("{} {}\n", key, value));
        }

        for (key, h) in self.histograms.lock().iter() {
            // Split "name{labels}" so bucket labels merge with series labels.
            let (name, labels) = match key.find('{') {
                Some(idx) => (&key[..idx], key[idx + 1..key.len() - 1].to_string()),
                None => (key.as_str(), String::new()),
            };
            let join = |extra: &str| {
                if labels.is_empty() {
                    format!("{{{}}}", extra)
                } else {
                    format!("{{{},{}}}", labels, extra)
                }
            };
            for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                out.push_str(&format!(
                    "{}_bucket{} {}\n",
                    name,
                    join(&format!("le=\"{}\"", bound)),
                    h.bucket_counts[i]
                ));
            }
            out.push_str(&format!("{}_bucket{} {}\n", name, join("le=\"+Inf\""), h.count));
            if labels.is_empty() {
                out.push_str(&format!("{}_sum {}\n", name, h.sum));
                out.push_str(&format!("{}_count {}\n", name, h.count));
            } else {
                out.push_str(&format!("{}_sum{{{}}} {}\n", name, labels, h.sum));
                out.push_str(&format!("{}_count{{{}}} {}\n", name, labels, h.count));
            }
        }

        out
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_per_label_set() {
        let m = Metrics::new();
        m.record_external_error("node_ctl", "transient");
        m.record_external_error("node_ctl", "transient");
        m.record_external_error("node_ctl", "timeout");
        let text = m.render();
        assert!(text.contains(
            "external_call_errors_total{target=\"node_ctl\",kind=\"transient\"} 2"
        ));
        assert!(text.contains(
            "external_call_errors_total{target=\"node_ctl\",kind=\"timeout\"} 1"
        ));
    }

    #[test]
    fn gauge_overwrites() {
        let m = Metrics::new();
        m.set_breaker_state("llm", 1);
        m.set_breaker_state("llm", 0);
        assert!(m.render().contains("circuit_breaker_state{target=\"llm\"} 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let m = Metrics::new();
        m.observe_duration("request_duration_seconds", &[("target", "llm")], 0.02);
        m.observe_duration("request_duration_seconds", &[("target", "llm")], 0.3);
        let text = m.render();
        // 0.02 lands in le=0.025 and everything above; 0.3 from le=0.5 up.
        assert!(text.contains("request_duration_seconds_bucket{target=\"llm\",le=\"0.025\"} 1"));
        assert!(text.contains("request_duration_seconds_bucket{target=\"llm\",le=\"0.5\"} 2"));
        assert!(text.contains("request_duration_seconds_bucket{target=\"llm\",le=\"+Inf\"} 2"));
        assert!(text.contains("request_duration_seconds_count{target=\"llm\"} 2"));
    }

    #[test]
    fn cache_hit_miss_series() {
        let m = Metrics::new();
        m.record_cache("retrieval", true);
        m.record_cache("retrieval", false);
        let text = m.render();
        assert!(text.contains("cache_hits_total{cache=\"retrieval\"} 1"));
        assert!(text.contains("cache_misses_total{cache=\"retrieval\"} 1"));
    }

    #[test]
    fn render_is_deterministic() {
        let m = Metrics::new();
        m.record_decision("update_fee", "rejected");
        m.record_decision("noop", "pending");
        assert_eq!(m.render(), m.render());
    }
}
