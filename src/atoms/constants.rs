// ── Moniteur Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Fee policy bounds ──────────────────────────────────────────────────────
// Hard bounds on any fee target the engine will ever emit, in ppm.
// A target outside this band is a bug, not an opinion.
pub const FEE_RATE_PPM_MIN: u32 = 50;
pub const FEE_RATE_PPM_MAX: u32 = 2_500;

/// Relative fee change below which an update decision is not worth emitting.
pub const FEE_MIN_RELATIVE_CHANGE: f64 = 0.10;

// ── Chunking ───────────────────────────────────────────────────────────────
// Target chunk size in estimated tokens and the overlap carried between
// consecutive chunks. Token estimate is the 4-chars-per-token heuristic.
pub const CHUNK_TARGET_TOKENS: usize = 800;
pub const CHUNK_OVERLAP_RATIO: f64 = 0.15;
/// A sentence boundary found within this trailing fraction of the window
/// wins over a hard cut.
pub const CHUNK_BOUNDARY_SEARCH_RATIO: f64 = 0.20;
pub const CHARS_PER_TOKEN: usize = 4;

// ── Retrieval ──────────────────────────────────────────────────────────────
/// Candidate multiplier per leg: each of the vector and lexical searches
/// fetches k × this many candidates before fusion.
pub const RETRIEVAL_CANDIDATE_FACTOR: usize = 3;
/// Reciprocal-rank-fusion smoothing constant.
pub const RRF_K: f64 = 60.0;

// ── Ingestion ──────────────────────────────────────────────────────────────
/// A job fails only when more than this fraction of items fail.
pub const MAX_ITEM_FAILURE_RATIO: f64 = 0.05;
/// Retriable per-item errors requeue the item up to this many times.
pub const INGEST_ITEM_MAX_RETRIES: u32 = 3;

// ── Scheduler backoff ──────────────────────────────────────────────────────
// Per-user report retries wait 30s × 2^(k−1) between attempts.
pub const REPORT_RETRY_BASE_SECS: u64 = 30;

// ── Report retention ───────────────────────────────────────────────────────
/// Daily reports become purge-eligible this many days after report_date.
pub const REPORT_TTL_DAYS: i64 = 90;

// ── Cache key prefixes ─────────────────────────────────────────────────────
// Cache keys embed the embed_version so an alias flip can invalidate every
// dependent entry with one pattern delete. Treat as stable identifiers.
pub const RETRIEVAL_CACHE_PREFIX: &str = "retrieval";
pub const ANSWER_CACHE_PREFIX: &str = "answer";
