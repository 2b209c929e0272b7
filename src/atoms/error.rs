// ── Moniteur Atoms: Error Taxonomy ─────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Exactly seven kinds; every failure in the system is one of them.
//   • External errors (reqwest, rusqlite, serde_json, io) are mapped ONCE,
//     at the boundary where they occur; never re-classified upstream.
//   • `retriable()` drives every retry loop in the crate; components never
//     inspect message text to decide whether to retry.
//   • No variant carries secret material (API keys, auth headers).

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient external failure (network reset, 5xx, 429). Retriable.
    #[error("transient: {0}")]
    Transient(String),

    /// Permanent failure (4xx, malformed payload from our side). Not retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Deadline elapsed before the operation finished. Retriable.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Circuit breaker open for the target; call was never attempted.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Entity absent. On optional reads this is absence, not failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness / idempotency collision; the other writer won.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Validation failure (config, schema parse, invariant violation).
    #[error("invalid: {0}")]
    Invalid(String),
}

/// Discriminant-only view of `EngineError`, used for metric labels and the
/// HTTP error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Timeout,
    Unavailable,
    NotFound,
    Conflict,
    Invalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Invalid => "invalid",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Permanent(_) => ErrorKind::Permanent,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Unavailable(_) => ErrorKind::Unavailable,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Invalid(_) => ErrorKind::Invalid,
        }
    }

    /// Whether a retry with backoff can plausibly succeed.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::Timeout(_) | EngineError::Unavailable(_)
        )
    }

    /// Shorthand constructors; keep call sites one line.
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        EngineError::Permanent(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::Transient(msg.into())
    }
}

// ── Boundary mappings ──────────────────────────────────────────────────────
// These are the ONLY places external error types become engine kinds.

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound("query returned no rows".into())
            }
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::Conflict(e.to_string())
            }
            _ => EngineError::Permanent(format!("sqlite: {}", e)),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout(e.to_string())
        } else {
            EngineError::Transient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Invalid(format!("json: {}", e))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transient(format!("io: {}", e))
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(EngineError::Transient("x".into()).retriable());
        assert!(EngineError::Timeout("x".into()).retriable());
        assert!(EngineError::Unavailable("x".into()).retriable());
        assert!(!EngineError::Permanent("x".into()).retriable());
        assert!(!EngineError::Invalid("x".into()).retriable());
        assert!(!EngineError::NotFound("x".into()).retriable());
        assert!(!EngineError::Conflict("x".into()).retriable());
    }

    #[test]
    fn sqlite_no_rows_maps_to_not_found() {
        let e: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn sqlite_constraint_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY);").unwrap();
        conn.execute("INSERT INTO t (id) VALUES ('a')", []).unwrap();
        let dup = conn.execute("INSERT INTO t (id) VALUES ('a')", []).unwrap_err();
        let e: EngineError = dup.into();
        assert_eq!(e.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn json_parse_maps_to_invalid() {
        let e: EngineError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(e.kind(), ErrorKind::Invalid);
    }
}
