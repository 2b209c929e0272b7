// ── Store: KV Cache ────────────────────────────────────────────────────────
// TTL'd key/value rows for retrieval results and reasoning answers.
// Expired rows are dropped lazily on read and swept opportunistically by
// the scheduler. Pattern invalidation is a SQL LIKE delete; cache keys are
// built so every dependent of an embed_version shares a prefix.

use chrono::Utc;
use rusqlite::params;

use super::Store;
use crate::atoms::error::EngineResult;

impl Store {
    /// Get a non-expired value. An expired row is deleted and reported as
    /// absent.
    pub fn cache_get(&self, key: &str) -> EngineResult<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT value, expires_at FROM kv_cache WHERE key = ?1")?;
        let row: Option<(String, String)> = stmt
            .query_map(params![key], |r| Ok((r.get(0)?, r.get(1)?)))?
            .next()
            .transpose()?;

        match row {
            None => Ok(None),
            Some((value, expires_at)) => {
                if expires_at <= Utc::now().to_rfc3339() {
                    conn.execute("DELETE FROM kv_cache WHERE key = ?1", params![key])?;
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
        }
    }

    pub fn cache_set(&self, key: &str, value: &str, ttl_secs: u64) -> EngineResult<()> {
        let expires_at = (Utc::now() + chrono::Duration::seconds(ttl_secs as i64)).to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv_cache (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    pub fn cache_delete(&self, key: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv_cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Delete every key matching a SQL LIKE pattern. Returns rows removed.
    pub fn cache_delete_pattern(&self, pattern: &str) -> EngineResult<usize> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM kv_cache WHERE key LIKE ?1", params![pattern])?;
        Ok(n)
    }

    /// Sweep expired rows. Returns rows removed.
    pub fn cache_purge_expired(&self) -> EngineResult<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM kv_cache WHERE expires_at <= ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
