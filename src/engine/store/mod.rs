// ── Moniteur Engine: Store ─────────────────────────────────────────────────
// All persistence in one SQLite database via rusqlite.
//
// Module layout:
//   schema       — idempotent migrations + schema constants
//   documents    — document/chunk CRUD + FTS5 lexical search
//   vectors      — physical vector indexes, embeddings, alias swap
//   decisions    — decision ledger + rollback entries
//   reports      — daily reports (compound uniqueness + TTL purge)
//   users        — operator profiles
//   cache        — KV cache with TTL and pattern invalidation
//   vector_math  — f32↔bytes, cosine similarity
//
// Locking rule: the connection mutex is held only across synchronous SQLite
// statements, never across an await point.

use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

use crate::atoms::error::EngineResult;

mod cache;
mod decisions;
mod documents;
mod reports;
mod schema;
mod users;
mod vectors;
pub(crate) mod vector_math;

pub use vector_math::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};

/// Thread-safe database wrapper.
pub struct Store {
    /// The SQLite connection, protected by a Mutex.
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("[store] Opening store at {}", path.display());

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();

        schema::run_migrations(&conn)?;

        Ok(Store { conn: Mutex::new(conn) })
    }

    /// In-memory store with the full schema. Used by the test suites.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    /// Cheap readiness probe; one round-trip through the connection.
    pub fn ping(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Borrow the connection for a module-internal operation.
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
