// ── Store: Schema & Migrations ─────────────────────────────────────────────
// All statements are idempotent (CREATE IF NOT EXISTS / ADD COLUMN with
// silent error), so migrations run unconditionally at every open.

use log::info;
use rusqlite::Connection;

use crate::atoms::error::EngineResult;

pub fn run_migrations(conn: &Connection) -> EngineResult<()> {
    info!("[store] Running schema migrations");
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = "
    -- ═══════════════════════════════════════════════════════════════
    -- Documents & Chunks (RAG corpus)
    -- Documents are immutable after ingestion; chunks are derived and
    -- keyed deterministically so re-ingestion is idempotent.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_uri TEXT NOT NULL,
        content TEXT NOT NULL,
        doc_type TEXT NOT NULL DEFAULT 'generic',
        related_node TEXT,
        language TEXT NOT NULL DEFAULT 'en',
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
    );

    CREATE INDEX IF NOT EXISTS idx_documents_type ON documents(doc_type);
    CREATE INDEX IF NOT EXISTS idx_documents_node ON documents(related_node);

    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        text TEXT NOT NULL,
        token_count INTEGER NOT NULL,
        embed_version TEXT NOT NULL,
        UNIQUE(document_id, ordinal, embed_version)
    );

    CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
    CREATE INDEX IF NOT EXISTS idx_chunks_version ON chunks(embed_version);

    -- FTS5 index for the lexical retrieval leg (BM25 ranking).
    -- Synced manually on chunk writes, same pattern as deletes.
    CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
        id UNINDEXED,
        text,
        tokenize='porter unicode61'
    );

    -- ═══════════════════════════════════════════════════════════════
    -- Vector Indexes & Alias
    -- A physical index is a named set of embedding rows; the alias is
    -- a single row flipped atomically at finalize time.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS vector_indexes (
        name TEXT PRIMARY KEY,
        embed_version TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'building',
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
    );

    CREATE TABLE IF NOT EXISTS vector_aliases (
        alias TEXT PRIMARY KEY,
        index_name TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS embeddings (
        index_name TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        model_id TEXT NOT NULL,
        embed_version TEXT NOT NULL,
        vector BLOB NOT NULL,
        PRIMARY KEY (index_name, chunk_id)
    );

    CREATE INDEX IF NOT EXISTS idx_embeddings_index ON embeddings(index_name);

    -- ═══════════════════════════════════════════════════════════════
    -- Decision Ledger & Rollback Entries
    -- A rollback entry exists iff the decision reached 'applied'.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS decisions (
        decision_id TEXT PRIMARY KEY,
        node_pubkey TEXT NOT NULL,
        channel_id TEXT,
        decision_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        rationale_text TEXT NOT NULL DEFAULT '',
        score REAL NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
        status TEXT NOT NULL DEFAULT 'pending',
        status_reason TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_decisions_node ON decisions(node_pubkey);
    CREATE INDEX IF NOT EXISTS idx_decisions_channel ON decisions(channel_id);
    CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status);

    CREATE TABLE IF NOT EXISTS rollback_entries (
        decision_id TEXT PRIMARY KEY,
        prior_state TEXT NOT NULL,
        reversal TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
    );

    -- ═══════════════════════════════════════════════════════════════
    -- Users & Daily Reports
    -- (user_id, report_date) uniqueness is the idempotency anchor for
    -- the whole scheduler path.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL DEFAULT 'default',
        lightning_pubkey TEXT UNIQUE,
        daily_report_enabled INTEGER NOT NULL DEFAULT 1,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        notification_channels TEXT NOT NULL DEFAULT '[]',
        apply_enabled INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS daily_reports (
        report_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL DEFAULT 'default',
        node_pubkey TEXT NOT NULL DEFAULT '',
        report_date TEXT NOT NULL,
        generation_status TEXT NOT NULL DEFAULT 'pending',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        sections TEXT NOT NULL DEFAULT '[]',
        decisions_summary TEXT NOT NULL DEFAULT '',
        generated_at TEXT,
        failure_reason TEXT,
        UNIQUE(user_id, report_date)
    );

    CREATE INDEX IF NOT EXISTS idx_reports_date ON daily_reports(report_date);
    CREATE INDEX IF NOT EXISTS idx_reports_status ON daily_reports(generation_status);

    -- ═══════════════════════════════════════════════════════════════
    -- KV Cache (retrieval results, reasoning answers)
    -- Keys embed the embed_version so an alias flip can invalidate
    -- every dependent entry with one LIKE delete.
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS kv_cache (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv_cache(expires_at);
";
