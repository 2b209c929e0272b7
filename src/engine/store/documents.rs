// ── Store: Documents & Chunks ──────────────────────────────────────────────
// Documents are immutable after insert; chunk writes are idempotent by the
// deterministic chunk id. The FTS5 shadow table is synced manually on every
// chunk write/delete (delete-then-insert, so replacement never duplicates).

use rusqlite::params;

use super::Store;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Chunk, Document, Hit, RetrievalFilters};

impl Document {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Document {
            id: row.get(0)?,
            source_uri: row.get(1)?,
            content: row.get(2)?,
            doc_type: row.get(3)?,
            related_node: row.get(4)?,
            language: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl Store {
    // ── Documents ──────────────────────────────────────────────────────────

    /// Insert a document if absent. Returns true when the row is new.
    /// Documents are content-addressed, so re-ingestion is a no-op here.
    pub fn upsert_document(&self, doc: &Document) -> EngineResult<bool> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO documents
                 (id, source_uri, content, doc_type, related_node, language, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                doc.id,
                doc.source_uri,
                doc.content,
                doc.doc_type,
                doc.related_node,
                doc.language,
                doc.created_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_document(&self, id: &str) -> EngineResult<Option<Document>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_uri, content, doc_type, related_node, language, created_at
             FROM documents WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], Document::from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Explicit purge; the only way a document leaves the corpus.
    /// Removes its chunks, FTS rows, and embeddings in every index.
    pub fn purge_document(&self, id: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM chunks_fts WHERE id IN (SELECT id FROM chunks WHERE document_id = ?1)",
            params![id],
        )?;
        conn.execute(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?1)",
            params![id],
        )?;
        conn.execute("DELETE FROM chunks WHERE document_id = ?1", params![id])?;
        conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Chunks ─────────────────────────────────────────────────────────────

    pub fn upsert_chunk(&self, chunk: &Chunk) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO chunks
                 (id, document_id, ordinal, text, token_count, embed_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                chunk.id,
                chunk.document_id,
                chunk.ordinal,
                chunk.text,
                chunk.token_count,
                chunk.embed_version,
            ],
        )?;
        conn.execute("DELETE FROM chunks_fts WHERE id = ?1", params![chunk.id])?;
        conn.execute(
            "INSERT INTO chunks_fts (id, text) VALUES (?1, ?2)",
            params![chunk.id, chunk.text],
        )?;
        Ok(())
    }

    pub fn chunks_for_document(
        &self,
        document_id: &str,
        embed_version: &str,
    ) -> EngineResult<Vec<Chunk>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, document_id, ordinal, text, token_count, embed_version
             FROM chunks WHERE document_id = ?1 AND embed_version = ?2
             ORDER BY ordinal",
        )?;
        let chunks = stmt
            .query_map(params![document_id, embed_version], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    document_id: row.get(1)?,
                    ordinal: row.get(2)?,
                    text: row.get(3)?,
                    token_count: row.get(4)?,
                    embed_version: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chunks)
    }

    pub fn chunk_count(&self, document_id: &str, embed_version: &str) -> EngineResult<u32> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1 AND embed_version = ?2",
            params![document_id, embed_version],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ── Lexical search (FTS5 BM25) ─────────────────────────────────────────

    /// BM25 full-text search over chunk text, scoped to one embed_version
    /// and the caller's document filters. `score` is the negated FTS5 rank
    /// (higher = better). Empty or symbol-only queries return `[]`.
    pub fn lexical_search(
        &self,
        query: &str,
        embed_version: &str,
        filters: &RetrievalFilters,
        limit: usize,
    ) -> EngineResult<Vec<Hit>> {
        // FTS5 match query; strip quoting, OR the terms together.
        let fts_query = query
            .replace('"', " ")
            .split_whitespace()
            .map(|w| format!("\"{}\"", w))
            .collect::<Vec<_>>()
            .join(" OR ");
        if fts_query.is_empty() {
            return Ok(vec![]);
        }

        let mut sql = String::from(
            "SELECT c.id, c.document_id, c.ordinal, c.text, chunks_fts.rank,
                    d.doc_type, d.related_node, d.language, d.source_uri
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.id
             JOIN documents d ON d.id = c.document_id
             WHERE chunks_fts MATCH ?1 AND c.embed_version = ?2",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(fts_query), Box::new(embed_version.to_string())];
        push_filter_clauses(&mut sql, &mut args, filters);
        sql.push_str(&format!(" ORDER BY chunks_fts.rank LIMIT {}", limit));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let hits = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                let rank: f64 = row.get(4)?;
                Ok(Hit {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    ordinal: row.get(2)?,
                    text: row.get(3)?,
                    // FTS5 rank is negative (lower = better); negate so
                    // higher is better like the vector leg.
                    score: -rank,
                    doc_type: row.get(5)?,
                    related_node: row.get(6)?,
                    language: row.get(7)?,
                    source_uri: row.get(8)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hits)
    }
}

/// Append the shared document-filter clauses used by both retrieval legs.
pub(crate) fn push_filter_clauses(
    sql: &mut String,
    args: &mut Vec<Box<dyn rusqlite::ToSql>>,
    filters: &RetrievalFilters,
) {
    if let Some(t) = &filters.doc_type {
        args.push(Box::new(t.clone()));
        sql.push_str(&format!(" AND d.doc_type = ?{}", args.len()));
    }
    if let Some(n) = &filters.related_node {
        args.push(Box::new(n.clone()));
        sql.push_str(&format!(" AND d.related_node = ?{}", args.len()));
    }
    if let Some(l) = &filters.language {
        args.push(Box::new(l.clone()));
        sql.push_str(&format!(" AND d.language = ?{}", args.len()));
    }
    if let Some(after) = &filters.created_after {
        args.push(Box::new(after.clone()));
        sql.push_str(&format!(" AND d.created_at > ?{}", args.len()));
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, doc_type: &str) -> Document {
        Document {
            id: id.into(),
            source_uri: format!("file:///{}", id),
            content: content.into(),
            doc_type: doc_type.into(),
            related_node: None,
            language: "en".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn chunk(id: &str, doc_id: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: doc_id.into(),
            ordinal,
            text: text.into(),
            token_count: (text.len() / 4) as u32,
            embed_version: "v1".into(),
        }
    }

    #[test]
    fn document_insert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let d = doc("d1", "channel fees explained", "node_doc");
        assert!(store.upsert_document(&d).unwrap());
        assert!(!store.upsert_document(&d).unwrap());
        assert!(store.get_document("d1").unwrap().is_some());
    }

    #[test]
    fn chunk_upsert_and_ordering() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_document(&doc("d1", "x", "node_doc")).unwrap();
        store.upsert_chunk(&chunk("c2", "d1", 1, "second part")).unwrap();
        store.upsert_chunk(&chunk("c1", "d1", 0, "first part")).unwrap();
        let chunks = store.chunks_for_document("d1", "v1").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[1].ordinal, 1);
        assert_eq!(store.chunk_count("d1", "v1").unwrap(), 2);
    }

    #[test]
    fn lexical_search_matches_and_scopes_version() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_document(&doc("d1", "x", "node_doc")).unwrap();
        store
            .upsert_chunk(&chunk("c1", "d1", 0, "routing fees on lightning channels"))
            .unwrap();
        let mut other = chunk("c9", "d1", 0, "routing fees again");
        other.embed_version = "v2".into();
        store.upsert_chunk(&other).unwrap();

        let hits = store
            .lexical_search("routing fees", "v1", &RetrievalFilters::default(), 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn lexical_search_applies_filters() {
        let store = Store::open_in_memory().unwrap();
        let mut d1 = doc("d1", "x", "node_doc");
        d1.related_node = Some("02aaa".into());
        let mut d2 = doc("d2", "y", "snapshot");
        d2.related_node = Some("02bbb".into());
        store.upsert_document(&d1).unwrap();
        store.upsert_document(&d2).unwrap();
        store.upsert_chunk(&chunk("c1", "d1", 0, "liquidity imbalance")).unwrap();
        store.upsert_chunk(&chunk("c2", "d2", 0, "liquidity imbalance")).unwrap();

        let filters = RetrievalFilters { related_node: Some("02bbb".into()), ..Default::default() };
        let hits = store.lexical_search("liquidity", "v1", &filters, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d2");
    }

    #[test]
    fn empty_query_returns_no_hits() {
        let store = Store::open_in_memory().unwrap();
        let hits = store
            .lexical_search("  \"  ", "v1", &RetrievalFilters::default(), 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn purge_removes_chunks_and_fts_rows() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_document(&doc("d1", "x", "node_doc")).unwrap();
        store.upsert_chunk(&chunk("c1", "d1", 0, "ephemeral text")).unwrap();
        store.purge_document("d1").unwrap();
        assert!(store.get_document("d1").unwrap().is_none());
        let hits = store
            .lexical_search("ephemeral", "v1", &RetrievalFilters::default(), 10)
            .unwrap();
        assert!(hits.is_empty());
    }
}
