// ── Store: Vector Indexes, Embeddings & Alias ──────────────────────────────
// A "physical index" is the set of embedding rows sharing an index_name.
// The alias is one row in vector_aliases; `swap_alias` flips it inside a
// single transaction together with the index state transitions and the
// dependent-cache invalidation, so readers observe either the old world or
// the new one, never a mix.

use rusqlite::params;

use super::vector_math::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};
use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Hit, IndexState, RetrievalFilters, VectorIndexMeta};

impl Store {
    // ── Index lifecycle ────────────────────────────────────────────────────

    pub fn create_index(&self, name: &str, embed_version: &str) -> EngineResult<()> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO vector_indexes (name, embed_version, state)
             VALUES (?1, ?2, 'building')",
            params![name, embed_version],
        )?;
        if inserted == 0 {
            return Err(EngineError::Conflict(format!("index '{}' already exists", name)));
        }
        Ok(())
    }

    pub fn get_index(&self, name: &str) -> EngineResult<Option<VectorIndexMeta>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name, embed_version, state, created_at FROM vector_indexes WHERE name = ?1",
        )?;
        let mut rows = stmt.query_map(params![name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        match rows.next().transpose()? {
            None => Ok(None),
            Some((name, embed_version, state, created_at)) => Ok(Some(VectorIndexMeta {
                name,
                embed_version,
                state: IndexState::parse(&state)?,
                created_at,
            })),
        }
    }

    /// Drop a physical index and its embedding rows (abort path).
    pub fn drop_index(&self, name: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM embeddings WHERE index_name = ?1", params![name])?;
        conn.execute("DELETE FROM vector_indexes WHERE name = ?1", params![name])?;
        Ok(())
    }

    // ── Alias ──────────────────────────────────────────────────────────────

    pub fn get_alias(&self, alias: &str) -> EngineResult<Option<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT index_name FROM vector_aliases WHERE alias = ?1")?;
        let mut rows = stmt.query_map(params![alias], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    /// Bootstrap path only; point an alias at an index outside a swap.
    pub fn set_alias(&self, alias: &str, index_name: &str) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO vector_aliases (alias, index_name) VALUES (?1, ?2)",
            params![alias, index_name],
        )?;
        Ok(())
    }

    /// The finalize transaction: mark `new_index` ready, flip the alias,
    /// retire the previous target (if any), and delete cache rows matching
    /// the given LIKE patterns. Returns the retired index name.
    pub fn swap_alias(
        &self,
        alias: &str,
        new_index: &str,
        cache_patterns: &[String],
    ) -> EngineResult<Option<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(EngineError::from)?;

        let previous: Option<String> = tx
            .query_row(
                "SELECT index_name FROM vector_aliases WHERE alias = ?1",
                params![alias],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(EngineError::from(other)),
            })?;

        tx.execute(
            "UPDATE vector_indexes SET state = 'ready' WHERE name = ?1",
            params![new_index],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO vector_aliases (alias, index_name) VALUES (?1, ?2)",
            params![alias, new_index],
        )?;
        if let Some(prev) = &previous {
            if prev != new_index {
                tx.execute(
                    "UPDATE vector_indexes SET state = 'retired' WHERE name = ?1",
                    params![prev],
                )?;
            }
        }
        for pattern in cache_patterns {
            tx.execute("DELETE FROM kv_cache WHERE key LIKE ?1", params![pattern])?;
        }

        tx.commit().map_err(EngineError::from)?;
        Ok(previous.filter(|p| p != new_index))
    }

    /// Invariant check used by tests and the readiness probe: at most one
    /// index is `ready` among the alias target's family.
    pub fn ready_index_count(&self) -> EngineResult<u32> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM vector_indexes WHERE state = 'ready'",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ── Embeddings ─────────────────────────────────────────────────────────

    /// Idempotent by (index_name, chunk_id); re-ingestion overwrites with
    /// identical bytes.
    pub fn upsert_embedding(
        &self,
        index_name: &str,
        chunk_id: &str,
        model_id: &str,
        embed_version: &str,
        vector: &[f32],
    ) -> EngineResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO embeddings
                 (index_name, chunk_id, model_id, embed_version, vector)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![index_name, chunk_id, model_id, embed_version, f32_vec_to_bytes(vector)],
        )?;
        Ok(())
    }

    pub fn embedding_count(&self, index_name: &str) -> EngineResult<u32> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE index_name = ?1",
            params![index_name],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ── Vector search ──────────────────────────────────────────────────────

    /// Top-`limit` chunks by cosine similarity against `query_vec`, within
    /// one physical index and the caller's document filters. Similarity is
    /// computed in-process over the stored blobs.
    pub fn vector_search(
        &self,
        index_name: &str,
        query_vec: &[f32],
        filters: &RetrievalFilters,
        limit: usize,
    ) -> EngineResult<Vec<Hit>> {
        let mut sql = String::from(
            "SELECT c.id, c.document_id, c.ordinal, c.text, e.vector,
                    d.doc_type, d.related_node, d.language, d.source_uri
             FROM embeddings e
             JOIN chunks c ON c.id = e.chunk_id
             JOIN documents d ON d.id = c.document_id
             WHERE e.index_name = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(index_name.to_string())];
        super::documents::push_filter_clauses(&mut sql, &mut args, filters);

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut scored: Vec<(Hit, f64)> = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                let blob: Vec<u8> = row.get(4)?;
                Ok((
                    Hit {
                        chunk_id: row.get(0)?,
                        document_id: row.get(1)?,
                        ordinal: row.get(2)?,
                        text: row.get(3)?,
                        score: 0.0,
                        doc_type: row.get(5)?,
                        related_node: row.get(6)?,
                        language: row.get(7)?,
                        source_uri: row.get(8)?,
                    },
                    blob,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(|(mut hit, blob)| {
                let stored = bytes_to_f32_vec(&blob);
                let score = cosine_similarity(query_vec, &stored);
                hit.score = score;
                (hit, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    (a.0.document_id.as_str(), a.0.ordinal)
                        .cmp(&(b.0.document_id.as_str(), b.0.ordinal))
                })
        });
        scored.truncate(limit);
        Ok(scored.into_iter().map(|(h, _)| h).collect())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Chunk, Document};

    fn seed_chunk(store: &Store, id: &str, text: &str, vector: &[f32]) {
        let doc = Document {
            id: format!("doc-{}", id),
            source_uri: "file:///t".into(),
            content: text.into(),
            doc_type: "node_doc".into(),
            related_node: None,
            language: "en".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        store.upsert_document(&doc).unwrap();
        store
            .upsert_chunk(&Chunk {
                id: id.into(),
                document_id: doc.id.clone(),
                ordinal: 0,
                text: text.into(),
                token_count: 4,
                embed_version: "v1".into(),
            })
            .unwrap();
        store.upsert_embedding("docs_v1_a", id, "m1", "v1", vector).unwrap();
    }

    #[test]
    fn index_create_is_unique() {
        let store = Store::open_in_memory().unwrap();
        store.create_index("docs_v1_a", "v1").unwrap();
        let err = store.create_index("docs_v1_a", "v1").unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn vector_search_ranks_by_cosine() {
        let store = Store::open_in_memory().unwrap();
        store.create_index("docs_v1_a", "v1").unwrap();
        seed_chunk(&store, "c1", "about fees", &[1.0, 0.0]);
        seed_chunk(&store, "c2", "about uptime", &[0.0, 1.0]);

        let hits = store
            .vector_search("docs_v1_a", &[0.9, 0.1], &RetrievalFilters::default(), 10)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn swap_alias_flips_and_retires() {
        let store = Store::open_in_memory().unwrap();
        store.create_index("docs_v1_a", "v1").unwrap();
        store.swap_alias("docs", "docs_v1_a", &[]).unwrap();
        assert_eq!(store.get_alias("docs").unwrap().as_deref(), Some("docs_v1_a"));
        assert_eq!(store.get_index("docs_v1_a").unwrap().unwrap().state, IndexState::Ready);

        store.create_index("docs_v2_b", "v2").unwrap();
        let retired = store.swap_alias("docs", "docs_v2_b", &[]).unwrap();
        assert_eq!(retired.as_deref(), Some("docs_v1_a"));
        assert_eq!(store.get_alias("docs").unwrap().as_deref(), Some("docs_v2_b"));
        assert_eq!(store.get_index("docs_v1_a").unwrap().unwrap().state, IndexState::Retired);
        assert_eq!(store.ready_index_count().unwrap(), 1);
    }

    #[test]
    fn swap_alias_deletes_matching_cache_rows() {
        let store = Store::open_in_memory().unwrap();
        store.create_index("docs_v2_b", "v2").unwrap();
        store.cache_set("retrieval:v1:abc", "x", 600).unwrap();
        store.cache_set("retrieval:v2:def", "y", 600).unwrap();
        store
            .swap_alias("docs", "docs_v2_b", &["retrieval:v1:%".to_string()])
            .unwrap();
        assert!(store.cache_get("retrieval:v1:abc").unwrap().is_none());
        assert!(store.cache_get("retrieval:v2:def").unwrap().is_some());
    }

    #[test]
    fn embedding_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.create_index("docs_v1_a", "v1").unwrap();
        seed_chunk(&store, "c1", "text", &[0.5, 0.5]);
        store.upsert_embedding("docs_v1_a", "c1", "m1", "v1", &[0.5, 0.5]).unwrap();
        assert_eq!(store.embedding_count("docs_v1_a").unwrap(), 1);
    }
}
