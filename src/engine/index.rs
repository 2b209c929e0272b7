// ── Moniteur Engine: Vector Index Manager ──────────────────────────────────
// Owns every VectorIndex and Alias mutation. Ingestion fills a *building*
// index in the background; queries keep resolving through the alias until
// `finalize` flips it; one store transaction that marks the new index
// ready, repoints the alias, retires the old index, and drops every cache
// entry keyed to the old embed_version. Readers never observe a mix.

use log::info;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::atoms::constants::{ANSWER_CACHE_PREFIX, RETRIEVAL_CACHE_PREFIX};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::IndexState;
use crate::engine::store::Store;

pub struct IndexManager {
    store: Arc<Store>,
    alias: String,
    /// The building index currently accepting ingestion, if any.
    building: Mutex<Option<String>>,
}

impl IndexManager {
    pub fn new(store: Arc<Store>, alias: &str) -> Self {
        Self { store, alias: alias.to_string(), building: Mutex::new(None) }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The index the alias currently resolves to (the query path).
    pub fn current(&self) -> EngineResult<Option<String>> {
        self.store.get_alias(&self.alias)
    }

    /// Start a shadow index for `embed_version`. Returns its name.
    pub fn begin_reindex(&self, embed_version: &str) -> EngineResult<String> {
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        let name = format!("{}_{}_{}", self.alias, embed_version, suffix);
        self.store.create_index(&name, embed_version)?;
        *self.building.lock() = Some(name.clone());
        info!("[index] Reindex started: {} (embed_version={})", name, embed_version);
        Ok(name)
    }

    /// The building index to ingest into, creating one when none exists.
    pub fn ensure_building(&self, embed_version: &str) -> EngineResult<String> {
        if let Some(name) = self.building.lock().clone() {
            return Ok(name);
        }
        self.begin_reindex(embed_version)
    }

    /// Atomically promote `index_name`: ready + alias flip + retire previous
    /// + drop caches keyed to the previous embed_version.
    pub fn finalize(&self, index_name: &str) -> EngineResult<()> {
        let meta = self
            .store
            .get_index(index_name)?
            .ok_or_else(|| EngineError::not_found(format!("index '{}'", index_name)))?;
        if meta.state != IndexState::Building {
            return Err(EngineError::invalid(format!(
                "index '{}' is {}, expected building",
                index_name,
                meta.state.as_str()
            )));
        }

        // Cache invalidation patterns come from the *previous* alias target.
        let patterns = match self.current()? {
            Some(prev_name) => match self.store.get_index(&prev_name)? {
                Some(prev) => vec![
                    format!("{}:{}:%", RETRIEVAL_CACHE_PREFIX, prev.embed_version),
                    format!("{}:{}:%", ANSWER_CACHE_PREFIX, prev.embed_version),
                ],
                None => vec![],
            },
            None => vec![],
        };

        let retired = self.store.swap_alias(&self.alias, index_name, &patterns)?;
        let mut building = self.building.lock();
        if building.as_deref() == Some(index_name) {
            *building = None;
        }
        info!(
            "[index] Alias '{}' → {} (retired: {})",
            self.alias,
            index_name,
            retired.as_deref().unwrap_or("none")
        );
        Ok(())
    }

    /// Drop a building index; the alias is untouched.
    pub fn abort(&self, index_name: &str) -> EngineResult<()> {
        let meta = self
            .store
            .get_index(index_name)?
            .ok_or_else(|| EngineError::not_found(format!("index '{}'", index_name)))?;
        if meta.state != IndexState::Building {
            return Err(EngineError::invalid(format!(
                "index '{}' is {}, only building indexes can be aborted",
                index_name,
                meta.state.as_str()
            )));
        }
        self.store.drop_index(index_name)?;
        let mut building = self.building.lock();
        if building.as_deref() == Some(index_name) {
            *building = None;
        }
        info!("[index] Reindex aborted: {}", index_name);
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IndexManager {
        IndexManager::new(Arc::new(Store::open_in_memory().unwrap()), "docs")
    }

    #[test]
    fn begin_finalize_flips_alias() {
        let m = manager();
        assert!(m.current().unwrap().is_none());
        let name = m.begin_reindex("v1").unwrap();
        assert!(name.starts_with("docs_v1_"));
        // Queries still resolve nothing until finalize.
        assert!(m.current().unwrap().is_none());
        m.finalize(&name).unwrap();
        assert_eq!(m.current().unwrap().as_deref(), Some(name.as_str()));
    }

    #[test]
    fn finalize_retires_previous_and_drops_its_caches() {
        let m = manager();
        let v1 = m.begin_reindex("v1").unwrap();
        m.finalize(&v1).unwrap();

        m.store.cache_set("retrieval:v1:abc", "hits", 600).unwrap();
        m.store.cache_set("answer:v1:abc", "out", 600).unwrap();

        let v2 = m.begin_reindex("v2").unwrap();
        m.finalize(&v2).unwrap();

        assert_eq!(m.current().unwrap().as_deref(), Some(v2.as_str()));
        assert_eq!(m.store.get_index(&v1).unwrap().unwrap().state, IndexState::Retired);
        assert!(m.store.cache_get("retrieval:v1:abc").unwrap().is_none());
        assert!(m.store.cache_get("answer:v1:abc").unwrap().is_none());
        // Exactly one ready index after the flip.
        assert_eq!(m.store.ready_index_count().unwrap(), 1);
    }

    #[test]
    fn abort_drops_building_only() {
        let m = manager();
        let v1 = m.begin_reindex("v1").unwrap();
        m.finalize(&v1).unwrap();
        let v2 = m.begin_reindex("v2").unwrap();
        m.abort(&v2).unwrap();
        // Alias untouched, building slot cleared, index gone.
        assert_eq!(m.current().unwrap().as_deref(), Some(v1.as_str()));
        assert!(m.store.get_index(&v2).unwrap().is_none());
        // Finalized indexes cannot be aborted.
        assert!(m.abort(&v1).is_err());
    }

    #[test]
    fn ensure_building_reuses_open_index() {
        let m = manager();
        let a = m.ensure_building("v1").unwrap();
        let b = m.ensure_building("v1").unwrap();
        assert_eq!(a, b);
        m.finalize(&a).unwrap();
        let c = m.ensure_building("v1").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn finalize_unknown_index_is_not_found() {
        let m = manager();
        assert!(matches!(m.finalize("nope"), Err(EngineError::NotFound(_))));
    }
}
