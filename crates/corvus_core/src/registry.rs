//! The index registry: definition persistence, startup loading, and
//! dispatch by name.

use crate::dir::{encode_index_name, DatabaseDir};
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::index::{Index, IndexDefinition, ViewCompiler};
use crate::store::RecordStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Holds every live index and routes operations to them by name.
///
/// Dispatch is deliberately asymmetric: querying an unknown index is a
/// caller error, but indexing work addressed to an unknown index is
/// dropped with a warning, since a queued task can outlive the index it
/// was queued for.
pub struct IndexRegistry {
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    compiler: Arc<dyn ViewCompiler>,
    dir: Option<Arc<DatabaseDir>>,
    error_log_capacity: usize,
}

impl std::fmt::Debug for IndexRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexRegistry")
            .field("indexes", &self.names())
            .finish_non_exhaustive()
    }
}

impl IndexRegistry {
    /// Creates a registry, loading every persisted definition when a
    /// directory is given.
    ///
    /// A definition that fails to parse or compile is skipped with a
    /// warning; one bad index must not keep the database from opening.
    ///
    /// # Errors
    ///
    /// Returns an error when the definitions directory cannot be created
    /// or listed.
    pub fn open(
        compiler: Arc<dyn ViewCompiler>,
        dir: Option<Arc<DatabaseDir>>,
        error_log_capacity: usize,
    ) -> CoreResult<Self> {
        let registry = Self {
            indexes: RwLock::new(HashMap::new()),
            compiler,
            dir,
            error_log_capacity,
        };
        registry.load_existing()?;
        Ok(registry)
    }

    fn load_existing(&self) -> CoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let definitions = dir.definitions_dir();
        fs::create_dir_all(&definitions)?;

        for entry in fs::read_dir(&definitions)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_one(dir, &path) {
                Ok(index) => {
                    tracing::info!(index = index.name(), "index loaded");
                    self.indexes
                        .write()
                        .insert(index.name().to_string(), index);
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        %err,
                        "skipping unloadable index definition"
                    );
                }
            }
        }
        self.warn_orphan_index_dirs(dir);
        Ok(())
    }

    /// An index directory whose definition is gone (deleted mid-crash, or
    /// skipped above) is left alone but called out, since it holds disk
    /// space nothing will ever read.
    fn warn_orphan_index_dirs(&self, dir: &DatabaseDir) {
        let Ok(entries) = fs::read_dir(dir.indexes_dir()) else {
            return;
        };
        let known = self.indexes.read();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let matches_known = known
                .keys()
                .any(|index| encode_index_name(index) == name);
            if !matches_known {
                tracing::warn!(directory = %name, "index directory has no definition");
            }
        }
    }

    fn load_one(&self, dir: &DatabaseDir, path: &Path) -> CoreResult<Arc<Index>> {
        let bytes = fs::read(path)?;
        let definition: IndexDefinition = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::invalid_format(format!("bad definition file: {e}")))?;
        definition.validate()?;
        let view = self.compiler.compile(&definition)?;
        let index_dir = dir.index_dir(&encode_index_name(&definition.name))?;
        Index::open(definition, view, Some(index_dir), self.error_log_capacity)
    }

    /// Registers an index: validates and compiles the definition,
    /// persists it, and opens the empty index. An existing index of the
    /// same name is torn down and replaced; definitions are immutable, so
    /// "update" is replace plus a full rebuild.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed definition, or the
    /// compiler's error. A definition that does not compile leaves any
    /// prior index of that name untouched.
    pub fn create(&self, store: &RecordStore, definition: IndexDefinition) -> CoreResult<Arc<Index>> {
        definition.validate()?;
        let view = self.compiler.compile(&definition)?;
        if self.indexes.read().contains_key(&definition.name) {
            self.delete(store, &definition.name)?;
        }

        let index_dir = match &self.dir {
            Some(dir) => {
                let encoded = encode_index_name(&definition.name);
                self.persist_definition(dir, &encoded, &definition)?;
                Some(dir.index_dir(&encoded)?)
            }
            None => None,
        };

        let index = Index::open(definition, view, index_dir, self.error_log_capacity)?;
        self.indexes
            .write()
            .insert(index.name().to_string(), Arc::clone(&index));
        tracing::info!(index = index.name(), "index created");
        Ok(index)
    }

    fn persist_definition(
        &self,
        dir: &DatabaseDir,
        encoded: &str,
        definition: &IndexDefinition,
    ) -> CoreResult<()> {
        let definitions = dir.definitions_dir();
        fs::create_dir_all(&definitions)?;
        let path = definitions.join(format!("{encoded}.json"));
        let tmp = definitions.join(format!("{encoded}.json.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(definition)?)?;
        fs::rename(&tmp, &path)?;
        dir.sync_directory_at(&definitions)?;
        Ok(())
    }

    /// Deletes an index and every stored trace of it. Deleting an unknown
    /// name is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when removing files or purging the record store
    /// fails.
    pub fn delete(&self, store: &RecordStore, name: &str) -> CoreResult<()> {
        let Some(index) = self.indexes.write().remove(name) else {
            return Ok(());
        };
        index.dispose();

        if let Some(dir) = &self.dir {
            let encoded = encode_index_name(name);
            let definition_path = dir.definitions_dir().join(format!("{encoded}.json"));
            if definition_path.exists() {
                fs::remove_file(&definition_path)?;
                dir.sync_directory_at(&dir.definitions_dir())?;
            }
            dir.remove_index_dir(&encoded)?;
        }

        store.batch(|actions| {
            actions.purge_index(name);
            Ok(())
        })?;
        tracing::info!(index = name, "index deleted");
        Ok(())
    }

    /// Looks up an index for querying.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexDoesNotExist`] for an unknown name.
    pub fn for_query(&self, name: &str) -> CoreResult<Arc<Index>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::index_does_not_exist(name))
    }

    /// Returns the index if registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(name).cloned()
    }

    /// Registered index names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered index.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Index>> {
        self.indexes.read().values().cloned().collect()
    }

    /// Routes documents to an index's map phase. Work addressed to an
    /// unknown index is dropped with a warning.
    ///
    /// # Errors
    ///
    /// Propagates the index's publish or batch error.
    pub fn index_documents(
        &self,
        store: &RecordStore,
        name: &str,
        documents: &[Document],
    ) -> CoreResult<()> {
        match self.get(name) {
            Some(index) => index.index_documents(store, documents),
            None => {
                tracing::warn!(index = name, "dropping indexing work for unknown index");
                Ok(())
            }
        }
    }

    /// Routes a removal to an index. Unknown names are dropped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Propagates the index's publish or batch error.
    pub fn remove_from_index(
        &self,
        store: &RecordStore,
        name: &str,
        keys: &[String],
    ) -> CoreResult<()> {
        match self.get(name) {
            Some(index) => index.remove_documents(store, keys),
            None => {
                tracing::warn!(index = name, "dropping removal for unknown index");
                Ok(())
            }
        }
    }

    /// Routes a reduce to an index. Unknown names are dropped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Propagates the index's publish or batch error.
    pub fn reduce(&self, store: &RecordStore, name: &str, reduce_key: &str) -> CoreResult<()> {
        match self.get(name) {
            Some(index) => index.reduce_group(store, reduce_key),
            None => {
                tracing::warn!(index = name, "dropping reduce for unknown index");
                Ok(())
            }
        }
    }
}
