//! Compiled query cache.
//!
//! Holds the prepared handles for the engine's fixed set of internal queries.
//! In normal mode each key is compiled once. In hot-reload mode every lookup
//! re-reads the key's source from a [`QuerySource`] and recompiles it; a
//! failed recompilation is logged and the last good handle is served instead.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::CacheError;

/// Turns query source text into a reusable handle.
pub trait QueryCompiler: Send + Sync {
    /// The prepared form of a query.
    type Handle: Clone + Send + Sync;

    /// Compiles `source` for `key`.
    fn compile(&self, key: &str, source: &str) -> Result<Self::Handle, CacheError>;
}

/// Source of truth consulted on every lookup in hot-reload mode.
pub trait QuerySource: Send + Sync {
    /// Loads the current source text of `key`.
    fn load(&self, key: &str) -> Result<String, CacheError>;
}

/// Reads query sources from `<dir>/<key>.<extension>`.
#[derive(Debug, Clone)]
pub struct DirectoryQuerySource {
    dir: PathBuf,
    extension: String,
}

impl DirectoryQuerySource {
    /// Creates a source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }
}

impl QuerySource for DirectoryQuerySource {
    fn load(&self, key: &str) -> Result<String, CacheError> {
        let path = self.dir.join(format!("{}.{}", key, self.extension));
        if !path.is_file() {
            return Err(CacheError::SourceNotFound(path.display().to_string()));
        }
        Ok(fs::read_to_string(path)?)
    }
}

#[derive(Clone)]
struct CachedQuery<H> {
    last_good: H,
    source: String,
}

/// Cache of compiled query handles.
pub struct EvaluationCache<C: QueryCompiler> {
    compiler: C,
    entries: RwLock<HashMap<String, CachedQuery<C::Handle>>>,
    hot_reload: Option<Box<dyn QuerySource>>,
    /// Bumped on every successful compilation.
    revision: AtomicU64,
}

impl<C: QueryCompiler> EvaluationCache<C> {
    /// Creates a cache that compiles each key once.
    pub fn new(compiler: C) -> Self {
        Self {
            compiler,
            entries: RwLock::new(HashMap::new()),
            hot_reload: None,
            revision: AtomicU64::new(0),
        }
    }

    /// Creates a cache that recompiles from `source` on every lookup.
    pub fn with_hot_reload(compiler: C, source: impl QuerySource + 'static) -> Self {
        Self {
            compiler,
            entries: RwLock::new(HashMap::new()),
            hot_reload: Some(Box::new(source)),
            revision: AtomicU64::new(0),
        }
    }

    /// Returns true in hot-reload mode.
    pub fn is_hot_reload(&self) -> bool {
        self.hot_reload.is_some()
    }

    /// Number of successful compilations so far.
    ///
    /// Changes whenever a lookup may return a different handle than before.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Compiles `source` and stores it under `key`, replacing any previous handle.
    pub fn store(&self, key: &str, source: &str) -> Result<C::Handle, CacheError> {
        let handle = self.compiler.compile(key, source)?;
        self.entries.write().insert(
            key.to_string(),
            CachedQuery {
                last_good: handle.clone(),
                source: source.to_string(),
            },
        );
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    /// Returns the handle stored under `key`.
    ///
    /// In hot-reload mode the handle is refreshed from the query source first.
    pub fn get(&self, key: &str) -> Option<C::Handle> {
        let cached = self.entries.read().get(key).cloned()?;
        if self.hot_reload.is_none() {
            return Some(cached.last_good);
        }
        Some(self.reload(key, cached))
    }

    /// Returns the handle for `key`, compiling `source` if none is stored yet.
    ///
    /// Errors only when nothing usable exists for `key`: never because a
    /// hot-reload recompilation failed while a previous handle is available.
    pub fn get_or_set(&self, key: &str, source: &str) -> Result<C::Handle, CacheError> {
        if let Some(handle) = self.get(key) {
            return Ok(handle);
        }

        let initial = match &self.hot_reload {
            Some(loader) => match loader.load(key) {
                Ok(text) => text,
                Err(e) => {
                    debug!("No hot-reload source for '{}' ({}), using default", key, e);
                    source.to_string()
                }
            },
            None => source.to_string(),
        };

        match self.store(key, &initial) {
            Ok(handle) => Ok(handle),
            Err(e) if initial != source => {
                warn!("Hot-reload source for '{}' is invalid: {}", key, e);
                self.store(key, source)
            }
            Err(e) => Err(e),
        }
    }

    fn reload(&self, key: &str, cached: CachedQuery<C::Handle>) -> C::Handle {
        let Some(loader) = &self.hot_reload else {
            return cached.last_good;
        };

        let source = match loader.load(key) {
            Ok(source) => source,
            Err(e) => {
                warn!("Failed to reload query '{}': {}; using last good", key, e);
                return cached.last_good;
            }
        };
        if source == cached.source {
            return cached.last_good;
        }

        match self.store(key, &source) {
            Ok(handle) => {
                debug!("Recompiled query '{}'", key);
                handle
            }
            Err(e) => {
                warn!("Failed to recompile query '{}': {}; using last good", key, e);
                cached.last_good
            }
        }
    }
}
