//! C3 — a content-addressed module store, keyed by `(name, version)`, shared across processes.
//!
//! Grounded on `elba`'s own `retrieve::cache::{Cache, Layout}`: a `Cache` owns a root directory
//! and an in-memory index of what's already been fetched there, and every mutating operation goes
//! through [`crate::util::lock::DirLock`] so two copies of the runtime racing on the same project
//! don't clobber each other's extraction. The index format and the "clear-then-recreate" folder
//! semantics mirror `Layout::checkout_source`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::Logger;

use crate::err::Res;
use crate::util;
use crate::util::lock::{DirLock, DEFAULT_TIMEOUT};

const INDEX_FILE: &str = ".antelope-cache-index.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    #[serde(flatten)]
    versions: BTreeMap<String, String>,
}

/// One subfolder-per-module-name store rooted at `root`, plus a sibling index file recording
/// which version each module name currently holds.
pub struct Cache {
    root: PathBuf,
    index: tokio::sync::Mutex<Index>,
    log: Logger,
    temp_counter: AtomicU64,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>, log: Logger) -> Cache {
        Cache {
            root: root.into(),
            index: tokio::sync::Mutex::new(Index::default()),
            log,
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the on-disk index (if any) into memory. Safe to call more than once; a missing index
    /// file is not an error (fresh cache root).
    pub async fn load(&self) -> Res<()> {
        std::fs::create_dir_all(&self.root)?;
        let index_path = self.root.join(INDEX_FILE);
        let mut index = self.index.lock().await;
        if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)?;
            *index = serde_json::from_str(&raw).unwrap_or_default();
        }
        Ok(())
    }

    pub async fn has_version(&self, name: &str, version: &str) -> bool {
        self.index.lock().await.versions.get(name).map(String::as_str) == Some(version)
    }

    pub async fn get_version(&self, name: &str) -> Option<String> {
        self.index.lock().await.versions.get(name).cloned()
    }

    /// Records `name -> version` and flushes the index immediately.
    pub async fn set_version(&self, name: &str, version: &str) -> Res<()> {
        let _lock = DirLock::acquire(&self.root, DEFAULT_TIMEOUT).await?;
        let mut index = self.index.lock().await;
        index.versions.insert(name.to_string(), version.to_string());
        self.flush(&index)?;
        slog::debug!(self.log, "cache index updated"; "name" => name, "version" => version);
        Ok(())
    }

    fn flush(&self, index: &Index) -> Res<()> {
        let index_path = self.root.join(INDEX_FILE);
        let raw = serde_json::to_vec_pretty(index)?;
        std::fs::write(index_path, raw)?;
        Ok(())
    }

    /// The absolute folder for a cached module name. If `create`, ensures it exists; if
    /// `!must_exist` and it already exists, it is cleared first (the git loader's "force reclone"
    /// path).
    pub fn get_folder(&self, name: &str, must_exist: bool, create: bool) -> Res<PathBuf> {
        let folder = self.root.join(sanitize(name));
        if !must_exist && folder.exists() {
            util::clear_dir(&folder)?;
        }
        if create {
            std::fs::create_dir_all(&folder)?;
        }
        Ok(folder)
    }

    /// A process-unique scratch directory under the cache root, for loaders that need to
    /// assemble a module before committing it with [`Cache::transfer`].
    pub fn get_temp(&self) -> Res<PathBuf> {
        let n = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.root.join("tmp").join(format!("{}-{}", std::process::id(), n));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Atomically moves a populated temp directory into the cache under `name` and records
    /// `version`. Prefers `rename` (atomic, same filesystem); falls back to copy-then-remove on
    /// cross-filesystem `EXDEV`.
    pub async fn transfer(&self, source_tmp: &Path, name: &str, version: &str) -> Res<PathBuf> {
        let _lock = DirLock::acquire(&self.root, DEFAULT_TIMEOUT).await?;
        let dest = self.root.join(sanitize(name));
        if dest.exists() {
            util::clear_dir(&dest)?;
        } else {
            std::fs::create_dir_all(&dest)?;
        }
        util::move_dir(source_tmp, &dest)?;

        let mut index = self.index.lock().await;
        index.versions.insert(name.to_string(), version.to_string());
        self.flush(&index)?;

        slog::info!(self.log, "transferred module into cache"; "name" => name, "version" => version);
        Ok(dest)
    }
}

/// Module names can contain path separators (scoped package names, `@org/pkg`); collapse them to
/// a single safe folder component instead of nesting or escaping the cache root.
fn sanitize(name: &str) -> String {
    name.replace(['/', '\\'], "__")
}
