//! C1 — a uniform filesystem surface, so the cache and loaders can be exercised against an
//! in-memory double in tests instead of a real temp directory tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::err::Res;

/// Metadata the core actually needs; anything richer belongs to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub is_file: bool,
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> Res<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> Res<()>;
    fn exists(&self, path: &Path) -> bool;
    fn stat(&self, path: &Path) -> Option<Stat>;
    fn list(&self, dir: &Path) -> Res<Vec<PathBuf>>;
    fn create_dir_all(&self, dir: &Path) -> Res<()>;
    fn remove_dir_all(&self, dir: &Path) -> Res<()>;
}

/// The real filesystem. A thin pass-through to `std::fs`; kept as a struct (rather than calling
/// `std::fs` directly everywhere) so every core component can be generic over `Arc<dyn
/// FileSystem>` and get the in-memory double for free in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl FileSystem for RealFs {
    fn read(&self, path: &Path) -> Res<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Res<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(path, contents)?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn stat(&self, path: &Path) -> Option<Stat> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Stat {
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
        })
    }

    fn list(&self, dir: &Path) -> Res<Vec<PathBuf>> {
        crate::util::immediate_subdirs(dir).or_else(|_| {
            let mut out = Vec::new();
            for entry in std::fs::read_dir(dir)? {
                out.push(entry?.path());
            }
            Ok(out)
        })
    }

    fn create_dir_all(&self, dir: &Path) -> Res<()> {
        Ok(std::fs::create_dir_all(dir)?)
    }

    fn remove_dir_all(&self, dir: &Path) -> Res<()> {
        if dir.exists() {
            remove_dir_all::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// An in-memory tree, keyed by absolute path. Directories are tracked explicitly (a key mapped
/// to `None`) so `exists`/`stat`/`list` behave sensibly without a real filesystem underneath.
#[derive(Debug, Default)]
pub struct MemFs {
    entries: Mutex<BTreeMap<PathBuf, Option<Vec<u8>>>>,
}

impl MemFs {
    pub fn new() -> Self {
        MemFs {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn ensure_ancestors(map: &mut BTreeMap<PathBuf, Option<Vec<u8>>>, path: &Path) {
        let mut cur = path.to_path_buf();
        while let Some(parent) = cur.parent() {
            if parent.as_os_str().is_empty() {
                break;
            }
            map.entry(parent.to_path_buf()).or_insert(None);
            cur = parent.to_path_buf();
        }
    }
}

impl FileSystem for MemFs {
    fn read(&self, path: &Path) -> Res<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(path) {
            Some(Some(bytes)) => Ok(bytes.clone()),
            _ => Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into()),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Res<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::ensure_ancestors(&mut entries, path);
        entries.insert(path.to_path_buf(), Some(contents.to_vec()));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.entries.lock().unwrap().contains_key(path)
    }

    fn stat(&self, path: &Path) -> Option<Stat> {
        let entries = self.entries.lock().unwrap();
        entries.get(path).map(|v| Stat {
            is_dir: v.is_none(),
            is_file: v.is_some(),
        })
    }

    fn list(&self, dir: &Path) -> Res<Vec<PathBuf>> {
        let entries = self.entries.lock().unwrap();
        let mut out = Vec::new();
        for key in entries.keys() {
            if key.parent() == Some(dir) {
                out.push(key.clone());
            }
        }
        Ok(out)
    }

    fn create_dir_all(&self, dir: &Path) -> Res<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::ensure_ancestors(&mut entries, dir);
        entries.entry(dir.to_path_buf()).or_insert(None);
        Ok(())
    }

    fn remove_dir_all(&self, dir: &Path) -> Res<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|p, _| !p.starts_with(dir));
        Ok(())
    }
}
