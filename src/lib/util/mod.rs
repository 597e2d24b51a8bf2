//! Utility functions shared across the acquisition, cache and config layers.

pub mod hash;
pub mod lock;

use std::{fs, path::Path};

use walkdir::{DirEntry, WalkDir};

use crate::err::Res;

/// Recursively copies `from` into `to`, skipping `.git` directories. Used by the cache when an
/// atomic rename across filesystems (`EXDEV`) forces a copy-then-remove fallback.
pub fn copy_dir(from: &Path, to: &Path) -> Res<()> {
    let walker = WalkDir::new(from)
        .follow_links(true)
        .into_iter()
        .filter_entry(|x| x.path() != to && x.file_name() != ".git")
        .filter_map(|x| x.ok().filter(valid_file));

    for entry in walker {
        let rel = entry.path().strip_prefix(from).unwrap();
        let dest = to.join(rel);
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::copy(entry.path(), &dest)?;
    }

    Ok(())
}

/// Moves `from` into `to`. Prefers an atomic rename; falls back to recursive copy + remove when
/// the two paths live on different filesystems, per the cache-transfer design decision.
pub fn move_dir(from: &Path, to: &Path) -> Res<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir(from, to)?;
            remove_dir_all::remove_dir_all(from)?;
            Ok(())
        }
    }
}

/// Wipes and recreates `dir`. Used whenever a loader needs to force a fresh clone/extraction.
pub fn clear_dir(dir: &Path) -> Res<()> {
    if dir.exists() {
        remove_dir_all::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn valid_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
}

/// Lists the immediate subdirectories of `dir`, in directory-entry order. Used by the
/// local-folder loader (each subdirectory becomes one module).
pub fn immediate_subdirs(dir: &Path) -> Res<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}
