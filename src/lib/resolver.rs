//! C8 — rewrites an import request string from inside a module into a concrete file path.
//!
//! `elba` itself resolves package *dependencies*, not runtime *file* imports, so there is no
//! direct analogue to build on here; this is built fresh in the same idiom: plain functions over
//! borrowed state rather than a stateful object, since the association and lifecycle state is
//! owned by `ModuleManager` and merely *consulted* here — `ModuleManager` holds the maps and
//! calls into this module rather than this module owning anything itself.

use std::path::{Path, PathBuf};

use crate::manifest::Manifest;

/// Enough about one loaded module for path resolution: its manifest (folder/exports/paths/
/// aliases) plus, separately, the manager's association map for it.
pub struct ModuleView<'a> {
    pub id: &'a str,
    pub manifest: &'a Manifest,
}

/// Resolves `request` as seen from `parent_filename` (the file doing the importing, if known).
/// Returns `None` when the request isn't one of this core's prefixes, or when the request is
/// malformed/unresolvable in a way that isn't itself an error ("not the core's job").
pub fn resolve<'a>(
    request: &str,
    parent_filename: Option<&Path>,
    modules: &[ModuleView<'a>],
    associations: impl Fn(&str, &str) -> Option<&'a str>,
) -> Result<Option<PathBuf>, String> {
    if let Some(rest) = request.strip_prefix("@ajs.raw/") {
        return Ok(resolve_raw(rest, modules));
    }

    let owner = parent_filename.and_then(|f| find_owner(f, modules));
    let Some(owner) = owner else {
        return Ok(None);
    };

    if let Some(rest) = request.strip_prefix("@ajs.local/") {
        return Ok(Some(owner.manifest.exports_path.join(rest)));
    }

    if let Some(rest) = request.strip_prefix("@ajs/") {
        let (iface, ver, sub) = split_first_three_segments(rest);
        let key = format!("{}@{}", iface, ver);
        let provider_id = associations(owner.id, &key).ok_or_else(|| {
            format!("module {} tried to use un-imported interface {}", owner.id, key)
        })?;
        let provider = modules
            .iter()
            .find(|m| m.id == provider_id)
            .ok_or_else(|| format!("associated provider {} is not loaded", provider_id))?;
        return Ok(Some(provider.manifest.exports_path.join(iface).join(ver).join(sub)));
    }

    if let Some(path) = resolve_src_alias(request, owner) {
        return Ok(Some(path));
    }

    if let Some(path) = resolve_paths_map(request, owner) {
        return Ok(Some(path));
    }

    Ok(None)
}

fn find_owner<'a, 'b>(parent_filename: &Path, modules: &'b [ModuleView<'a>]) -> Option<&'b ModuleView<'a>> {
    modules
        .iter()
        .filter(|m| parent_filename.starts_with(&m.manifest.folder))
        .max_by_key(|m| m.manifest.folder.as_os_str().len())
}

fn resolve_src_alias<'a>(request: &str, owner: &ModuleView<'a>) -> Option<PathBuf> {
    let (alias, replacement) = owner
        .manifest
        .src_aliases
        .iter()
        .filter(|(alias, _)| request == alias.as_str() || request.starts_with(&format!("{}/", alias)))
        .max_by_key(|(alias, _)| alias.len())?;

    let rest = request.strip_prefix(alias.as_str()).unwrap_or("").trim_start_matches('/');
    Some(if rest.is_empty() { replacement.clone() } else { replacement.join(rest) })
}

fn resolve_paths_map<'a>(request: &str, owner: &ModuleView<'a>) -> Option<PathBuf> {
    let entry = owner
        .manifest
        .paths
        .iter()
        .filter(|p| request == p.key || request.starts_with(&format!("{}/", p.key)))
        .max_by_key(|p| p.key.len())?;

    let rest = request.strip_prefix(&entry.key).unwrap_or("").trim_start_matches('/');
    for value in &entry.values {
        let candidate = if rest.is_empty() { value.clone() } else { value.join(rest) };
        let as_js = append_extension(&candidate, "js");
        if as_js.exists() {
            return Some(as_js);
        }
        let as_index = candidate.join("index.js");
        if as_index.exists() {
            return Some(as_index);
        }
    }
    None
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Splits `"<iface>/<ver>[/<rest>]"` into its three pieces; a missing trailing piece is `""`.
fn split_first_three_segments(s: &str) -> (&str, &str, &str) {
    let mut parts = s.splitn(3, '/');
    let iface = parts.next().unwrap_or("");
    let ver = parts.next().unwrap_or("");
    let sub = parts.next().unwrap_or("");
    (iface, ver, sub)
}

/// `@ajs.raw/<module-id>/<iface>@<ver>[/<rest>]`. Module ids may themselves contain `/`, so the
/// `<iface>@<ver>` segment is located by scanning right-to-left for a slash-delimited segment
/// containing `@`. An unknown module id (or a string with no such segment at all)
/// yields `None` rather than an error.
fn resolve_raw<'a>(rest: &str, modules: &[ModuleView<'a>]) -> Option<PathBuf> {
    let segments: Vec<&str> = rest.split('/').collect();
    let at_index = segments.iter().rposition(|seg| seg.contains('@'))?;

    let module_id = segments[..at_index].join("/");
    let (iface, ver) = segments[at_index].split_once('@')?;
    let sub = segments[at_index + 1..].join("/");

    let provider = modules.iter().find(|m| m.id == module_id)?;
    Some(provider.manifest.exports_path.join(iface).join(ver).join(sub))
}
