//! C6 — parses a module's on-disk metadata (`package.json` plus an optional
//! `antelope.module.json` overlay) and loads its declared exports and imports.
//!
//! Grounded on `elba`'s own `retrieve::cache::Source::from_folder` (reads a manifest file out of
//! a downloaded/checked-out directory and validates it against the package id the caller
//! expected) and `package::manifest::Manifest` (a `#[derive(Deserialize)]` struct read with
//! `toml::from_str`, here `serde_json::from_str` since the on-disk format is JSON).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use failure::ResultExt;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::err::{Error, ErrorKind, Res};
use crate::source::ModuleSource;

const PACKAGE_JSON: &str = "package.json";
const MODULE_OVERLAY: &str = "antelope.module.json";
const DEFAULT_EXPORTS_PATH: &str = "interfaces";

/// A `{key}*: [{values}*]` entry from `antelopeJs.paths`, with the trailing wildcard stripped and
/// every value already resolved against `baseUrl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathEntry {
    pub key: String,
    pub values: Vec<PathBuf>,
}

/// The parsed, on-disk description of one module. Serializable so the build artifact (C10)
/// can embed one verbatim instead of re-parsing `package.json` on `launch-from-build`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub folder: PathBuf,
    pub main: PathBuf,
    pub base_url: PathBuf,
    pub exports_path: PathBuf,
    pub paths: Vec<PathEntry>,
    pub exports: BTreeMap<String, PathBuf>,
    pub imports: IndexSet<String>,
    pub src_aliases: BTreeMap<String, PathBuf>,
    pub source: ModuleSource,
    #[serde(skip)]
    declared_exports: Vec<DeclaredExport>,
}

#[derive(Clone, Debug)]
enum DeclaredExport {
    Versioned(String, String),
    Unversioned(String),
}

#[derive(Deserialize)]
struct PackageJson {
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    main: Option<String>,
    #[serde(default, rename = "_moduleAliases")]
    module_aliases: BTreeMap<String, String>,
    #[serde(default, rename = "antelopeJs")]
    antelope_js: Value,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl Manifest {
    /// Reads `{folder}/package.json`, applies the `antelope.module.json` overlay if present, and
    /// normalizes everything into absolute paths rooted at `folder`. Does not populate `exports`
    /// — those are populated lazily, by a separate call to `load_exports`.
    pub fn from_folder(folder: &Path, source: ModuleSource) -> Res<Manifest> {
        let folder = std::fs::canonicalize(folder).with_context(|_| {
            ErrorKind::ManifestMissing(folder.display().to_string())
        })?;

        let package_json_path = folder.join(PACKAGE_JSON);
        let raw = std::fs::read_to_string(&package_json_path)
            .map_err(|_| ErrorKind::ManifestMissing(folder.display().to_string()))?;
        let mut pkg: PackageJson =
            serde_json::from_str(&raw).context(ErrorKind::ConfigInvalid(format!(
                "{} is not valid JSON",
                package_json_path.display()
            )))?;

        let overlay_path = folder.join(MODULE_OVERLAY);
        if overlay_path.exists() {
            let overlay_raw = std::fs::read_to_string(&overlay_path)?;
            let overlay: Value = serde_json::from_str(&overlay_raw).context(
                ErrorKind::ConfigInvalid(format!("{} is not valid JSON", overlay_path.display())),
            )?;
            // Overlay entirely replaces the antelopeJs subtree; it is never deep-merged.
            pkg.antelope_js = overlay;
        }

        let antelope_js = &pkg.antelope_js;

        let exports_path_rel = antelope_js
            .get("exportsPath")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_EXPORTS_PATH);
        let exports_path = folder.join(exports_path_rel);

        let base_url_rel = antelope_js.get("baseUrl").and_then(Value::as_str).unwrap_or("");
        let base_url = folder.join(base_url_rel);

        let paths = parse_paths(antelope_js.get("paths"), &base_url);

        let mut src_aliases = BTreeMap::new();
        for (alias, replace) in &pkg.module_aliases {
            src_aliases.insert(alias.clone(), folder.join(replace));
        }
        if let Some(aliases) = antelope_js.get("moduleAliases").and_then(Value::as_object) {
            for (alias, replace) in aliases {
                if let Some(replace) = replace.as_str() {
                    src_aliases.insert(alias.clone(), folder.join(replace));
                }
            }
        }

        let imports = parse_declared_imports(antelope_js.get("imports"));
        let declared_exports = parse_declared_exports(antelope_js.get("exports"));

        let main = folder.join(pkg.main.as_deref().unwrap_or("index.js"));

        Ok(Manifest {
            name: pkg.name,
            version: pkg.version,
            folder,
            main,
            base_url,
            exports_path,
            paths,
            exports: BTreeMap::new(),
            imports,
            src_aliases,
            source,
            declared_exports,
        })
    }

    /// Populates `exports`, and appends each self-export to `imports`. Re-entrant: calling
    /// it again (as `reload` does) recomputes everything from the manifest's declared-exports
    /// list rather than accumulating.
    pub fn load_exports(&mut self) -> Res<()> {
        let mut exports = BTreeMap::new();

        if !self.declared_exports.is_empty() {
            for decl in &self.declared_exports {
                match decl {
                    DeclaredExport::Versioned(iface, ver) => {
                        exports.insert(
                            format!("{}@{}", iface, ver),
                            self.exports_path.join(iface).join(ver),
                        );
                    }
                    DeclaredExport::Unversioned(iface) => {
                        for (ver, path) in enumerate_versions(&self.exports_path.join(iface))? {
                            exports.insert(format!("{}@{}", iface, ver), path);
                        }
                    }
                }
            }
        } else if self.exports_path.exists() {
            for iface_dir in crate::util::immediate_subdirs(&self.exports_path).unwrap_or_default()
            {
                let iface = iface_dir.file_name().unwrap().to_string_lossy().into_owned();
                for (ver, path) in enumerate_versions(&iface_dir)? {
                    exports.insert(format!("{}@{}", iface, ver), path);
                }
            }
        }

        for key in exports.keys() {
            self.imports.insert(key.clone());
        }

        self.exports = exports;
        Ok(())
    }

    /// Reparses the manifest file from disk and reruns `load_exports`. If the reparsed manifest
    /// declares no imports at all, the import set is reset to empty rather than retaining stale
    /// entries from before the reload.
    pub fn reload(&mut self) -> Res<()> {
        let had_explicit_imports = !self.imports.is_empty();
        let fresh = Manifest::from_folder(&self.folder, self.source.clone())?;
        let declared_imports_empty = fresh.imports.is_empty();

        self.name = fresh.name;
        self.version = fresh.version;
        self.main = fresh.main;
        self.base_url = fresh.base_url;
        self.exports_path = fresh.exports_path;
        self.paths = fresh.paths;
        self.src_aliases = fresh.src_aliases;
        self.declared_exports = fresh.declared_exports;
        self.imports = fresh.imports;

        self.load_exports()?;

        if declared_imports_empty && had_explicit_imports {
            self.imports.clear();
        }

        Ok(())
    }

    pub fn validate(&self) -> Res<()> {
        if !self.folder.is_absolute() || !self.folder.exists() {
            return Err(Error::from(ErrorKind::ConfigInvalid(format!(
                "module folder {} does not exist",
                self.folder.display()
            ))));
        }
        if !self.main.starts_with(&self.folder) {
            return Err(Error::from(ErrorKind::ConfigInvalid(format!(
                "module main {} escapes its folder",
                self.main.display()
            ))));
        }
        for path in self.exports.values() {
            if !path.starts_with(&self.folder) {
                return Err(Error::from(ErrorKind::ConfigInvalid(format!(
                    "export {} escapes its module folder",
                    path.display()
                ))));
            }
        }
        Ok(())
    }
}

fn parse_paths(value: Option<&Value>, base_url: &Path) -> Vec<PathEntry> {
    let mut out = Vec::new();
    let Some(obj) = value.and_then(Value::as_object) else {
        return out;
    };
    for (key, values) in obj {
        let key = key.trim_end_matches('*').to_string();
        let values = match values.as_array() {
            Some(arr) => arr
                .iter()
                .filter_map(Value::as_str)
                .map(|v| base_url.join(v.trim_end_matches('*')))
                .collect(),
            None => Vec::new(),
        };
        out.push(PathEntry { key, values });
    }
    out
}

fn parse_declared_imports(value: Option<&Value>) -> IndexSet<String> {
    let mut out = IndexSet::new();
    let Some(arr) = value.and_then(Value::as_array) else {
        return out;
    };
    for entry in arr {
        match entry {
            Value::String(s) => {
                out.insert(s.clone());
            }
            Value::Object(obj) => {
                if let Some(name) = obj.get("name").and_then(Value::as_str) {
                    out.insert(name.to_string());
                }
            }
            _ => {}
        }
    }
    out
}

fn parse_declared_exports(value: Option<&Value>) -> Vec<DeclaredExport> {
    let mut out = Vec::new();
    let Some(arr) = value.and_then(Value::as_array) else {
        return out;
    };
    for entry in arr {
        if let Some(s) = entry.as_str() {
            if let Some((iface, ver)) = s.split_once('@') {
                out.push(DeclaredExport::Versioned(iface.to_string(), ver.to_string()));
            } else {
                out.push(DeclaredExport::Unversioned(s.to_string()));
            }
        }
    }
    out
}

/// Enumerates the version subfolders (or `.js` files) of an exports interface directory,
/// returning `(version, absolute-path)` pairs.
fn enumerate_versions(iface_dir: &Path) -> Res<Vec<(String, PathBuf)>> {
    if !iface_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(iface_dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let ver = path.file_name().unwrap().to_string_lossy().into_owned();
            out.push((ver, path));
        } else if file_type.is_file() && path.extension().map_or(false, |e| e == "js") {
            let ver = path.file_stem().unwrap().to_string_lossy().into_owned();
            out.push((ver, path));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
