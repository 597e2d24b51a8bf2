//! C7 — resolves a project folder + environment name into a normalized, hashable configuration.
//!
//! Grounded on `elba`'s own `util::config::Config`, which layers defaults, a project file and
//! environment variables into one value; the layering steps here are richer (environment
//! selection, sidecar files, per-module local config, shorthand expansion, env-var path
//! overrides, template expansion) so the merge itself is hand-written over `serde_json::Value`
//! (see [`merge`]) rather than reused from a `config`-crate-backed implementation, which has no
//! notion of any of those steps.

mod merge;
mod template;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use failure::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::err::{ErrorKind, Res};
use crate::source::ModuleSource;

const MANIFEST_FILE: &str = "antelope.json";
const MODULE_OVERLAY: &str = "antelope.module.json";
const DEFAULT_CACHE_FOLDER: &str = ".antelope/cache";
pub const DEFAULT_ENV: &str = "default";

/// One explicit `{interface, source, id?}` association override.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportOverride {
    pub interface: String,
    pub source: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// A fully-normalized module entry: whatever shorthand the user wrote, expanded to its explicit
/// form.
#[derive(Clone, Debug)]
pub struct ExpandedModuleConfig {
    pub source: ModuleSource,
    pub config: Value,
    pub import_overrides: Vec<ImportOverride>,
    pub disabled_exports: BTreeSet<String>,
}

/// The output of the resolver: a pure data value, suitable for hashing by C10.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub name: String,
    pub cache_folder: PathBuf,
    pub project_folder: PathBuf,
    pub logging: Option<Value>,
    pub env_overrides: BTreeMap<String, Value>,
    pub modules: BTreeMap<String, ExpandedModuleConfig>,
}

/// Runs the full resolution pipeline (manifest load, environment overlay, sidecar and local
/// module config merges, shorthand expansion, env-var overrides, template expansion) against
/// `project_folder` for environment `env`.
pub fn resolve(project_folder: &Path, env: &str) -> Res<ResolvedConfig> {
    let project_folder = std::fs::canonicalize(project_folder)
        .with_context(|_| ErrorKind::ConfigInvalid(project_folder.display().to_string()))?;

    let base_path = project_folder.join(MANIFEST_FILE);
    let raw = std::fs::read_to_string(&base_path)
        .map_err(|_| ErrorKind::ConfigInvalid(format!("missing {}", base_path.display())))?;
    let mut doc: Value = serde_json::from_str(&raw)
        .context(ErrorKind::ConfigInvalid(format!("{} is not valid JSON", base_path.display())))?;

    normalize_module_entries(&mut doc);

    if env != DEFAULT_ENV {
        if let Some(overlay) = doc.get("environments").and_then(|e| e.get(env)).cloned() {
            merge::deep_merge(&mut doc, &overlay);
        }
    }

    merge_sidecar_module_configs(&mut doc, &project_folder)?;
    merge_local_module_configs(&mut doc, &project_folder)?;
    expand_module_shorthand(&mut doc);
    apply_env_var_overrides(&mut doc);

    let scope = template::build_scope(&doc);
    let doc = template::expand_templates(&doc, &scope);

    finalize(doc, project_folder)
}

/// Converts any bare-string module entry (`"module-name": "1.2.3"`) into `{"version": "1.2.3"}`
/// so every later step can assume an object shape.
fn normalize_module_entries(doc: &mut Value) {
    let Some(modules) = doc.get_mut("modules").and_then(Value::as_object_mut) else {
        return;
    };
    for entry in modules.values_mut() {
        if let Value::String(version) = entry {
            *entry = serde_json::json!({ "version": version });
        }
    }
}

fn merge_sidecar_module_configs(doc: &mut Value, project_folder: &Path) -> Res<()> {
    let module_names: Vec<String> = doc
        .get("modules")
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    for name in module_names {
        let sidecar_path = project_folder.join(format!("antelope.{}.json", name));
        if !sidecar_path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&sidecar_path)?;
        let overlay: Value = serde_json::from_str(&raw)
            .context(ErrorKind::ConfigInvalid(format!("{} is not valid JSON", sidecar_path.display())))?;

        let modules = doc.get_mut("modules").unwrap().as_object_mut().unwrap();
        let entry = modules.entry(name).or_insert_with(|| serde_json::json!({}));
        let config = entry
            .as_object_mut()
            .unwrap()
            .entry("config")
            .or_insert_with(|| serde_json::json!({}));
        merge::deep_merge(config, &overlay);
    }
    Ok(())
}

fn merge_local_module_configs(doc: &mut Value, project_folder: &Path) -> Res<()> {
    let Some(modules) = doc.get("modules").and_then(Value::as_object) else {
        return Ok(());
    };
    let local_modules: Vec<(String, PathBuf)> = modules
        .iter()
        .filter_map(|(name, entry)| {
            let source = entry.get("source")?;
            if source.get("type")?.as_str()? != "local" {
                return None;
            }
            let path = source.get("path")?.as_str()?;
            let resolved = if Path::new(path).is_relative() {
                project_folder.join(path)
            } else {
                PathBuf::from(path)
            };
            Some((name.clone(), resolved))
        })
        .collect();

    for (name, path) in local_modules {
        let mut overlay = serde_json::json!({});

        let package_json = path.join("package.json");
        if let Ok(raw) = std::fs::read_to_string(&package_json) {
            if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                if let Some(config) = parsed.get("antelopeJs").and_then(|a| a.get("config")) {
                    merge::deep_merge(&mut overlay, config);
                }
            }
        }

        let module_overlay_path = path.join(MODULE_OVERLAY);
        if let Ok(raw) = std::fs::read_to_string(&module_overlay_path) {
            if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                if let Some(config) = parsed.get("config") {
                    merge::deep_merge(&mut overlay, config);
                }
            }
        }

        if overlay.as_object().map_or(true, |m| m.is_empty()) {
            continue;
        }

        let modules = doc.get_mut("modules").unwrap().as_object_mut().unwrap();
        let entry = modules.get_mut(&name).unwrap();
        let config = entry
            .as_object_mut()
            .unwrap()
            .entry("config")
            .or_insert_with(|| serde_json::json!({}));
        merge::deep_merge(config, &overlay);
    }
    Ok(())
}

fn expand_module_shorthand(doc: &mut Value) {
    let Some(modules) = doc.get_mut("modules").and_then(Value::as_object_mut) else {
        return;
    };

    for (name, entry) in modules.iter_mut() {
        let obj = entry.as_object().cloned().unwrap_or_default();

        let source = if let Some(source) = obj.get("source") {
            source.clone()
        } else {
            let version = obj.get("version").and_then(Value::as_str).unwrap_or("*");
            serde_json::json!({ "type": "package", "package": name, "version": version })
        };

        let config = obj.get("config").cloned().unwrap_or_else(|| serde_json::json!({}));
        let import_overrides = normalize_import_overrides(obj.get("importOverrides"));
        let disabled_exports: Vec<String> = obj
            .get("disabledExports")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        *entry = serde_json::json!({
            "source": source,
            "config": config,
            "importOverrides": import_overrides,
            "disabledExports": disabled_exports,
        });
    }
}

fn normalize_import_overrides(value: Option<&Value>) -> Vec<ImportOverride> {
    let Some(value) = value else {
        return Vec::new();
    };

    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                Some(ImportOverride {
                    interface: item.get("interface")?.as_str()?.to_string(),
                    source: item.get("source")?.as_str()?.to_string(),
                    id: item.get("id").and_then(Value::as_str).map(String::from),
                })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(iface, provider)| {
                let (source, id) = match provider {
                    Value::String(s) => (s.clone(), None),
                    Value::Object(obj) => (
                        obj.get("source").and_then(Value::as_str)?.to_string(),
                        obj.get("id").and_then(Value::as_str).map(String::from),
                    ),
                    _ => return None,
                };
                Some(ImportOverride { interface: iface.clone(), source, id })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn apply_env_var_overrides(doc: &mut Value) {
    let Some(overrides) = doc.get("envOverrides").and_then(Value::as_object).cloned() else {
        return;
    };

    for (env_var, paths) in overrides {
        let Ok(value) = std::env::var(&env_var) else {
            continue;
        };
        let paths: Vec<String> = match paths {
            Value::String(s) => vec![s],
            Value::Array(arr) => arr.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            _ => Vec::new(),
        };
        for path in paths {
            merge::set_at_path(doc, &path, Value::String(value.clone()));
        }
    }
}

fn finalize(doc: Value, project_folder: PathBuf) -> Res<ResolvedConfig> {
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ErrorKind::ConfigInvalid("antelope.json is missing \"name\"".to_string()))?
        .to_string();

    let cache_folder_raw =
        doc.get("cacheFolder").and_then(Value::as_str).unwrap_or(DEFAULT_CACHE_FOLDER);
    let cache_folder = if Path::new(cache_folder_raw).is_relative() {
        project_folder.join(cache_folder_raw)
    } else {
        PathBuf::from(cache_folder_raw)
    };

    let logging = doc.get("logging").cloned();
    let env_overrides = doc
        .get("envOverrides")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let mut modules = BTreeMap::new();
    if let Some(entries) = doc.get("modules").and_then(Value::as_object) {
        for (name, entry) in entries {
            let source: ModuleSource = serde_json::from_value(entry["source"].clone())
                .context(ErrorKind::ConfigInvalid(format!("module {} has an invalid source", name)))?;
            let config = entry.get("config").cloned().unwrap_or_else(|| serde_json::json!({}));
            let import_overrides: Vec<ImportOverride> =
                serde_json::from_value(entry["importOverrides"].clone()).unwrap_or_default();
            let disabled_exports: BTreeSet<String> = entry
                .get("disabledExports")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();

            modules.insert(
                name.clone(),
                ExpandedModuleConfig { source, config, import_overrides, disabled_exports },
            );
        }
    }

    Ok(ResolvedConfig { name, cache_folder, project_folder, logging, env_overrides, modules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn shorthand_version_expands_to_package_source() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "antelope.json",
            r#"{"name": "sample", "modules": {"my-module": "1.0.0"}}"#,
        );

        let resolved = resolve(dir.path(), DEFAULT_ENV).unwrap();
        let module = &resolved.modules["my-module"];
        assert_eq!(
            module.source,
            ModuleSource::Package {
                package: "my-module".to_string(),
                version: "1.0.0".to_string(),
                ignore_cache: false,
                id: None,
            }
        );
        assert!(module.import_overrides.is_empty());
        assert!(module.disabled_exports.is_empty());
    }

    #[test]
    fn environment_overlay_merges_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "antelope.json",
            r#"{
                "name": "sample",
                "cacheFolder": "base-cache",
                "modules": {},
                "environments": { "staging": { "cacheFolder": "staging-cache" } }
            }"#,
        );

        let default = resolve(dir.path(), "default").unwrap();
        assert!(default.cache_folder.ends_with("base-cache"));

        let staging = resolve(dir.path(), "staging").unwrap();
        assert!(staging.cache_folder.ends_with("staging-cache"));
    }

    #[test]
    fn sidecar_config_merges_onto_module_config() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "antelope.json",
            r#"{"name": "sample", "modules": {"alpha": {"source": {"type": "package", "package": "alpha", "version": "1.0.0"}}}}"#,
        );
        write(dir.path(), "antelope.alpha.json", r#"{"enabled": true}"#);

        let resolved = resolve(dir.path(), DEFAULT_ENV).unwrap();
        assert_eq!(resolved.modules["alpha"].config, serde_json::json!({"enabled": true}));
    }

    #[test]
    fn missing_antelope_json_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), DEFAULT_ENV).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConfigInvalid(_)));
    }

    #[test]
    fn env_var_override_writes_into_module_config() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "antelope.json",
            r#"{
                "name": "sample",
                "modules": {"alpha": {"source": {"type": "package", "package": "alpha", "version": "1.0.0"}}},
                "envOverrides": {"ANTELOPE_TEST_ALPHA_TOKEN": "modules.alpha.config.token"}
            }"#,
        );
        std::env::set_var("ANTELOPE_TEST_ALPHA_TOKEN", "secret");
        let resolved = resolve(dir.path(), DEFAULT_ENV).unwrap();
        std::env::remove_var("ANTELOPE_TEST_ALPHA_TOKEN");
        assert_eq!(resolved.modules["alpha"].config["token"], serde_json::json!("secret"));
    }

    #[test]
    fn deterministic_hash_seed_scenario() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "antelope.json",
            r#"{"name":"sample","modules":{"zeta":{"source":{"type":"local","path":"./zeta"}},"alpha":{"source":{"type":"local","path":"./alpha"}}}}"#,
        );
        for name in ["zeta", "alpha"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        write(dir.path(), "antelope.alpha.json", r#"{"enabled": true}"#);
        write(dir.path(), "antelope.zeta.json", r#"{"enabled": false}"#);

        let a = resolve(dir.path(), "production").unwrap();
        let b = resolve(dir.path(), "production").unwrap();
        let a_hash = crate::util::hash::config_hash(&config_to_value(&a), "production");
        let b_hash = crate::util::hash::config_hash(&config_to_value(&b), "production");
        assert_eq!(a_hash, b_hash);

        let c = resolve(dir.path(), "staging").unwrap();
        let c_hash = crate::util::hash::config_hash(&config_to_value(&c), "staging");
        assert_ne!(a_hash, c_hash);
    }

    fn config_to_value(config: &ResolvedConfig) -> Value {
        serde_json::json!({
            "name": config.name,
            "modules": config.modules.iter().map(|(k, v)| (k.clone(), v.config.clone())).collect::<BTreeMap<_, _>>(),
        })
    }
}
