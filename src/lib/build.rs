//! C10 — the on-disk build artifact: a frozen, hashable snapshot of a resolved project, written by
//! `build` and consumed by `launch-from-build`.
//!
//! Grounded on `elba`'s own `build/` directory, which serializes a resolved dependency graph to
//! `elba.lock` so a later command can skip re-resolution; this carries the same "resolve once,
//! replay many times" shape but over the configuration graph rather than a package graph.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::Logger;

use crate::config::{self, ExpandedModuleConfig, ImportOverride, ResolvedConfig};
use crate::err::{Error, ErrorKind, Res};
use crate::manifest::Manifest;
use crate::util;

const BUILD_DIR: &str = ".antelope/build";
const BUILD_FILE: &str = "build.json";
const ARTIFACT_VERSION: &str = "1";

/// One module's frozen record inside the artifact: its loaded manifest (embedded whole, so
/// `launch-from-build` never re-parses `package.json`) plus the expanded config that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltModule {
    pub manifest: Manifest,
    pub config: Value,
    pub import_overrides: Vec<ImportOverride>,
    pub disabled_exports: std::collections::BTreeSet<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltConfig {
    pub name: String,
    pub cache_folder: PathBuf,
    pub project_folder: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    pub env_overrides: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    pub version: String,
    pub build_time: String,
    pub config_hash: String,
    pub env: String,
    pub config: BuiltConfig,
    pub modules: BTreeMap<String, BuiltModule>,
}

/// Runs the full resolver and hashes its canonicalized output. Deterministic across runs
/// for fixed file contents, fixed `env` and fixed environment-variable overrides.
pub fn compute_config_hash(project_folder: &Path, env: &str) -> Res<(ResolvedConfig, String)> {
    let resolved = config::resolve(project_folder, env)?;
    let value = resolved_to_value(&resolved);
    let hash = util::hash::config_hash(&value, env);
    Ok((resolved, hash))
}

fn resolved_to_value(resolved: &ResolvedConfig) -> Value {
    serde_json::json!({
        "name": resolved.name,
        "cacheFolder": resolved.cache_folder,
        "projectFolder": resolved.project_folder,
        "logging": resolved.logging,
        "envOverrides": resolved.env_overrides,
        "modules": resolved.modules.iter().map(|(id, m)| (id.clone(), module_config_to_value(m))).collect::<serde_json::Map<_, _>>(),
    })
}

fn module_config_to_value(m: &ExpandedModuleConfig) -> Value {
    serde_json::json!({
        "source": m.source,
        "config": m.config,
        "importOverrides": m.import_overrides,
        "disabledExports": m.disabled_exports,
    })
}

/// Assembles and writes the artifact for `project_folder`/`env`, given the already-loaded
/// manifests keyed by module id (loading manifests is the module manager's concern, not this
/// module's).
pub fn write_build_artifact(
    project_folder: &Path,
    env: &str,
    resolved: &ResolvedConfig,
    config_hash: &str,
    manifests: &BTreeMap<String, Manifest>,
    build_time: &str,
    log: &Logger,
) -> Res<BuildArtifact> {
    let mut modules = BTreeMap::new();
    for (id, module_config) in &resolved.modules {
        let manifest = manifests.get(id).ok_or_else(|| {
            Error::from(ErrorKind::ConfigInvalid(format!("no loaded manifest for module {}", id)))
        })?;
        modules.insert(
            id.clone(),
            BuiltModule {
                manifest: manifest.clone(),
                config: module_config.config.clone(),
                import_overrides: module_config.import_overrides.clone(),
                disabled_exports: module_config.disabled_exports.clone(),
            },
        );
    }

    let artifact = BuildArtifact {
        version: ARTIFACT_VERSION.to_string(),
        build_time: build_time.to_string(),
        config_hash: config_hash.to_string(),
        env: env.to_string(),
        config: BuiltConfig {
            name: resolved.name.clone(),
            cache_folder: resolved.cache_folder.clone(),
            project_folder: resolved.project_folder.clone(),
            logging: resolved.logging.clone(),
            env_overrides: resolved.env_overrides.clone(),
        },
        modules,
    };

    let build_dir = project_folder.join(BUILD_DIR);
    if build_dir.exists() {
        remove_dir_all::remove_dir_all(&build_dir)
            .map_err(|e| Error::from(ErrorKind::Other(format!("could not clear build dir: {}", e))))?;
    }
    std::fs::create_dir_all(&build_dir)?;

    let mut serialized = serde_json::to_string_pretty(&artifact)?;
    serialized.push('\n');
    std::fs::write(build_dir.join(BUILD_FILE), serialized)?;

    slog::info!(log, "wrote build artifact"; "path" => build_dir.join(BUILD_FILE).display().to_string());
    Ok(artifact)
}

pub fn read_build_artifact(project_folder: &Path) -> Res<BuildArtifact> {
    let path = project_folder.join(BUILD_DIR).join(BUILD_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|_| Error::from(ErrorKind::BuildMissing))?;
    let artifact: BuildArtifact = serde_json::from_str(&raw)?;
    if artifact.version != ARTIFACT_VERSION {
        return Err(Error::from(ErrorKind::ConfigInvalid(format!(
            "unsupported build artifact version {}",
            artifact.version
        ))));
    }
    Ok(artifact)
}

/// Verifies every serialized module folder still exists; names the first missing one in the
/// error so the user knows which module needs a rebuild.
pub fn ensure_build_modules_exist(artifact: &BuildArtifact) -> Res<()> {
    for (id, module) in &artifact.modules {
        if !module.manifest.folder.exists() {
            return Err(Error::from(ErrorKind::ConfigInvalid(format!(
                "module `{}` folder `{}` no longer exists; run `build` again",
                id,
                module.manifest.folder.display()
            ))));
        }
    }
    Ok(())
}

/// Recomputes the config hash and logs a single warning if it no longer matches the artifact's
/// recorded hash, or if recomputation itself fails. Never returns an error: staleness is
/// advisory, not fatal.
pub fn warn_if_build_is_stale(project_folder: &Path, artifact: &BuildArtifact, log: &Logger) {
    match compute_config_hash(project_folder, &artifact.env) {
        Ok((_, hash)) if hash == artifact.config_hash => {}
        Ok((_, hash)) => {
            slog::warn!(log, "build artifact is stale"; "recorded" => &artifact.config_hash, "current" => hash);
        }
        Err(e) => {
            slog::warn!(log, "could not verify build artifact freshness"; "error" => %e);
        }
    }
}
