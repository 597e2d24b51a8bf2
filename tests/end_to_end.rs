//! Exercises the resolve -> acquire -> wire -> construct/start pipeline across module
//! boundaries, the way `resolve_and_acquire` in the binary does, against a throwaway project
//! tree built with `tempfile`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use antelope_runtime::build;
use antelope_runtime::cache::Cache;
use antelope_runtime::config::{self, ExpandedModuleConfig};
use antelope_runtime::manager::{ModuleLifecycle, ModuleManager, NoopLifecycle};
use antelope_runtime::manifest::Manifest;
use antelope_runtime::source::ModuleSource;
use async_trait::async_trait;
use slog::{o, Logger};

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn write_json(path: &Path, value: &serde_json::Value) {
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Writes a module folder with a `package.json` declaring one export interface.
fn write_exporting_module(folder: &Path, name: &str, interface: &str, version: &str) {
    std::fs::create_dir_all(folder).unwrap();
    write_json(
        &folder.join("package.json"),
        &serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "antelopeJs": {
                "exports": [format!("{}@{}", interface, version)],
            },
        }),
    );
    std::fs::create_dir_all(folder.join("interfaces").join(interface).join(version)).unwrap();
}

/// Writes a module folder that imports `interface`.
fn write_importing_module(folder: &Path, name: &str, interface: &str) {
    std::fs::create_dir_all(folder).unwrap();
    write_json(
        &folder.join("package.json"),
        &serde_json::json!({
            "name": name,
            "version": "1.0.0",
            "antelopeJs": {
                "imports": [interface],
            },
        }),
    );
}

struct CountingLifecycle {
    constructed: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
}

#[async_trait]
impl ModuleLifecycle for CountingLifecycle {
    async fn construct(&self, _config: &serde_json::Value) -> antelope_runtime::err::Res<()> {
        self.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn start(&self) -> antelope_runtime::err::Res<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn resolves_acquires_and_wires_two_local_modules() {
    let project = tempfile::tempdir().unwrap();
    let provider_dir = project.path().join("provider");
    let consumer_dir = project.path().join("consumer");
    write_exporting_module(&provider_dir, "provider", "greeting", "1.0.0");
    write_importing_module(&consumer_dir, "consumer", "greeting@1.0.0");

    write_json(
        &project.path().join("antelope.json"),
        &serde_json::json!({
            "name": "sample-project",
            "modules": {
                "provider": { "source": { "type": "local", "path": "provider" } },
                "consumer": { "source": { "type": "local", "path": "consumer" } },
            },
        }),
    );

    let resolved = config::resolve(project.path(), "default").unwrap();
    assert_eq!(resolved.modules.len(), 2);

    let cache = Arc::new(Cache::new(project.path().join(".antelope/cache"), test_logger()));
    cache.load().await.unwrap();
    let registry = antelope_runtime::loader::Registry::with_default_loaders().await;

    let mut loaded: Vec<(String, Manifest, ExpandedModuleConfig)> = Vec::new();
    for (id, module_config) in &resolved.modules {
        let manifests = registry.load(project.path(), cache.clone(), module_config.source.clone()).await.unwrap();
        assert_eq!(manifests.len(), 1);
        loaded.push((id.clone(), manifests.into_iter().next().unwrap(), module_config.clone()));
    }

    let constructed = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicUsize::new(0));
    let manager = ModuleManager::new(test_logger(), None);
    let entries = loaded
        .into_iter()
        .map(|(id, manifest, config)| {
            let callbacks: Arc<dyn ModuleLifecycle> =
                Arc::new(CountingLifecycle { constructed: constructed.clone(), started: started.clone() });
            (id, manifest, config, callbacks)
        })
        .collect();
    manager.add_modules(entries).await.unwrap();

    manager.ensure_graph_is_valid().await.unwrap();
    manager.construct_all().await.unwrap();
    manager.start_all().await.unwrap();

    assert_eq!(constructed.load(Ordering::SeqCst), 2);
    assert_eq!(started.load(Ordering::SeqCst), 2);

    let consumer_main = consumer_dir.canonicalize().unwrap().join("index.js");
    let resolved_path = manager.resolve("@ajs/greeting/1.0.0/handler.js", Some(&consumer_main)).await.unwrap();
    assert_eq!(
        resolved_path,
        Some(provider_dir.canonicalize().unwrap().join("interfaces/greeting/1.0.0/handler.js"))
    );

    manager.stop_all().await.unwrap();
    manager.destroy_all().await.unwrap();
}

#[tokio::test]
async fn unresolved_import_is_reported_before_construction() {
    let project = tempfile::tempdir().unwrap();
    let consumer_dir = project.path().join("consumer");
    write_importing_module(&consumer_dir, "consumer", "missing@1.0.0");

    write_json(
        &project.path().join("antelope.json"),
        &serde_json::json!({
            "name": "sample-project",
            "modules": { "consumer": { "source": { "type": "local", "path": "consumer" } } },
        }),
    );

    let resolved = config::resolve(project.path(), "default").unwrap();
    let cache = Arc::new(Cache::new(project.path().join(".antelope/cache"), test_logger()));
    cache.load().await.unwrap();
    let registry = antelope_runtime::loader::Registry::with_default_loaders().await;

    let manager = ModuleManager::new(test_logger(), None);
    let mut entries = Vec::new();
    for (id, module_config) in &resolved.modules {
        let manifests = registry.load(project.path(), cache.clone(), module_config.source.clone()).await.unwrap();
        let callbacks: Arc<dyn ModuleLifecycle> = Arc::new(NoopLifecycle);
        entries.push((id.clone(), manifests.into_iter().next().unwrap(), module_config.clone(), callbacks));
    }
    manager.add_modules(entries).await.unwrap();

    let err = manager.ensure_graph_is_valid().await.unwrap_err();
    assert!(matches!(err.kind(), antelope_runtime::err::ErrorKind::GraphUnresolved(_)));
}

#[tokio::test]
async fn build_artifact_round_trips_through_disk_and_replays_without_loaders() {
    let project = tempfile::tempdir().unwrap();
    let provider_dir = project.path().join("provider");
    write_exporting_module(&provider_dir, "provider", "greeting", "1.0.0");

    write_json(
        &project.path().join("antelope.json"),
        &serde_json::json!({
            "name": "sample-project",
            "modules": { "provider": { "source": { "type": "local", "path": "provider" } } },
        }),
    );

    let (resolved, hash) = build::compute_config_hash(project.path(), "default").unwrap();
    let cache = Arc::new(Cache::new(project.path().join(".antelope/cache"), test_logger()));
    cache.load().await.unwrap();
    let registry = antelope_runtime::loader::Registry::with_default_loaders().await;

    let mut manifests = std::collections::BTreeMap::new();
    for (id, module_config) in &resolved.modules {
        let loaded = registry.load(project.path(), cache.clone(), module_config.source.clone()).await.unwrap();
        manifests.insert(id.clone(), loaded.into_iter().next().unwrap());
    }

    build::write_build_artifact(project.path(), "default", &resolved, &hash, &manifests, "0", &test_logger()).unwrap();

    let artifact = build::read_build_artifact(project.path()).unwrap();
    assert_eq!(artifact.modules.len(), 1);
    build::ensure_build_modules_exist(&artifact).unwrap();

    // Replaying from the artifact alone, no loader/registry involved: the embedded manifest is
    // the only source of truth for `launch-from-build`.
    let manager = ModuleManager::new(test_logger(), None);
    let entries = artifact
        .modules
        .iter()
        .map(|(id, built)| {
            let config = ExpandedModuleConfig {
                source: built.manifest.source.clone(),
                config: built.config.clone(),
                import_overrides: built.import_overrides.clone(),
                disabled_exports: built.disabled_exports.clone(),
            };
            let callbacks: Arc<dyn ModuleLifecycle> = Arc::new(NoopLifecycle);
            (id.clone(), built.manifest.clone(), config, callbacks)
        })
        .collect();
    manager.add_modules(entries).await.unwrap();
    manager.ensure_graph_is_valid().await.unwrap();
    manager.construct_all().await.unwrap();
    manager.start_all().await.unwrap();
    manager.destroy_all().await.unwrap();
}

#[tokio::test]
async fn hot_reload_picks_up_a_changed_manifest_end_to_end() {
    let project = tempfile::tempdir().unwrap();
    let module_dir = project.path().join("m");
    std::fs::create_dir_all(&module_dir).unwrap();
    write_json(&module_dir.join("package.json"), &serde_json::json!({ "name": "m", "version": "1.0.0" }));

    let manifest = Manifest::from_folder(
        &module_dir,
        ModuleSource::Local { path: module_dir.clone(), main: None, watch_dir: None, install_command: None, id: None },
    )
    .unwrap();

    let manager = ModuleManager::new(test_logger(), None);
    let callbacks: Arc<dyn ModuleLifecycle> = Arc::new(NoopLifecycle);
    let config = ExpandedModuleConfig {
        source: manifest.source.clone(),
        config: serde_json::json!({}),
        import_overrides: Vec::new(),
        disabled_exports: BTreeSet::new(),
    };
    manager.add_modules(vec![("m".to_string(), manifest, config, callbacks)]).await.unwrap();
    manager.construct_all().await.unwrap();

    write_json(&module_dir.join("package.json"), &serde_json::json!({ "name": "m", "version": "2.0.0" }));
    manager.reload("m").await.unwrap();

    let reloaded = manager.manifest_snapshot("m").await.unwrap();
    assert_eq!(reloaded.version, "2.0.0");
}
