//! C9 — owns the loaded module set, the association graph, lifecycle transitions and hot reload.
//!
//! Has no single analogue in `elba` itself; it plays the role `elba`'s own `bin/main.rs` command
//! handlers play (owning a `Cache`/`Config`/resolved graph and driving operations across it) but
//! as a long-lived, reusable library type rather than one-shot CLI glue. The `tokio::sync::Mutex`
//! "one logical owner" discipline carries over directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use slog::Logger;
use tokio::sync::{mpsc, Mutex};

use crate::config::ExpandedModuleConfig;
use crate::err::{Error, ErrorKind, Res};
use crate::manifest::Manifest;
use crate::resolver::{self, ModuleView};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Loaded,
    Constructed,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    ModuleConstructed,
    ModuleStarted,
    ModuleStopped,
    ModuleDestroyed,
}

/// The capability record a module's loaded entrypoint supplies. Every method has a no-op default so a module that implements none of
/// the lifecycle hooks needs nothing but [`NoopLifecycle`].
#[async_trait]
pub trait ModuleLifecycle: Send + Sync {
    async fn construct(&self, _config: &Value) -> Res<()> {
        Ok(())
    }
    async fn start(&self) -> Res<()> {
        Ok(())
    }
    async fn stop(&self) -> Res<()> {
        Ok(())
    }
    async fn destroy(&self) -> Res<()> {
        Ok(())
    }
}

pub struct NoopLifecycle;
impl ModuleLifecycle for NoopLifecycle {}

/// Forgets cached compiled artifacts under a module's folder; delegated to the surrounding
/// runtime rather than implemented here.
pub trait ArtifactInvalidator: Send + Sync {
    fn unrequire(&self, module_id: &str, folder: &Path);
}

pub struct ModuleEntry {
    pub id: String,
    pub manifest: Manifest,
    pub config: ExpandedModuleConfig,
    pub state: LifecycleState,
    pub callbacks: Arc<dyn ModuleLifecycle>,
}

type Associations = BTreeMap<String, BTreeMap<String, Option<String>>>;

pub struct ModuleManager {
    log: Logger,
    loaded: Mutex<IndexMap<String, ModuleEntry>>,
    associations: Mutex<Associations>,
    change_tx: mpsc::UnboundedSender<String>,
    change_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    invalidator: Option<Arc<dyn ArtifactInvalidator>>,
}

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

impl ModuleManager {
    pub fn new(log: Logger, invalidator: Option<Arc<dyn ArtifactInvalidator>>) -> ModuleManager {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        ModuleManager {
            log,
            loaded: Mutex::new(IndexMap::new()),
            associations: Mutex::new(BTreeMap::new()),
            change_tx,
            change_rx: Mutex::new(Some(change_rx)),
            invalidator,
        }
    }

    /// Appends `entries`, refusing duplicate ids, then rebuilds the association map.
    pub async fn add_modules(
        &self,
        entries: Vec<(String, Manifest, ExpandedModuleConfig, Arc<dyn ModuleLifecycle>)>,
    ) -> Res<()> {
        {
            let loaded = self.loaded.lock().await;
            for (id, ..) in &entries {
                if loaded.contains_key(id) {
                    return Err(Error::from(ErrorKind::ConfigInvalid(format!(
                        "duplicate module id {}",
                        id
                    ))));
                }
            }
        }
        {
            let mut loaded = self.loaded.lock().await;
            for (id, manifest, config, callbacks) in entries {
                loaded.insert(
                    id.clone(),
                    ModuleEntry { id, manifest, config, state: LifecycleState::Loaded, callbacks },
                );
            }
        }
        self.refresh_associations().await;
        Ok(())
    }

    /// Recomputes, for every loaded module and every declared import, which other module (if any)
    /// provides it. An explicit `importOverrides` entry always wins; otherwise the unique
    /// non-disabled exporter wins; zero or several candidates resolve to `None`.
    pub async fn refresh_associations(&self) {
        let loaded = self.loaded.lock().await;

        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, entry) in loaded.iter() {
            by_name.entry(entry.manifest.name.clone()).or_default().push(id.clone());
        }
        for (name, ids) in &by_name {
            if ids.len() > 1 {
                slog::warn!(self.log, "module name collision"; "name" => name, "ids" => format!("{:?}", ids));
            }
        }

        let mut associations = Associations::new();
        for (id, entry) in loaded.iter() {
            let mut per_module = BTreeMap::new();
            for import in entry.manifest.imports.iter() {
                let provider = entry
                    .config
                    .import_overrides
                    .iter()
                    .find(|o| &o.interface == import)
                    .map(|o| o.source.clone())
                    .or_else(|| {
                        let candidates: Vec<&String> = loaded
                            .iter()
                            .filter(|(_, e)| {
                                e.manifest.exports.contains_key(import)
                                    && !e.config.disabled_exports.contains(import)
                            })
                            .map(|(id, _)| id)
                            .collect();
                        if candidates.len() == 1 {
                            Some(candidates[0].clone())
                        } else {
                            None
                        }
                    });
                per_module.insert(import.clone(), provider);
            }
            associations.insert(id.clone(), per_module);
        }

        *self.associations.lock().await = associations;
    }

    /// Collects `(moduleId, missingInterface)` pairs for every declared import with no resolved
    /// provider. An empty result means the graph is launchable.
    pub async fn unresolved_imports(&self) -> Vec<(String, String)> {
        let associations = self.associations.lock().await;
        let mut out = Vec::new();
        for (id, per_module) in associations.iter() {
            for (iface, provider) in per_module {
                if provider.is_none() {
                    out.push((id.clone(), iface.clone()));
                }
            }
        }
        out
    }

    /// Aborts with the full list of unresolved imports, one per line, or succeeds silently.
    pub async fn ensure_graph_is_valid(&self) -> Res<()> {
        let missing = self.unresolved_imports().await;
        if missing.is_empty() {
            return Ok(());
        }
        let detail = missing
            .iter()
            .map(|(id, iface)| format!("{}: missing provider for {}", id, iface))
            .collect::<Vec<_>>()
            .join("\n");
        Err(Error::from(ErrorKind::GraphUnresolved(detail)))
    }

    pub async fn construct_modules(&self, ids: &[String]) -> Res<()> {
        for id in ids {
            self.construct_one(id).await?;
        }
        Ok(())
    }

    pub async fn start_modules(&self, ids: &[String]) -> Res<()> {
        for id in ids {
            self.start_one(id).await?;
        }
        Ok(())
    }

    pub async fn construct_all(&self) -> Res<()> {
        let ids = self.ordered_ids().await;
        self.construct_modules(&ids).await
    }

    pub async fn start_all(&self) -> Res<()> {
        let ids = self.ordered_ids().await;
        self.start_modules(&ids).await
    }

    pub async fn stop_all(&self) -> Res<()> {
        let ids = self.ordered_ids().await;
        for id in &ids {
            self.stop_one(id).await;
        }
        Ok(())
    }

    /// Destroys every loaded module in reverse addition order, continuing past individual
    /// failures (logged) so a best-effort teardown always completes.
    pub async fn destroy_all(&self) -> Res<()> {
        let mut ids = self.ordered_ids().await;
        ids.reverse();
        for id in &ids {
            if let Err(e) = self.destroy_one(id).await {
                slog::error!(self.log, "module destroy failed"; "module" => id, "error" => %e);
            }
        }
        Ok(())
    }

    async fn ordered_ids(&self) -> Vec<String> {
        self.loaded.lock().await.keys().cloned().collect()
    }

    async fn construct_one(&self, id: &str) -> Res<()> {
        let mut loaded = self.loaded.lock().await;
        let entry = loaded
            .get_mut(id)
            .ok_or_else(|| Error::from(ErrorKind::ConfigInvalid(format!("unknown module {}", id))))?;
        if entry.state != LifecycleState::Loaded {
            return Ok(());
        }
        let config = entry.config.config.clone();
        let callbacks = entry.callbacks.clone();
        drop(loaded);

        callbacks.construct(&config).await.map_err(|e| {
            Error::from(ErrorKind::LifecycleCallbackError {
                module: id.to_string(),
                detail: e.to_string(),
            })
        })?;

        let mut loaded = self.loaded.lock().await;
        loaded.get_mut(id).unwrap().state = LifecycleState::Constructed;
        slog::debug!(self.log, "module constructed"; "module" => id);
        Ok(())
    }

    async fn start_one(&self, id: &str) -> Res<()> {
        let mut loaded = self.loaded.lock().await;
        let entry = loaded
            .get_mut(id)
            .ok_or_else(|| Error::from(ErrorKind::ConfigInvalid(format!("unknown module {}", id))))?;
        if entry.state != LifecycleState::Constructed {
            return Ok(());
        }
        let callbacks = entry.callbacks.clone();
        drop(loaded);

        callbacks.start().await.map_err(|e| {
            Error::from(ErrorKind::LifecycleCallbackError {
                module: id.to_string(),
                detail: e.to_string(),
            })
        })?;

        let mut loaded = self.loaded.lock().await;
        loaded.get_mut(id).unwrap().state = LifecycleState::Active;
        slog::info!(self.log, "module started"; "module" => id);
        Ok(())
    }

    /// Stop failures are logged and swallowed: the module still transitions to
    /// `Constructed` so `destroy` downstream isn't blocked by a misbehaving `stop` hook.
    async fn stop_one(&self, id: &str) {
        let mut loaded = self.loaded.lock().await;
        let entry = match loaded.get_mut(id) {
            Some(e) => e,
            None => return,
        };
        if entry.state != LifecycleState::Active {
            return;
        }
        let callbacks = entry.callbacks.clone();
        drop(loaded);

        if let Err(e) = callbacks.stop().await {
            slog::warn!(self.log, "module stop callback failed"; "module" => id, "error" => %e);
        }

        let mut loaded = self.loaded.lock().await;
        loaded.get_mut(id).unwrap().state = LifecycleState::Constructed;
        slog::debug!(self.log, "module stopped"; "module" => id);
    }

    /// `destroy` on an Active module stops it first.
    async fn destroy_one(&self, id: &str) -> Res<()> {
        self.stop_one(id).await;

        let mut loaded = self.loaded.lock().await;
        let entry = match loaded.get_mut(id) {
            Some(e) => e,
            None => return Ok(()),
        };
        let callbacks = entry.callbacks.clone();
        let folder = entry.manifest.folder.clone();
        drop(loaded);

        callbacks.destroy().await.map_err(|e| {
            Error::from(ErrorKind::LifecycleCallbackError {
                module: id.to_string(),
                detail: e.to_string(),
            })
        })?;

        if let Some(invalidator) = &self.invalidator {
            invalidator.unrequire(id, &folder);
        }

        let mut loaded = self.loaded.lock().await;
        loaded.get_mut(id).unwrap().state = LifecycleState::Loaded;
        slog::debug!(self.log, "module destroyed"; "module" => id);
        Ok(())
    }

    pub async fn get_module_entry_state(&self, id: &str) -> Option<LifecycleState> {
        self.loaded.lock().await.get(id).map(|e| e.state)
    }

    pub async fn list_modules(&self) -> Vec<String> {
        self.ordered_ids().await
    }

    /// A read-only copy of a loaded module's manifest, for callers outside the manager (the
    /// build-artifact writer, a file-watch poller) that need to inspect it without taking part in
    /// lifecycle transitions.
    pub async fn manifest_snapshot(&self, id: &str) -> Option<Manifest> {
        self.loaded.lock().await.get(id).map(|e| e.manifest.clone())
    }

    pub async fn module_folder(&self, id: &str) -> Option<PathBuf> {
        self.loaded.lock().await.get(id).map(|e| e.manifest.folder.clone())
    }

    /// Swaps in a freshly-reloaded record at the same insertion position.
    pub async fn replace_loaded_module(&self, id: &str, manifest: Manifest) -> Res<()> {
        let mut loaded = self.loaded.lock().await;
        let entry = loaded
            .get_mut(id)
            .ok_or_else(|| Error::from(ErrorKind::ConfigInvalid(format!("unknown module {}", id))))?;
        entry.manifest = manifest;
        Ok(())
    }

    /// Queues a change notification for the hot-reload debouncer; safe to call from any context,
    /// including a synchronous file-watcher callback.
    pub fn notify_change(&self, module_id: String) {
        let _ = self.change_tx.send(module_id);
    }

    /// Drains the change-notification channel, waiting for `quiet` with no new notifications
    /// before reloading the distinct set of ids collected since the last drain. Runs until the
    /// channel closes.
    pub async fn run_reload_debouncer(&self, quiet: Duration) {
        let mut rx = match self.change_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            let first = match rx.recv().await {
                Some(id) => id,
                None => return,
            };
            let mut pending = std::collections::BTreeSet::new();
            pending.insert(first);

            loop {
                match tokio::time::timeout(quiet, rx.recv()).await {
                    Ok(Some(id)) => {
                        pending.insert(id);
                    }
                    Ok(None) => break,
                    Err(_elapsed) => break,
                }
            }

            for id in pending {
                if let Err(e) = self.reload(&id).await {
                    slog::error!(self.log, "hot reload failed"; "module" => &id, "error" => %e);
                }
            }
        }
    }

    /// `unrequireModuleFiles(id) → manifest.reload() → construct(stored-config) → start`.
    pub async fn reload(&self, id: &str) -> Res<()> {
        let folder = {
            let loaded = self.loaded.lock().await;
            loaded
                .get(id)
                .ok_or_else(|| Error::from(ErrorKind::ConfigInvalid(format!("unknown module {}", id))))?
                .manifest
                .folder
                .clone()
        };
        if let Some(invalidator) = &self.invalidator {
            invalidator.unrequire(id, &folder);
        }

        let mut manifest = {
            let loaded = self.loaded.lock().await;
            loaded.get(id).unwrap().manifest.clone()
        };
        manifest.reload()?;

        {
            let mut loaded = self.loaded.lock().await;
            let entry = loaded.get_mut(id).unwrap();
            entry.manifest = manifest;
            entry.state = LifecycleState::Loaded;
        }
        self.refresh_associations().await;

        self.construct_one(id).await?;
        self.start_one(id).await?;
        Ok(())
    }

    /// Resolves an import request the way C8 describes, using the current module set and
    /// association map as of the call.
    pub async fn resolve(&self, request: &str, parent_filename: Option<&Path>) -> Res<Option<std::path::PathBuf>> {
        let loaded = self.loaded.lock().await;
        let associations = self.associations.lock().await;

        let views: Vec<ModuleView> =
            loaded.values().map(|e| ModuleView { id: &e.id, manifest: &e.manifest }).collect();

        resolver::resolve(request, parent_filename, &views, |owner, key| {
            associations.get(owner).and_then(|m| m.get(key)).and_then(|p| p.as_deref())
        })
        .map_err(|detail| {
            // `detail` is already a complete sentence naming the offending module and interface
            // (resolver::resolve's error strings), so it is carried verbatim rather than
            // re-packed into ImportNotPermitted's two-field shape.
            Error::from(ErrorKind::Other(detail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExpandedModuleConfig, ImportOverride};
    use crate::source::ModuleSource;
    use crate::test_support::test_logger;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manifest_with(dir: &Path, name: &str, imports: &[&str], exports: &[&str]) -> Manifest {
        std::fs::create_dir_all(dir).unwrap();
        let exports_json: Vec<String> = exports.iter().map(|e| format!("\"{}\"", e)).collect();
        let imports_json: Vec<String> = imports.iter().map(|e| format!("\"{}\"", e)).collect();
        std::fs::write(
            dir.join("package.json"),
            format!(
                r#"{{"name":"{}","version":"1.0.0","antelopeJs":{{"imports":[{}],"exports":[{}]}}}}"#,
                name,
                imports_json.join(","),
                exports_json.join(",")
            ),
        )
        .unwrap();
        for export in exports {
            let (iface, ver) = export.split_once('@').unwrap();
            std::fs::create_dir_all(dir.join("interfaces").join(iface).join(ver)).unwrap();
        }
        let mut m = Manifest::from_folder(
            dir,
            ModuleSource::Local {
                path: dir.to_path_buf(),
                main: None,
                watch_dir: None,
                install_command: None,
                id: None,
            },
        )
        .unwrap();
        m.load_exports().unwrap();
        m
    }

    fn empty_config() -> ExpandedModuleConfig {
        ExpandedModuleConfig {
            source: ModuleSource::Local {
                path: std::path::PathBuf::from("."),
                main: None,
                watch_dir: None,
                install_command: None,
                id: None,
            },
            config: serde_json::json!({}),
            import_overrides: Vec::new(),
            disabled_exports: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn refresh_associations_links_unique_provider() {
        let dir = tempfile::tempdir().unwrap();
        let a = manifest_with(&dir.path().join("a"), "a", &["iface@1"], &[]);
        let b = manifest_with(&dir.path().join("b"), "b", &[], &["iface@1"]);

        let manager = ModuleManager::new(test_logger(), None);
        manager
            .add_modules(vec![
                ("a".to_string(), a, empty_config(), Arc::new(NoopLifecycle)),
                ("b".to_string(), b, empty_config(), Arc::new(NoopLifecycle)),
            ])
            .await
            .unwrap();

        assert!(manager.unresolved_imports().await.is_empty());
        manager.ensure_graph_is_valid().await.unwrap();
    }

    #[tokio::test]
    async fn missing_provider_is_reported_and_aborts_validation() {
        let dir = tempfile::tempdir().unwrap();
        let a = manifest_with(&dir.path().join("a"), "a", &["iface@1"], &[]);

        let manager = ModuleManager::new(test_logger(), None);
        manager
            .add_modules(vec![("a".to_string(), a, empty_config(), Arc::new(NoopLifecycle))])
            .await
            .unwrap();

        let missing = manager.unresolved_imports().await;
        assert_eq!(missing, vec![("a".to_string(), "iface@1".to_string())]);
        assert!(manager.ensure_graph_is_valid().await.is_err());
    }

    #[tokio::test]
    async fn import_override_wins_over_unique_exporter() {
        let dir = tempfile::tempdir().unwrap();
        let a = manifest_with(&dir.path().join("a"), "a", &["iface@1"], &[]);
        let b = manifest_with(&dir.path().join("b"), "b", &[], &["iface@1"]);
        let c = manifest_with(&dir.path().join("c"), "c", &[], &["iface@1"]);

        let mut config_a = empty_config();
        config_a.import_overrides =
            vec![ImportOverride { interface: "iface@1".to_string(), source: "c".to_string(), id: None }];

        let manager = ModuleManager::new(test_logger(), None);
        manager
            .add_modules(vec![
                ("a".to_string(), a, config_a, Arc::new(NoopLifecycle)),
                ("b".to_string(), b, empty_config(), Arc::new(NoopLifecycle)),
                ("c".to_string(), c, empty_config(), Arc::new(NoopLifecycle)),
            ])
            .await
            .unwrap();

        assert!(manager.unresolved_imports().await.is_empty());
    }

    struct RecordingLifecycle {
        id: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ModuleLifecycle for RecordingLifecycle {
        async fn construct(&self, _config: &Value) -> Res<()> {
            self.order.lock().await.push(self.id);
            Ok(())
        }
        async fn destroy(&self) -> Res<()> {
            self.order.lock().await.push(self.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn destroy_all_reverses_construction_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = manifest_with(&dir.path().join("a"), "a", &[], &[]);
        let b = manifest_with(&dir.path().join("b"), "b", &[], &[]);

        let order = Arc::new(Mutex::new(Vec::new()));
        let manager = ModuleManager::new(test_logger(), None);
        manager
            .add_modules(vec![
                (
                    "a".to_string(),
                    a,
                    empty_config(),
                    Arc::new(RecordingLifecycle { id: "a", order: order.clone() }),
                ),
                (
                    "b".to_string(),
                    b,
                    empty_config(),
                    Arc::new(RecordingLifecycle { id: "b", order: order.clone() }),
                ),
            ])
            .await
            .unwrap();

        manager.construct_all().await.unwrap();
        manager.destroy_all().await.unwrap();

        assert_eq!(*order.lock().await, vec!["a", "b", "b", "a"]);
    }

    #[tokio::test]
    async fn duplicate_module_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a1 = manifest_with(&dir.path().join("a1"), "a", &[], &[]);
        let a2 = manifest_with(&dir.path().join("a2"), "a", &[], &[]);

        let manager = ModuleManager::new(test_logger(), None);
        manager
            .add_modules(vec![("a".to_string(), a1, empty_config(), Arc::new(NoopLifecycle))])
            .await
            .unwrap();
        let err = manager
            .add_modules(vec![("a".to_string(), a2, empty_config(), Arc::new(NoopLifecycle))])
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn hot_reload_debounces_bursty_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let a = manifest_with(&dir.path().join("a"), "a", &[], &[]);

        let calls = Arc::new(AtomicUsize::new(0));
        struct CountingLifecycle(Arc<AtomicUsize>);
        #[async_trait]
        impl ModuleLifecycle for CountingLifecycle {
            async fn construct(&self, _c: &Value) -> Res<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let manager = Arc::new(ModuleManager::new(test_logger(), None));
        manager
            .add_modules(vec![(
                "a".to_string(),
                a,
                empty_config(),
                Arc::new(CountingLifecycle(calls.clone())),
            )])
            .await
            .unwrap();

        let manager2 = manager.clone();
        let debounce = tokio::spawn(async move {
            manager2.run_reload_debouncer(Duration::from_millis(30)).await;
        });

        manager.notify_change("a".to_string());
        manager.notify_change("a".to_string());
        tokio::time::delay_for(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        debounce.abort();
    }
}
