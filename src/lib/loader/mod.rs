//! C4/C5 — pluggable source-type loaders and the registry that dispatches to them.
//!
//! Grounded on `elba`'s own `retrieve::mod::Retriever`, which holds a set of download backends
//! keyed by resolution kind and hands a `DirectRes` off to whichever one matches; the late-bound
//! "waiting queue" here has no direct analogue in `elba` itself — it's new machinery built in the
//! same idiom (an `async_trait` object, registered into a `HashMap`) to satisfy the requirement
//! that a loader for a source type can be registered after requests for it have already been
//! queued.

pub mod git;
pub mod local;
pub mod local_folder;
pub mod package;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::cache::Cache;
use crate::err::{Error, ErrorKind, Res};
use crate::manifest::Manifest;
use crate::source::ModuleSource;

/// A backend that knows how to turn one `ModuleSource` variant into manifests on disk.
#[async_trait]
pub trait Loader: Send + Sync {
    /// The `ModuleSource` field the registry treats as this loader's identifier; `"path"` gets
    /// rewritten against the project folder when relative.
    fn identifier_field(&self) -> &'static str;

    async fn load(
        &self,
        cache: &Cache,
        project_folder: &Path,
        source: &ModuleSource,
    ) -> Res<Vec<Manifest>>;
}

struct Registered {
    identifier_field: &'static str,
    loader: Arc<dyn Loader>,
}

struct WaitingRequest {
    cache: Arc<Cache>,
    project_folder: PathBuf,
    source: ModuleSource,
    reply: oneshot::Sender<Res<Vec<Manifest>>>,
}

/// Dispatch table from source `type` tag to loader, with late-registration support.
#[derive(Default)]
pub struct Registry {
    registered: Mutex<HashMap<String, Registered>>,
    waiting: Mutex<HashMap<String, Vec<WaitingRequest>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Builds a registry with the four built-in loaders already registered: the waiting-queue
    /// path is then only reachable by callers that build a bare [`Registry`] themselves.
    pub async fn with_default_loaders() -> Registry {
        let registry = Registry::new();
        registry.register("local", "path", Arc::new(local::LocalLoader)).await;
        registry
            .register("local-folder", "path", Arc::new(local_folder::LocalFolderLoader))
            .await;
        registry.register("package", "package", Arc::new(package::PackageLoader)).await;
        registry.register("git", "remote", Arc::new(git::GitLoader)).await;
        registry
    }

    /// Installs a loader for `source_type` and drains any requests that were queued before it
    /// arrived.
    pub async fn register(
        &self,
        source_type: &str,
        identifier_field: &'static str,
        loader: Arc<dyn Loader>,
    ) {
        {
            let mut registered = self.registered.lock().await;
            registered.insert(
                source_type.to_string(),
                Registered { identifier_field, loader: loader.clone() },
            );
        }

        let drained = {
            let mut waiting = self.waiting.lock().await;
            waiting.remove(source_type).unwrap_or_default()
        };
        for request in drained {
            let result = loader.load(&request.cache, &request.project_folder, &request.source).await;
            let _ = request.reply.send(result);
        }
    }

    /// Resolves `source` against whichever loader is registered for its type. If none is
    /// registered yet, the request is queued and the returned future resolves once one arrives.
    pub async fn load(
        &self,
        project_folder: &Path,
        cache: Arc<Cache>,
        source: ModuleSource,
    ) -> Res<Vec<Manifest>> {
        let found = {
            let registered = self.registered.lock().await;
            registered.get(source.type_tag()).map(|r| (r.identifier_field, r.loader.clone()))
        };

        if let Some((identifier_field, loader)) = found {
            let source = rewrite_relative_path(identifier_field, project_folder, source);
            return loader.load(&cache, project_folder, &source).await;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiting = self.waiting.lock().await;
            waiting.entry(source.type_tag().to_string()).or_default().push(WaitingRequest {
                cache,
                project_folder: project_folder.to_path_buf(),
                source,
                reply: tx,
            });
        }
        rx.await.map_err(|_| {
            Error::from(ErrorKind::Other("loader registry dropped a pending request".to_string()))
        })?
    }

    /// The value of the registered loader's declared identifier field on `source`, for callers
    /// that want to name a pending installation request the way the loader would.
    pub async fn get_loader_identifier(&self, source: &ModuleSource) -> Option<String> {
        let registered = self.registered.lock().await;
        registered.get(source.type_tag())?;
        Some(source.identifier_field_value())
    }
}

fn rewrite_relative_path(
    identifier_field: &str,
    project_folder: &Path,
    source: ModuleSource,
) -> ModuleSource {
    if identifier_field != "path" {
        return source;
    }
    match source {
        ModuleSource::Local { path, main, watch_dir, install_command, id } if path.is_relative() => {
            ModuleSource::Local {
                path: project_folder.join(path),
                main,
                watch_dir,
                install_command,
                id,
            }
        }
        ModuleSource::LocalFolder { path, watch_dir, install_command, id }
            if path.is_relative() =>
        {
            ModuleSource::LocalFolder {
                path: project_folder.join(path),
                watch_dir,
                install_command,
                id,
            }
        }
        other => other,
    }
}
