//! The `local-folder` loader: every immediate subdirectory of a path becomes its own `local`
//! module, inheriting the parent's `installCommand`/`watchDir`.

use std::path::Path;

use async_trait::async_trait;

use crate::cache::Cache;
use crate::err::Res;
use crate::manifest::Manifest;
use crate::source::ModuleSource;
use crate::util;

use super::local::LocalLoader;
use super::Loader;

pub struct LocalFolderLoader;

#[async_trait]
impl Loader for LocalFolderLoader {
    fn identifier_field(&self) -> &'static str {
        "path"
    }

    async fn load(
        &self,
        cache: &Cache,
        project_folder: &Path,
        source: &ModuleSource,
    ) -> Res<Vec<Manifest>> {
        let (path, watch_dir, install_command, id) = match source {
            ModuleSource::LocalFolder { path, watch_dir, install_command, id } => {
                (path, watch_dir, install_command, id)
            }
            _ => unreachable!("local-folder loader dispatched a non-local-folder source"),
        };

        let mut manifests = Vec::new();
        for child in util::immediate_subdirs(path)? {
            let child_name = child.file_name().unwrap().to_string_lossy().into_owned();
            let child_id = match id {
                Some(parent_id) => format!("{}-{}", parent_id, child_name),
                None => child_name,
            };

            let child_source = ModuleSource::Local {
                path: child.clone(),
                main: None,
                watch_dir: watch_dir.clone(),
                install_command: install_command.clone(),
                id: Some(child_id),
            };

            let mut child_manifests = LocalLoader.load(cache, project_folder, &child_source).await?;
            manifests.append(&mut child_manifests);
        }

        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_manifest_per_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            let child = dir.path().join(name);
            std::fs::create_dir_all(&child).unwrap();
            std::fs::write(
                child.join("package.json"),
                format!(r#"{{"name":"{}","version":"1.0.0"}}"#, name),
            )
            .unwrap();
        }
        // A stray file alongside the module directories must not be treated as a module.
        std::fs::write(dir.path().join("readme.txt"), "hi").unwrap();

        let source = ModuleSource::LocalFolder {
            path: dir.path().to_path_buf(),
            watch_dir: None,
            install_command: None,
            id: Some("parent".to_string()),
        };
        let cache = crate::cache::Cache::new(dir.path().join(".cache"), crate::test_support::test_logger());
        let manifests = LocalFolderLoader.load(&cache, dir.path(), &source).await.unwrap();

        let mut names: Vec<_> = manifests.iter().map(|m| m.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
