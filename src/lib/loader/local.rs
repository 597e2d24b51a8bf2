//! The `local` loader: a single module living at a fixed path on disk.

use std::path::Path;

use async_trait::async_trait;

use crate::cache::Cache;
use crate::err::Res;
use crate::manifest::Manifest;
use crate::process::ProcessBuilder;
use crate::source::ModuleSource;

use super::Loader;

pub struct LocalLoader;

#[async_trait]
impl Loader for LocalLoader {
    fn identifier_field(&self) -> &'static str {
        "path"
    }

    async fn load(
        &self,
        _cache: &Cache,
        _project_folder: &Path,
        source: &ModuleSource,
    ) -> Res<Vec<Manifest>> {
        let (path, install_command) = match source {
            ModuleSource::Local { path, install_command, .. } => (path, install_command),
            _ => unreachable!("local loader dispatched a non-local source"),
        };

        if !path.exists() {
            return Err(crate::err::ErrorKind::AcquisitionFailed {
                name: path.display().to_string(),
                detail: "local module path does not exist".to_string(),
            }
            .into());
        }

        if let Some(install_command) = install_command {
            for command in install_command.commands() {
                ProcessBuilder::from_shell_line(command)
                    .cwd(path)
                    .exec(&path.display().to_string())
                    .await?;
            }
        }

        let mut manifest = Manifest::from_folder(path, source.clone())?;
        manifest.load_exports()?;
        Ok(vec![manifest])
    }
}
