//! The `package` loader: a registry-distributed tarball identified by name and version.
//!
//! Grounded on `elba`'s own `retrieve::cache::Cache::checkout_tar`, which extracts a downloaded
//! tarball into a scratch directory with `tar`/`flate2` before transferring it into the cache —
//! the same two crates, used the same way, just fed from `npm pack` instead of a registry HTTP
//! download (that HTTP path isn't reusable here since npm packages are versioned and distributed
//! through `npm`'s own tooling, not a bare tarball URL).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use semver::{Version, VersionReq};

use crate::cache::Cache;
use crate::err::{Error, ErrorKind, Res};
use crate::manifest::Manifest;
use crate::process::ProcessBuilder;
use crate::source::ModuleSource;

use super::Loader;

/// Run after extracting a fresh package into the cache. There's no per-source override for this
/// (unlike `local`/`git`'s `installCommand`) — it's the fixed convention of the package registry
/// the loader targets.
const DEFAULT_INSTALL_COMMAND: &str = "npm install --omit=dev --no-audit --no-fund";

pub struct PackageLoader;

#[async_trait]
impl Loader for PackageLoader {
    fn identifier_field(&self) -> &'static str {
        "package"
    }

    async fn load(
        &self,
        cache: &Cache,
        _project_folder: &Path,
        source: &ModuleSource,
    ) -> Res<Vec<Manifest>> {
        let (package, version, ignore_cache) = match source {
            ModuleSource::Package { package, version, ignore_cache, .. } => {
                (package, version, *ignore_cache)
            }
            _ => unreachable!("package loader dispatched a non-package source"),
        };

        let cached_version = cache.get_version(package).await;
        let hit = !ignore_cache
            && cached_version
                .as_deref()
                .and_then(|v| satisfies(version, v))
                .unwrap_or(false);

        let folder = if hit {
            cache.get_folder(package, true, false)?
        } else {
            fetch_and_transfer(cache, package, version).await?
        };

        let mut manifest = Manifest::from_folder(&folder, source.clone())?;
        manifest.load_exports()?;
        Ok(vec![manifest])
    }
}

fn satisfies(requested: &str, cached: &str) -> Option<bool> {
    let req = VersionReq::parse(requested).ok()?;
    let ver = Version::parse(cached).ok()?;
    Some(req.matches(&ver))
}

async fn fetch_and_transfer(cache: &Cache, package: &str, version: &str) -> Res<PathBuf> {
    let temp = cache.get_temp()?;

    ProcessBuilder::new("npm")
        .arg("pack")
        .arg(format!("{}@{}", package, version))
        .cwd(&temp)
        .exec(package)
        .await?;

    let tarball = std::fs::read_dir(&temp)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().map_or(false, |ext| ext == "tgz"))
        .ok_or_else(|| {
            Error::from(ErrorKind::AcquisitionFailed {
                name: package.to_string(),
                detail: "npm pack did not produce a .tgz file".to_string(),
            })
        })?;

    extract_tarball(&tarball, &temp)?;
    let extracted = temp.join("package");

    let package_json = extracted.join("package.json");
    let raw = std::fs::read_to_string(&package_json).map_err(|_| {
        Error::from(ErrorKind::AcquisitionFailed {
            name: package.to_string(),
            detail: "extracted package has no package.json".to_string(),
        })
    })?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let real_version = parsed
        .get("version")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(version)
        .to_string();

    let folder = cache.transfer(&extracted, package, &real_version).await?;

    ProcessBuilder::from_shell_line(DEFAULT_INSTALL_COMMAND)
        .cwd(&folder)
        .exec(package)
        .await?;

    Ok(folder)
}

fn extract_tarball(tarball: &Path, dest: &Path) -> Res<()> {
    let file = std::fs::File::open(tarball)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_requirement_matches_cached_version() {
        assert_eq!(satisfies("^1.0.0", "1.2.0"), Some(true));
        assert_eq!(satisfies("^2.0.0", "1.2.0"), Some(false));
        assert_eq!(satisfies("not-a-range", "1.2.0"), None);
    }
}
