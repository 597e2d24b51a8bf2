//! The module source model — a tagged `ModuleSource` union.
//!
//! Grounded on `elba`'s own `package::resolution::DirectRes`: there, a package's origin is one
//! of a small closed set of variants (`Git`, `Dir`, `Tar`) dispatched on a `type` tag embedded in
//! a `+`-delimited string. Here the tag is a `serde` externally-tagged enum instead (the source
//! config comes from JSON, not a single scalar), but the principle — one loader per variant,
//! matched by tag, no open-ended dynamic fields — is the same.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One of the four ways a module can be shipped. Every variant may carry a disambiguating `id`
/// used to distinguish modules that would otherwise share a derived id (see `LocalFolder`'s
/// per-subdirectory naming below) in the module-id documentation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModuleSource {
    #[serde(rename = "local")]
    Local {
        path: PathBuf,
        #[serde(default)]
        main: Option<String>,
        #[serde(default)]
        watch_dir: Option<String>,
        #[serde(default)]
        install_command: Option<InstallCommand>,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "local-folder")]
    LocalFolder {
        path: PathBuf,
        #[serde(default)]
        watch_dir: Option<String>,
        #[serde(default)]
        install_command: Option<InstallCommand>,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "package")]
    Package {
        package: String,
        version: String,
        #[serde(default)]
        ignore_cache: bool,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename = "git")]
    Git {
        remote: String,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        commit: Option<String>,
        #[serde(default)]
        ignore_cache: bool,
        #[serde(default)]
        install_command: Option<InstallCommand>,
        #[serde(default)]
        id: Option<String>,
    },
}

impl ModuleSource {
    /// The loader-registry dispatch key.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ModuleSource::Local { .. } => "local",
            ModuleSource::LocalFolder { .. } => "local-folder",
            ModuleSource::Package { .. } => "package",
            ModuleSource::Git { .. } => "git",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ModuleSource::Local { id, .. } => id.as_deref(),
            ModuleSource::LocalFolder { id, .. } => id.as_deref(),
            ModuleSource::Package { id, .. } => id.as_deref(),
            ModuleSource::Git { id, .. } => id.as_deref(),
        }
    }

    /// The loader registry's `identifierField` convention: for path-shaped sources this
    /// is `"path"` (so a relative path gets rewritten against the project folder before
    /// dispatch); for the rest it's whatever value a caller would name a pending install
    /// request with.
    pub fn identifier_field_value(&self) -> String {
        match self {
            ModuleSource::Local { path, .. } | ModuleSource::LocalFolder { path, .. } => {
                path.display().to_string()
            }
            ModuleSource::Package { package, version, .. } => format!("{}@{}", package, version),
            ModuleSource::Git { remote, .. } => remote.clone(),
        }
    }
}

/// `installCommand` accepts either a single shell line or a list of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallCommand {
    Single(String),
    Many(Vec<String>),
}

impl InstallCommand {
    pub fn commands(&self) -> Vec<&str> {
        match self {
            InstallCommand::Single(s) => vec![s.as_str()],
            InstallCommand::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}
