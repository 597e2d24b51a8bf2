//! The `git` loader: clones/updates a checkout into the cache by shelling out to `git`.
//!
//! Deliberately diverges from `elba`'s own `util::git`, which binds `git2` (and its vendored
//! OpenSSL) for this. Every acquisition step here is modeled as a process invocation reporting
//! `{stdout, stderr, code}`, which is exactly [`crate::process::ProcessBuilder`]'s shape — so the
//! git loader is built on that instead, trading `git2`'s richer API for a dependency on nothing
//! more than a `git` binary on `PATH`, the same assumption `installCommand` already makes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::cache::Cache;
use crate::err::Res;
use crate::manifest::Manifest;
use crate::process::ProcessBuilder;
use crate::source::ModuleSource;

use super::Loader;

pub struct GitLoader;

#[async_trait]
impl Loader for GitLoader {
    fn identifier_field(&self) -> &'static str {
        "remote"
    }

    async fn load(
        &self,
        cache: &Cache,
        _project_folder: &Path,
        source: &ModuleSource,
    ) -> Res<Vec<Manifest>> {
        let (remote, branch, commit, ignore_cache, install_command) = match source {
            ModuleSource::Git { remote, branch, commit, ignore_cache, install_command, .. } => {
                (remote, branch, commit, *ignore_cache, install_command)
            }
            _ => unreachable!("git loader dispatched a non-git source"),
        };

        let key = cache_key(remote);
        let cached = cache.get_version(&key).await;
        let first_time = ignore_cache || cached.as_deref().map_or(true, |v| !v.starts_with("git:"));

        let folder = cache.get_folder(&key, !first_time, true)?;

        let (resolved_branch, head, commit_changed) = if first_time {
            clone_fresh(remote, branch.as_deref(), commit.as_deref(), &folder).await?
        } else {
            update_existing(&folder, branch.as_deref(), commit.as_deref(), cached.as_deref()).await?
        };

        let new_version = format!("git:{}:{}", resolved_branch, head);
        if Some(new_version.as_str()) != cached.as_deref() {
            cache.set_version(&key, &new_version).await?;
        }

        if commit_changed {
            if let Some(install_command) = install_command {
                for command in install_command.commands() {
                    ProcessBuilder::from_shell_line(command).cwd(&folder).exec(remote).await?;
                }
            }
        }

        let mut manifest = Manifest::from_folder(&folder, source.clone())?;
        manifest.load_exports()?;
        Ok(vec![manifest])
    }
}

fn cache_key(remote: &str) -> String {
    let mut key: String = remote
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    key.truncate(80);
    format!("{}-{}", key, crate::util::hash::sha256_hex(remote.as_bytes())[..8].to_string())
}

async fn git(args: &[&str], cwd: &Path, context: &str) -> Res<String> {
    let mut builder = ProcessBuilder::new("git");
    builder.args(args).cwd(cwd);
    let out = builder.exec(context).await?;
    Ok(out.stdout.trim().to_string())
}

async fn clone_fresh(
    remote: &str,
    branch: Option<&str>,
    commit: Option<&str>,
    folder: &Path,
) -> Res<(String, String, bool)> {
    let mut clone_args = vec!["clone", remote, "."];
    if let Some(b) = branch {
        clone_args.push("--branch");
        clone_args.push(b);
    }
    git(&clone_args, folder, remote).await?;

    if let Some(c) = commit {
        git(&["checkout", c], folder, remote).await?;
    }

    let head = git(&["rev-parse", "HEAD"], folder, remote).await?;

    let resolved_branch = match branch {
        Some(b) => b.to_string(),
        None => {
            let symbolic = git(&["symbolic-ref", "refs/remotes/origin/HEAD"], folder, remote).await?;
            symbolic.rsplit('/').next().unwrap_or("main").to_string()
        }
    };

    Ok((resolved_branch, head, true))
}

async fn update_existing(
    folder: &Path,
    branch: Option<&str>,
    commit: Option<&str>,
    cached: Option<&str>,
) -> Res<(String, String, bool)> {
    let (cached_branch, cached_commit) = parse_cached(cached);

    git(&["fetch"], folder, "fetch").await?;

    let target_branch = branch.map(str::to_string).unwrap_or_else(|| cached_branch.clone());
    if target_branch != cached_branch {
        git(&["checkout", &target_branch], folder, "checkout").await?;
    }

    if let Some(c) = commit {
        git(&["checkout", c], folder, "checkout").await?;
    } else {
        let origin_head = git(
            &["rev-parse", &format!("origin/{}", target_branch)],
            folder,
            "rev-parse",
        )
        .await?;
        if origin_head != cached_commit {
            git(&["pull"], folder, "pull").await?;
        }
    }

    let head = git(&["rev-parse", "HEAD"], folder, "rev-parse").await?;
    let changed = head != cached_commit;
    Ok((target_branch, head, changed))
}

fn parse_cached(cached: Option<&str>) -> (String, String) {
    match cached.and_then(|v| v.strip_prefix("git:")) {
        Some(rest) => match rest.split_once(':') {
            Some((b, c)) => (b.to_string(), c.to_string()),
            None => (String::new(), String::new()),
        },
        None => (String::new(), String::new()),
    }
}
