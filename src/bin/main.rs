//! C12 — the binary front-end. Thin by design: resolve, acquire, wire up the manager, dispatch to
//! the shutdown coordinator. No spinners, colored progress bars or interactive prompts; output is
//! line-oriented `slog-term` logging.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{App, AppSettings, Arg, SubCommand};
use slog::{o, Logger};

use antelope_runtime::build;
use antelope_runtime::cache::Cache;
use antelope_runtime::config::{ExpandedModuleConfig, ResolvedConfig};
use antelope_runtime::err::{Error, ErrorKind, Res};
use antelope_runtime::loader;
use antelope_runtime::manager::{ModuleLifecycle, ModuleManager, NoopLifecycle, DEFAULT_DEBOUNCE};
use antelope_runtime::manifest::Manifest;
use antelope_runtime::shutdown::{watch_for_signals, Shutdown, ShutdownHook, DEFAULT_TIMEOUT};

fn cli() -> App<'static, 'static> {
    let env_arg = Arg::with_name("env")
        .long("env")
        .takes_value(true)
        .default_value("default")
        .help("Configuration environment to resolve");

    App::new("antelope")
        .about("Modular application runtime")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::with_name("verbose").short("v").long("verbose").global(true).help("Enable debug logging"))
        .subcommand(
            SubCommand::with_name("build").about("Resolve, acquire and write the build artifact").arg(&env_arg),
        )
        .subcommand(
            SubCommand::with_name("launch")
                .about("Resolve, acquire, construct and start every module")
                .arg(&env_arg)
                .arg(Arg::with_name("watch").long("watch").help("Poll module folders and hot-reload on change")),
        )
        .subcommand(SubCommand::with_name("launch-from-build").about("Launch from a previously written build artifact"))
}

fn build_logger(verbose: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let level = if verbose { slog::Level::Debug } else { slog::Level::Info };
    let drain = slog::LevelFilter::new(drain, level).fuse();
    Logger::root(drain, o!())
}

/// Acquires every configured module concurrently, expanding a `local-folder` source's several discovered manifests into
/// one entry apiece, keyed by the child manifest's own name.
async fn acquire_all(
    resolved: &ResolvedConfig,
    cache: &Arc<Cache>,
    registry: &loader::Registry,
    project_folder: &Path,
) -> Res<BTreeMap<String, (Manifest, ExpandedModuleConfig)>> {
    let tasks = resolved.modules.iter().map(|(id, module_config)| {
        let id = id.clone();
        let module_config = module_config.clone();
        let source = module_config.source.clone();
        let cache = cache.clone();
        async move {
            let manifests = registry.load(project_folder, cache, source).await?;
            Ok::<_, Error>((id, module_config, manifests))
        }
    });
    let results = futures::future::try_join_all(tasks).await?;

    let mut out = BTreeMap::new();
    for (id, module_config, manifests) in results {
        if manifests.len() == 1 {
            out.insert(id, (manifests.into_iter().next().unwrap(), module_config));
        } else {
            for manifest in manifests {
                out.insert(manifest.name.clone(), (manifest, module_config.clone()));
            }
        }
    }
    Ok(out)
}

async fn install_modules(
    manager: &ModuleManager,
    acquired: &BTreeMap<String, (Manifest, ExpandedModuleConfig)>,
) -> Res<()> {
    let entries = acquired
        .iter()
        .map(|(id, (manifest, config))| {
            let callbacks: Arc<dyn ModuleLifecycle> = Arc::new(NoopLifecycle);
            (id.clone(), manifest.clone(), config.clone(), callbacks)
        })
        .collect();
    manager.add_modules(entries).await
}

async fn resolve_and_acquire(
    project_folder: &Path,
    env: &str,
    log: &Logger,
) -> Res<(ResolvedConfig, String, BTreeMap<String, (Manifest, ExpandedModuleConfig)>, ModuleManager)> {
    let (resolved, hash) = build::compute_config_hash(project_folder, env)?;

    let cache = Arc::new(Cache::new(resolved.cache_folder.clone(), log.new(o!("component" => "cache"))));
    cache.load().await?;

    let registry = loader::Registry::with_default_loaders().await;
    let acquired = acquire_all(&resolved, &cache, &registry, project_folder).await?;

    let manager = ModuleManager::new(log.new(o!("component" => "manager")), None);
    install_modules(&manager, &acquired).await?;
    manager.ensure_graph_is_valid().await?;

    Ok((resolved, hash, acquired, manager))
}

fn unix_timestamp() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    secs.to_string()
}

async fn cmd_build(project_folder: &Path, env: &str, log: &Logger) -> Res<()> {
    let (resolved, hash, acquired, _manager) = resolve_and_acquire(project_folder, env, log).await?;
    let manifests: BTreeMap<String, Manifest> =
        acquired.into_iter().map(|(id, (manifest, _))| (id, manifest)).collect();

    build::write_build_artifact(project_folder, env, &resolved, &hash, &manifests, &unix_timestamp(), log)?;
    Ok(())
}

struct StopOnShutdown {
    manager: Arc<ModuleManager>,
}

#[async_trait::async_trait]
impl ShutdownHook for StopOnShutdown {
    async fn run(&self) -> Res<()> {
        self.manager.stop_all().await?;
        self.manager.destroy_all().await
    }
}

async fn cmd_launch(
    project_folder: &Path,
    env: &str,
    watch: bool,
    log: &Logger,
    shutdown: &Arc<Shutdown>,
) -> Res<()> {
    let (_resolved, _hash, _acquired, manager) = resolve_and_acquire(project_folder, env, log).await?;
    let manager = Arc::new(manager);

    manager.construct_all().await?;
    manager.start_all().await?;
    slog::info!(log, "launch complete"; "modules" => manager.list_modules().await.len());

    shutdown.register(0, Arc::new(StopOnShutdown { manager: manager.clone() }) as Arc<dyn ShutdownHook>).await;

    if watch {
        let debouncer = manager.clone();
        tokio::spawn(async move { debouncer.run_reload_debouncer(DEFAULT_DEBOUNCE).await });
        let poller = manager.clone();
        tokio::spawn(poll_for_changes(poller));
    }

    Ok(())
}

/// A minimal stdlib-`mtime`-polling loop. Checks every loaded module's folder once per interval and queues a reload on change.
async fn poll_for_changes(manager: Arc<ModuleManager>) {
    let mut last_seen: BTreeMap<String, std::time::SystemTime> = BTreeMap::new();
    loop {
        tokio::time::delay_for(std::time::Duration::from_secs(1)).await;
        for id in manager.list_modules().await {
            let folder = match manager.module_folder(&id).await {
                Some(folder) => folder,
                None => continue,
            };
            if let Some(mtime) = newest_mtime(&folder) {
                let changed = last_seen.get(&id).map(|prev| *prev != mtime).unwrap_or(false);
                last_seen.insert(id.clone(), mtime);
                if changed {
                    manager.notify_change(id);
                }
            }
        }
    }
}

fn newest_mtime(folder: &Path) -> Option<std::time::SystemTime> {
    walkdir::WalkDir::new(folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .max()
}

async fn cmd_launch_from_build(project_folder: &Path, log: &Logger, shutdown: &Arc<Shutdown>) -> Res<()> {
    let artifact = build::read_build_artifact(project_folder)?;
    build::warn_if_build_is_stale(project_folder, &artifact, log);
    build::ensure_build_modules_exist(&artifact)?;

    let manager = ModuleManager::new(log.new(o!("component" => "manager")), None);
    let entries = artifact
        .modules
        .iter()
        .map(|(id, built)| {
            let callbacks: Arc<dyn ModuleLifecycle> = Arc::new(NoopLifecycle);
            let config = ExpandedModuleConfig {
                source: built.manifest.source.clone(),
                config: built.config.clone(),
                import_overrides: built.import_overrides.clone(),
                disabled_exports: built.disabled_exports.clone(),
            };
            (id.clone(), built.manifest.clone(), config, callbacks)
        })
        .collect();
    manager.add_modules(entries).await?;
    manager.ensure_graph_is_valid().await?;

    let manager = Arc::new(manager);
    manager.construct_all().await?;
    manager.start_all().await?;
    slog::info!(log, "launched from build artifact"; "modules" => manager.list_modules().await.len());

    shutdown.register(0, Arc::new(StopOnShutdown { manager }) as Arc<dyn ShutdownHook>).await;
    Ok(())
}

async fn run() -> i32 {
    let matches = cli().get_matches();
    let log = build_logger(matches.is_present("verbose"));
    let project_folder: PathBuf = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            slog::error!(log, "could not read current directory"; "error" => %e);
            return 1;
        }
    };

    let shutdown = Shutdown::new(log.new(o!("component" => "shutdown")), DEFAULT_TIMEOUT);

    let outcome: Res<()> = match matches.subcommand() {
        ("build", Some(args)) => {
            let env = args.value_of("env").unwrap_or("default");
            cmd_build(&project_folder, env, &log).await
        }
        ("launch", Some(args)) => {
            let env = args.value_of("env").unwrap_or("default");
            let watch = args.is_present("watch");
            cmd_launch(&project_folder, env, watch, &log, &shutdown).await
        }
        ("launch-from-build", Some(_)) => cmd_launch_from_build(&project_folder, &log, &shutdown).await,
        _ => Err(Error::from(ErrorKind::Other("no subcommand given".to_string()))),
    };

    if let Err(e) = outcome {
        slog::error!(log, "fatal"; "error" => %e);
        return 1;
    }

    match matches.subcommand_name() {
        Some("launch") | Some("launch-from-build") => watch_for_signals(shutdown).await,
        _ => 0,
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
