//! CLI entry point: argument/config parsing, logging bootstrap, embedded Tor
//! bootstrap, and the per-module scan loop.
//!
//! Grounded on `examples/original_source/src/exitmap.py`'s `main()`, the
//! per-module loop that selects exits, drives one scan, and continues to the
//! next module on a `ExitSelectionError` rather than aborting the whole
//! invocation, and on the teacher's `main.rs` logging bootstrap (`tracing`
//! + `tracing-appender` non-blocking file layer alongside stdout,
//! `EnvFilter` driven by the configured verbosity).

mod attacher;
mod config;
mod country;
mod descriptors;
mod driver;
mod engine;
mod error;
mod exit_policy;
mod ipc;
mod modules;
mod relay_selector;
mod socks_client;
mod stats;
mod task;
mod tor_control;
mod tor_process;
mod worker;

use chrono::Local;
use clap::Parser;
use config::{Cli, ResolvedConfig};
use error::SelectionError;
use relay_selector::{CountryLookup, ExitKind, SelectionFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.task_worker {
        // One circuit per worker process, so a single current-thread runtime
        // is all a task invocation ever needs.
        let rt = tokio::runtime::Runtime::new()?;
        return rt.block_on(worker::run());
    }

    let file_defaults = config::load_file_defaults(cli.config_file.as_deref());
    let resolved = ResolvedConfig::merge(cli, file_defaults);
    let _log_guard = init_logging(&resolved);

    let rt = tokio::runtime::Runtime::new()?;
    let exit_code = rt.block_on(run_scan(resolved));
    std::process::exit(exit_code);
}

/// Installs a stdout layer plus, if `-o/--logfile` was given, a non-blocking
/// file layer next to it, matching the teacher's two-layer registry, minus
/// the GUI-only monthly directory rotation this tool has no use for (a
/// scanner's `-o` names one file, not a directory tree). Returns the
/// `tracing_appender` worker guard, which must stay alive for the process's
/// whole lifetime to guarantee buffered lines are flushed.
fn init_logging(config: &ResolvedConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&config.verbosity).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_ansi(false).with_target(false);

    match &config.logfile {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path.file_name().unwrap_or(std::ffi::OsStr::new("torscan.log"));
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("could not create log directory {}: {err}", dir.display());
            }
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_ansi(false).with_target(false).with_writer(non_blocking);
            tracing_subscriber::registry().with(filter).with(stdout_layer).with(file_layer).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            None
        }
    }
}

/// Runs every requested module in turn and returns the process exit code:
/// 0 if every module ran (regardless of how many individual exits failed
/// mid-scan, that's what `Statistics` is for), non-zero if Tor itself
/// couldn't be launched, the first hop was invalid, the cached directory
/// documents were unreadable, or every module's exit selection came up
/// empty (spec.md §6, §8 scenario 6).
async fn run_scan(config: ResolvedConfig) -> i32 {
    if config.modules.is_empty() {
        tracing::error!("no modules given; pass one or more task names");
        return 1;
    }

    let tor = match tor_process::bootstrap(&config.tor_dir).await {
        Ok(tor) => tor,
        Err(err) => {
            tracing::error!("could not launch embedded Tor: {err}");
            return 1;
        }
    };

    let docs = match relay_selector::load_cached_documents(&config.tor_dir) {
        Ok(docs) => docs,
        Err(err) => {
            tracing::error!("could not load cached consensus/descriptors: {err}");
            return 1;
        }
    };

    if let Some(fpr) = &config.first_hop {
        if let Err(err) = relay_selector::relay_in_consensus(&docs.consensus, fpr) {
            tracing::error!("{err}");
            return 1;
        }
    }

    let requested_fingerprints = match config.requested_fingerprints() {
        Ok(set) => set,
        Err(err) => {
            tracing::error!("{err}");
            return 1;
        }
    };

    let binary_path = match std::env::current_exe() {
        Ok(path) => path,
        Err(err) => {
            tracing::error!("could not determine own executable path: {err}");
            return 1;
        }
    };

    let consensus_fprs: Vec<String> = docs.consensus.keys().cloned().collect();
    let country_lookup = country::OnionooCountryLookup::new();
    let run_started = Local::now();
    let mut exit_code = 0;
    let mut stats = stats::Statistics::new();

    for module_name in &config.modules {
        let Some(task) = task::lookup(module_name) else {
            tracing::error!("unknown module {module_name:?}; available: {:?}", task::registered_names());
            exit_code = 1;
            continue;
        };
        let task: Arc<dyn task::Task> = Arc::from(task);

        if let Err(err) = task.setup().await {
            tracing::error!("module {module_name:?}: setup failed: {err}");
            exit_code = 1;
            continue;
        }

        let filter = SelectionFilter {
            kind: ExitKind { good: config.good_exits, bad: config.bad_exits },
            country_code: config.country.clone(),
            version: None,
            nickname: None,
            address: None,
            requested_fingerprints: requested_fingerprints.clone(),
            destinations: task.destinations(),
        };
        let lookup_ref: Option<&dyn CountryLookup> =
            if filter.country_code.is_some() { Some(&country_lookup) } else { None };

        let exits = match relay_selector::select_exits(&docs.consensus, &docs.descriptors, &filter, lookup_ref) {
            Ok(exits) => exits,
            Err(err) => {
                tracing::error!("module {module_name:?}: exit selection failed: {err}");
                exit_code = 1;
                continue;
            }
        };
        if exits.is_empty() {
            tracing::error!("module {module_name:?}: {}", SelectionError::Empty { count: 0 });
            exit_code = 1;
            continue;
        }
        let total_circuits = exits.len() as u64;

        let analysis_dir = config.analysis_dir.as_ref().map(|base| {
            base.join(format!("{}_{module_name}", run_started.format("%Y%m%d-%H%M%S")))
        });
        if let Some(dir) = &analysis_dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                tracing::warn!("could not create analysis directory {}: {err}", dir.display());
            }
        }

        let (engine, handle) = match engine::Engine::new(
            tor.controller.clone(),
            Arc::clone(&task),
            stats,
            total_circuits,
            tor.socks_addr,
            ipc_socket_path(module_name),
            analysis_dir,
            binary_path.clone(),
        ) {
            Ok(pair) => pair,
            Err((err, returned_stats)) => {
                tracing::error!("module {module_name:?}: could not start scan engine: {err}");
                exit_code = 1;
                stats = returned_stats;
                continue;
            }
        };

        let driver_config = driver::DriverConfig {
            build_delay: Duration::from_secs_f64(config.build_delay_secs.max(0.0)),
            delay_noise: Duration::from_secs_f64(config.delay_noise_secs.max(0.0)),
            first_hop: config.first_hop.clone(),
        };
        let driver_handle = tokio::spawn({
            let controller = tor.controller.clone();
            let handle = handle.clone();
            let consensus_fprs = consensus_fprs.clone();
            async move {
                driver::run(&controller, &handle, exits, &consensus_fprs, &driver_config).await;
            }
        });

        stats = engine.run().await;
        let _ = driver_handle.await;
        tracing::info!("module {module_name:?} finished:\n{stats}");
    }

    exit_code
}

/// A per-module Unix socket path for the engine's IPC listener; distinct per
/// module (and process) so two invocations never collide.
fn ipc_socket_path(module_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("torscan-ipc-{}-{module_name}.sock", std::process::id()))
}
