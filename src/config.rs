//! Command-line arguments merged with an optional TOML config file.
//!
//! Grounded on `examples/original_source/src/exitmap.py::parse_cmd_args`: a
//! config file supplies defaults, and explicit CLI flags win over them. The
//! original uses Python's `ConfigParser` (INI) with a `[Defaults]` section;
//! this crate uses `toml`/`serde` instead, the teacher's own format
//! (`IronCloakConfig::load`'s load-or-default pattern); see DESIGN.md.

use crate::error::SelectionError;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Raw command-line arguments, one field per flag in spec.md §6. Every
/// overridable flag is `Option` so we can tell "not given on the command
/// line" apart from "given, using its built-in default" when merging against
/// a config file.
#[derive(Parser, Debug)]
#[command(name = "torscan", about = "Run a probing task from every current Tor exit relay", version)]
pub struct Cli {
    /// Internal: re-exec this binary as a task-worker subprocess. Arguments
    /// arrive as a JSON blob on stdin (see worker.rs), not as argv, so
    /// fingerprints and descriptors never show up in the process list.
    #[arg(long, hide = true)]
    pub task_worker: bool,

    /// One or more task names to run, in order (available: see `task::registered_names`).
    pub module: Vec<String>,

    #[arg(short = 'C', long, conflicts_with_all = ["exit", "exit_file"])]
    pub country: Option<String>,

    #[arg(short = 'e', long, conflicts_with_all = ["country", "exit_file"])]
    pub exit: Option<String>,

    #[arg(short = 'E', long, conflicts_with_all = ["country", "exit"])]
    pub exit_file: Option<PathBuf>,

    #[arg(short = 'b', long, conflicts_with = "all_exits")]
    pub bad_exits: bool,

    #[arg(short = 'l', long, conflicts_with = "bad_exits")]
    pub all_exits: bool,

    #[arg(short = 'd', long)]
    pub build_delay: Option<f64>,

    #[arg(short = 'n', long)]
    pub delay_noise: Option<f64>,

    #[arg(short = 'i', long)]
    pub first_hop: Option<String>,

    #[arg(short = 't', long)]
    pub tor_dir: Option<PathBuf>,

    #[arg(short = 'a', long)]
    pub analysis_dir: Option<PathBuf>,

    #[arg(short = 'v', long)]
    pub verbosity: Option<String>,

    #[arg(short = 'o', long)]
    pub logfile: Option<PathBuf>,

    #[arg(short = 'f', long)]
    pub config_file: Option<PathBuf>,
}

/// `[defaults]` table of a TOML config file; every field mirrors a CLI flag
/// and is consulted only when that flag wasn't given explicitly.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileDefaults {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub exit: Option<String>,
    #[serde(default)]
    pub exit_file: Option<PathBuf>,
    #[serde(default)]
    pub build_delay: Option<f64>,
    #[serde(default)]
    pub delay_noise: Option<f64>,
    #[serde(default)]
    pub first_hop: Option<String>,
    #[serde(default)]
    pub tor_dir: Option<PathBuf>,
    #[serde(default)]
    pub analysis_dir: Option<PathBuf>,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    defaults: FileDefaults,
}

/// Read a TOML config file's `[defaults]` table, or an empty one if `path`
/// is `None` or doesn't exist; mirrors `exitmap.py`'s behaviour of silently
/// falling back to an empty default set when `~/.exitmaprc` is absent.
pub fn load_file_defaults(path: Option<&Path>) -> FileDefaults {
    let Some(path) = path else { return FileDefaults::default() };
    if !path.exists() {
        tracing::warn!("config file {} not found, using built-in defaults", path.display());
        return FileDefaults::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => match toml::from_str::<ConfigFile>(&text) {
            Ok(parsed) => parsed.defaults,
            Err(err) => {
                tracing::warn!("could not parse config file {}: {err}", path.display());
                FileDefaults::default()
            }
        },
        Err(err) => {
            tracing::warn!("could not read config file {}: {err}", path.display());
            FileDefaults::default()
        }
    }
}

fn default_tor_dir() -> PathBuf {
    std::env::temp_dir().join(format!("torscan-datadir-{}", std::process::id()))
}

/// Fully resolved configuration for one `torscan` invocation: CLI flags,
/// falling back to the config file's `[defaults]`, falling back to the
/// built-in default.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub modules: Vec<String>,
    pub country: Option<String>,
    pub exit: Option<String>,
    pub exit_file: Option<PathBuf>,
    pub good_exits: bool,
    pub bad_exits: bool,
    pub build_delay_secs: f64,
    pub delay_noise_secs: f64,
    pub first_hop: Option<String>,
    pub tor_dir: PathBuf,
    pub analysis_dir: Option<PathBuf>,
    pub verbosity: String,
    pub logfile: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn merge(cli: Cli, file: FileDefaults) -> Self {
        let all_exits = cli.all_exits;
        let bad_exits = cli.bad_exits;
        Self {
            modules: cli.module,
            country: cli.country.or(file.country),
            exit: cli.exit.or(file.exit),
            exit_file: cli.exit_file.or(file.exit_file),
            // Default policy per spec.md §6: good exits only, unless -b or -l.
            good_exits: all_exits || !bad_exits,
            bad_exits: all_exits || bad_exits,
            build_delay_secs: cli.build_delay.or(file.build_delay).unwrap_or(3.0),
            delay_noise_secs: cli.delay_noise.or(file.delay_noise).unwrap_or(0.0),
            first_hop: cli.first_hop.or(file.first_hop),
            tor_dir: cli.tor_dir.or(file.tor_dir).unwrap_or_else(default_tor_dir),
            analysis_dir: cli.analysis_dir.or(file.analysis_dir),
            verbosity: cli.verbosity.or(file.verbosity).unwrap_or_else(|| "info".to_string()),
            logfile: cli.logfile.or(file.logfile),
        }
    }

    /// The fingerprint allowlist requested via `-e`/`-E`, if any.
    pub fn requested_fingerprints(&self) -> Result<Option<std::collections::HashSet<String>>, SelectionError> {
        if let Some(fpr) = &self.exit {
            return Ok(Some(std::collections::HashSet::from([fpr.to_uppercase()])));
        }
        if let Some(path) = &self.exit_file {
            let text = std::fs::read_to_string(path).map_err(|source| SelectionError::Unreadable {
                path: path.display().to_string(),
                source,
            })?;
            let set = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| l.to_uppercase())
                .collect();
            return Ok(Some(set));
        }
        Ok(None)
    }
}
