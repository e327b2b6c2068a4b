//! CLI entry point for dirwatch.
//!
//! This binary exposes the watch engine on the command line, mainly for
//! trying out watch behavior on a device or filesystem.
//!
//! # Usage
//!
//! ```bash
//! dirwatch [OPTIONS] <COMMAND>
//!
//! # Print changes under two directories until Ctrl-C
//! dirwatch watch /sdcard/DCIM /sdcard/Download
//!
//! # Same, as JSON lines, with a configuration file
//! dirwatch watch --json --config dirwatch.json /sdcard
//!
//! # Show whether paths can be watched and which node they resolve to
//! dirwatch check /proc /sdcard /storage/emulated/0
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use dirwatch::{PathFilter, WatchEvent, WatchService, channel_listener, identity_of};
use dirwatch_core::{Config, WatchPath};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Watch directories for changes to their immediate entries.
#[derive(Parser)]
#[command(name = "dirwatch", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Register each path and print events until interrupted.
    Watch {
        /// Directories to watch.
        #[arg(required = true)]
        paths: Vec<Utf8PathBuf>,

        /// JSON configuration file.
        #[arg(short, long, env = "DIRWATCH_CONFIG")]
        config: Option<Utf8PathBuf>,

        /// Print one JSON object per event.
        #[arg(long)]
        json: bool,
    },

    /// Print whether each path is watchable and its node identity.
    Check {
        /// Paths to inspect.
        #[arg(required = true)]
        paths: Vec<Utf8PathBuf>,

        /// JSON configuration file.
        #[arg(short, long, env = "DIRWATCH_CONFIG")]
        config: Option<Utf8PathBuf>,
    },
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default.
/// Logs go to stderr so event output on stdout stays clean.
fn init_tracing(verbose: bool, no_color: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},mio=warn,notify=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(use_ansi)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

/// Loads the configuration file, or the defaults when none is given.
fn load_config(path: Option<&Utf8Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("Failed to load configuration from {path}"))
        }
        None => Ok(Config::default()),
    }
}

/// Turns a command-line path into an absolute [`WatchPath`].
fn resolve_path(raw: &Utf8Path) -> Result<WatchPath> {
    let absolute = if raw.is_absolute() {
        raw.to_owned()
    } else {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Utf8PathBuf::try_from(cwd)
            .context("Current directory is not valid UTF-8")?
            .join(raw)
    };
    WatchPath::new(absolute.as_str()).with_context(|| format!("Invalid path: {raw}"))
}

// =============================================================================
// COMMAND IMPLEMENTATIONS
// =============================================================================

/// Watches `paths` and prints events until Ctrl-C or SIGTERM.
///
/// Paths that cannot be watched are reported and skipped; the command fails
/// only if none of them could be registered.
async fn run_watch(paths: &[Utf8PathBuf], config: &Config, json: bool) -> Result<()> {
    let service = WatchService::with_config(config.watch.clone())?;
    let (listener, mut events) = channel_listener();

    let mut registered = 0_usize;
    for raw in paths {
        let path = resolve_path(raw)?;
        match service.register(&path, &listener) {
            Ok(()) => {
                registered += 1;
                info!(%path, "Watching");
            }
            Err(err) => warn!(%path, error = %err, "Cannot watch path"),
        }
    }
    if registered == 0 {
        service.close()?;
        anyhow::bail!("None of the given paths could be watched");
    }
    info!(
        observers = service.observer_count(),
        "Waiting for changes (Ctrl-C to stop)"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, json)?;
            }
            result = &mut shutdown => {
                result?;
                info!("Shutting down");
                break;
            }
        }
    }

    service.close()?;
    Ok(())
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Prints whether each path is watchable and which node it resolves to.
fn run_check(paths: &[Utf8PathBuf], config: &Config) -> Result<()> {
    let filter = PathFilter::from_config(&config.watch)?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();

    for raw in paths {
        let path = resolve_path(raw)?;
        if !filter.is_watchable(&path) {
            writeln!(handle, "{path}\tignored")?;
            continue;
        }
        match identity_of(&path) {
            Ok(identity) => writeln!(handle, "{path}\twatchable\t{identity}")?,
            Err(err) => writeln!(handle, "{path}\tunwatchable\t{err}")?,
        }
    }
    Ok(())
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

fn print_event(event: &WatchEvent, json: bool) -> Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    if json {
        serde_json::to_writer(&mut handle, event)?;
        writeln!(handle)?;
    } else {
        writeln!(handle, "{event}")?;
    }
    Ok(())
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.no_color);

    match &cli.command {
        Commands::Watch {
            paths,
            config,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            run_watch(paths, &config, *json).await
        }
        Commands::Check { paths, config } => {
            let config = load_config(config.as_deref())?;
            run_check(paths, &config)
        }
    }
}
