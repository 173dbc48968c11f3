//! Kernel host binary.
//!
//! Resolves the configuration file, sets up logging, claims the
//! single-instance lock, wires termination signals, then builds and runs
//! the kernel until a stop is requested.

mod instance;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hearth_kernel::engine::runtime;
use hearth_kernel::modules::StateModule;
use hearth_kernel::{Config, Kernel};

use crate::instance::InstanceLock;

/// Hearth kernel daemon -- a local-only companion micro-kernel.
#[derive(Parser)]
#[command(
    name = "hearthd",
    version,
    about = "Hearth kernel daemon -- local-only companion micro-kernel"
)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,
}

/// Keep only the arguments `hearthd` understands; unknown flags and stray
/// positionals are ignored rather than treated as errors.
fn known_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    let mut args = args.into_iter();
    let mut kept: Vec<String> = Vec::new();
    kept.extend(args.next()); // program name

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                kept.push(arg);
                if let Some(value) = args.next() {
                    kept.push(value);
                }
            }
            "-h" | "--help" | "-V" | "--version" => kept.push(arg),
            _ if arg.starts_with("--config=") => kept.push(arg),
            _ => {}
        }
    }
    kept
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: nix::libc::c_int) {
    // Async-signal-safe: just flip the flag; the main loop does the rest.
    SHUTDOWN.store(true, Ordering::Release);
}

fn install_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("failed to install SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("failed to install SIGTERM handler")?;
    }
    Ok(())
}

/// Resolve a resource path against the working directory first, then the
/// executable's directory.
fn resolve_resource_path(path: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }
    if path.is_relative() {
        if let Some(exe_dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
            let candidate = exe_dir.join(path);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    path.to_path_buf()
}

fn level_from_config(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Initialize tracing from the `logging` section.  Returns the appender
/// guard, which must live for the whole process.
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let logging = config.section("logging");

    let level = logging
        .and_then(|s| s.get_str("level"))
        .map(level_from_config)
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_to_file = logging.map(|s| s.get_bool_or("log_to_file", true)).unwrap_or(true);
    if !log_to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        return None;
    }

    let log_file = logging
        .and_then(|s| s.get_str("log_file"))
        .unwrap_or("logs/hearthd.log");
    let log_path = Path::new(log_file);
    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = log_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("hearthd.log"));

    let _ = std::fs::create_dir_all(log_dir);
    let appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();
    Some(guard)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_from(known_args(std::env::args()));

    let config_path = resolve_resource_path(&cli.config);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let _log_guard = init_logging(&config);
    tracing::info!(config = %config_path.display(), "hearthd starting");

    let _instance = InstanceLock::acquire(std::env::temp_dir().join("hearthd.pid"))?;
    install_signal_handlers()?;

    // No model backend is linked into this build; the engine comes up
    // not-ready unless a runtime is wired in here.
    let kernel = Kernel::initialize(config, runtime::disabled())?;

    kernel.register_module(Arc::new(StateModule::new(kernel.api())))?;
    kernel.load_modules().context("module loading failed")?;
    kernel.enable_modules().context("module enable failed")?;

    kernel.start()?;
    tracing::info!("hearthd running; send SIGINT or SIGTERM to stop");

    while kernel.is_running() && !SHUTDOWN.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    kernel.stop();
    tracing::info!("hearthd exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn unknown_flags_are_ignored() {
        let kept = known_args(argv(&[
            "hearthd",
            "--verbose",
            "-x",
            "--config",
            "custom.yaml",
            "leftover",
        ]));
        assert_eq!(kept, argv(&["hearthd", "--config", "custom.yaml"]));
    }

    #[test]
    fn recognized_flags_survive_filtering() {
        let kept = known_args(argv(&["hearthd", "-c", "a.yaml"]));
        assert_eq!(kept, argv(&["hearthd", "-c", "a.yaml"]));

        let kept = known_args(argv(&["hearthd", "--config=b.yaml", "--mystery"]));
        assert_eq!(kept, argv(&["hearthd", "--config=b.yaml"]));

        let kept = known_args(argv(&["hearthd", "--help"]));
        assert_eq!(kept, argv(&["hearthd", "--help"]));
    }

    #[test]
    fn filtered_args_parse_with_defaults() {
        let cli = Cli::parse_from(known_args(argv(&["hearthd", "--bogus-flag"])));
        assert_eq!(cli.config, PathBuf::from("config/config.yaml"));

        let cli = Cli::parse_from(known_args(argv(&[
            "hearthd",
            "--bogus-flag",
            "-c",
            "elsewhere.yaml",
        ])));
        assert_eq!(cli.config, PathBuf::from("elsewhere.yaml"));
    }

    #[test]
    fn config_levels_map_to_filters() {
        assert_eq!(level_from_config("TRACE"), "trace");
        assert_eq!(level_from_config("debug"), "debug");
        assert_eq!(level_from_config("WARNING"), "warn");
        assert_eq!(level_from_config("warn"), "warn");
        assert_eq!(level_from_config("ERROR"), "error");
        assert_eq!(level_from_config("INFO"), "info");
        assert_eq!(level_from_config("bogus"), "info");
    }

    #[test]
    fn resource_path_prefers_existing_relative() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.yaml");
        std::fs::write(&file, "logging:\n  level: INFO\n").unwrap();

        // Absolute existing path resolves to itself.
        assert_eq!(resolve_resource_path(&file), file);

        // A path that exists nowhere comes back unchanged.
        let ghost = Path::new("no/such/config.yaml");
        assert_eq!(resolve_resource_path(ghost), ghost.to_path_buf());
    }
}
