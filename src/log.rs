//! Structured logging for debugging provisor.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a session from completing
//! - WARN: Failed attempts, abandoned commands, cancellations
//! - INFO: Session start and finish, task completion, re-runs
//! - DEBUG: Transitions, dispatches, scheduling decisions
//! - TRACE: Very detailed traces
//!
//! Output goes to `~/.provisor/provisor.log`, truncated at startup.
//! Debug mode can be enabled with `--debug` flag or `PROVISOR_DEBUG=1` env
//! var; `PROVISOR_LOG` takes a full filter directive and overrides both.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

/// Env var enabling debug mode.
pub const DEBUG_ENV: &str = "PROVISOR_DEBUG";

/// Env var holding an explicit filter directive.
pub const FILTER_ENV: &str = "PROVISOR_LOG";

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.provisor/provisor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the home directory is unavailable. Calling it
/// twice is harmless: the first subscriber stays installed.
pub fn init_with_debug(debug: bool) {
    let env_debug = parse_debug_flag(std::env::var(DEBUG_ENV).ok().as_deref());
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    match open_log_file() {
        Some((path, file)) => {
            LOG_PATH.set(path).ok();
            tracing_subscriber::fmt()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_env_filter(filter)
                .try_init()
                .ok();
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .try_init()
                .ok();
        }
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging to a file.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let dir = dirs::home_dir()?.join(".provisor");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("provisor.log");
    // Truncate file on startup
    let file = File::create(&path).ok()?;
    Some((path, file))
}

fn parse_debug_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "provisor=debug"
    } else {
        "provisor=info"
    }
}
