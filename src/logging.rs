//! Structured logging setup (ambient stack, spec §2).
//!
//! Mirrors the teacher's reliance on `tracing` call sites by giving every
//! binary entry point a single place to install a subscriber. The engine itself
//! never initializes logging — only `rocker::cli`/`src/bin/rocker.rs` does,
//! so that library consumers can bring their own subscriber.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG`
/// (defaulting to `info`), optionally emitting structured JSON lines instead
/// of the human-readable format (the CLI's global `--json` flag, spec §6).
pub fn init(json: bool, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt().with_env_filter(filter).with_target(false);

    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
