//! Structured logging plumbing.
//!
//! The library logs through `slog`. Embedders that want output install a
//! root logger once via [`init`]; without one, logging is a no-op.

use std::sync::OnceLock;

use slog::{o, Discard, Logger};

static ROOT: OnceLock<Logger> = OnceLock::new();

/// Install the process-wide root logger. May be called at most once;
/// later calls are ignored.
pub fn init(logger: Logger) {
    let _ = ROOT.set(logger);
}

/// Get a logger for the given module.
pub fn get_logger(module: &'static str) -> Logger {
    ROOT.get_or_init(|| Logger::root(Discard, o!()))
        .new(o!("module" => module))
}
