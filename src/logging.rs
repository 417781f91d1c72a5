//! Logging setup and level-gated helpers.
//!
//! The simulator logs through the `log` facade backed by `env_logger`;
//! `RUST_LOG` selects what the operator sees. The helpers below wrap the
//! facade for call sites that format a message unconditionally (drop
//! paths, reconnect loops), gating on the level first.

use log::{debug, error, info, log_enabled, warn, Level};

/// Initializes the logger with the `env_logger` crate.
pub fn init_logger() {
    env_logger::init();
}

/// Logs an error message (gateway reconnect failures).
pub fn log_error(message: &str) {
    if log_enabled!(Level::Error) {
        error!("{message}");
    }
}

/// Logs a warning message (scheduler tick drops).
pub fn log_warn(message: &str) {
    if log_enabled!(Level::Warn) {
        warn!("{message}");
    }
}

/// Logs an informational message.
pub fn log_info(message: &str) {
    if log_enabled!(Level::Info) {
        info!("{message}");
    }
}

/// Logs a debug message (uplink queue overflow).
pub fn log_debug(message: &str) {
    if log_enabled!(Level::Debug) {
        debug!("{message}");
    }
}
