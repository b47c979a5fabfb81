//! Failure sink for the proxy handler

use std::fmt::Display;

use tracing::warn;

/// Receives failures the handler cannot report to the client: tunnel
/// errors, upgrade failures, dial and relay errors.
pub trait Logger: Send + Sync {
    fn log(&self, message: &dyn Display);
}

/// Forwards every message to `tracing` at warn level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &dyn Display) {
        warn!("{}", message);
    }
}
