//! Error taxonomy for the dev supervisor.
//!
//! Startup failures (ports, proxy bind) abort the run before any process
//! starts. A process failure cancels the whole group and is surfaced to the
//! caller. Upstream-unavailable conditions are handled per-request inside
//! the proxy and never show up here.

use thiserror::Error;

/// Errors produced by a target action itself.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DevError {
    #[error("Failed to allocate a local port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("Failed to bind dev proxy on 127.0.0.1:{port}: {source}")]
    ProxyBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid dev processes: {0}")]
    InvalidTargets(String),

    #[error("Process '{prefix}' failed: {source}")]
    TargetFailed {
        prefix: String,
        #[source]
        source: ActionError,
    },
}
