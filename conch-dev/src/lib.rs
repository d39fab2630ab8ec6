//! Core of `conch dev`: concurrent process supervision plus a path-routing
//! local reverse proxy.
//!
//! A dev run is a group of processes. Proxied ones each get a fresh
//! loopback port and are reachable through one shared [`ReverseProxy`] by
//! path prefix; direct ones just run. Everything streams into one
//! [`ConcurrentOutput`] log, and one [`AbortSignal`] winds the whole group
//! down together. [`run_dev_supervisor`] ties it all up and is the only
//! entry point callers need.
//!
//! The pieces are plain values with no process-wide state, so they can be
//! driven in tests with fabricated actions instead of real commands.

mod error;
mod output;
mod ports;
mod process;
mod proxy;
mod signal;
mod supervisor;

pub use error::{ActionError, DevError};
pub use output::{ConcurrentOutput, OutputChunk, OutputSink};
pub use ports::{allocate_distinct_ports, random_port};
pub use process::{
    ActionFuture, CommandSpec, DirectAction, DirectTarget, ProcessRunner, ProxyAction,
    ProxyTarget, direct_command_action, proxy_command_action,
};
pub use proxy::{ProxyRoute, ReverseProxy};
pub use signal::AbortSignal;
pub use supervisor::run_dev_supervisor;
