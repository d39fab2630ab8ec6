//! Top-level coordinator for a dev run.
//!
//! Allocates one loopback port per proxied process, starts the reverse
//! proxy, then runs every process concurrently with its output wired into
//! the shared multiplexer. The group lives and dies together: the first
//! failure (or an external abort) fires the shared signal, every sibling
//! winds down, the proxy is stopped, and the first error is surfaced.
//! There is no per-process restart at this layer.

use tokio::task::JoinSet;

use crate::error::DevError;
use crate::output::ConcurrentOutput;
use crate::ports::allocate_distinct_ports;
use crate::process::{DirectTarget, ProcessRunner, ProxyTarget};
use crate::proxy::{ProxyRoute, ReverseProxy};
use crate::signal::AbortSignal;

/// Run every dev process until all complete, one fails, or the shared
/// signal fires. Resolves once everything has wound down and the proxy is
/// stopped; a stop caused by cancellation is not an error.
///
/// With zero proxy targets no proxy port is ever bound; only the direct
/// processes run.
pub async fn run_dev_supervisor(
    tunnel_url: &str,
    listen_port: Option<u16>,
    proxy_targets: Vec<ProxyTarget>,
    direct_targets: Vec<DirectTarget>,
    signal: AbortSignal,
    output: &ConcurrentOutput,
) -> Result<(), DevError> {
    validate_proxy_targets(&proxy_targets)?;

    let mut proxy = None;
    let mut ports = Vec::new();
    if !proxy_targets.is_empty() {
        ports = allocate_distinct_ports(proxy_targets.len())?;
        let routes = proxy_targets
            .iter()
            .zip(&ports)
            .map(|(target, port)| ProxyRoute {
                path_prefix: target.path_prefix.clone(),
                upstream_port: *port,
                websocket: target.websocket,
            })
            .collect();

        let mut server = ReverseProxy::new(tunnel_url);
        server.configure(routes);
        server.start(listen_port, signal.clone()).await?;
        proxy = Some(server);
    }

    let mut tasks: JoinSet<Result<(), DevError>> = JoinSet::new();
    for (target, port) in proxy_targets.into_iter().zip(ports) {
        let stdout = output.sink(&target.log_prefix);
        let stderr = output.sink(&target.log_prefix);
        let runner = ProcessRunner::new(&target.log_prefix);
        let signal = signal.clone();
        tasks.spawn(async move { runner.run((target.action)(stdout, stderr, signal, port)).await });
    }
    for target in direct_targets {
        let stdout = output.sink(&target.log_prefix);
        let stderr = output.sink(&target.log_prefix);
        let runner = ProcessRunner::new(&target.log_prefix);
        let signal = signal.clone();
        tasks.spawn(async move { runner.run((target.action)(stdout, stderr, signal)).await });
    }

    let mut first_error: Option<DevError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|join_err| {
            Err(DevError::TargetFailed {
                prefix: "dev process".to_string(),
                source: Box::new(join_err),
            })
        });
        if let Err(err) = result {
            if first_error.is_none() {
                tracing::warn!(error = %err, "dev process failed, stopping the group");
                first_error = Some(err);
            }
            // Drain: every sibling observes the shared signal and winds
            // down on its own schedule.
            signal.abort();
        }
    }

    if let Some(mut server) = proxy {
        server.stop().await;
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// At most one catch-all, and prefixed routes must be pairwise distinct and
/// non-overlapping so every path has exactly one owner.
fn validate_proxy_targets(targets: &[ProxyTarget]) -> Result<(), DevError> {
    let mut fallbacks = 0usize;
    let mut prefixes: Vec<&str> = Vec::new();

    for target in targets {
        match target.path_prefix.as_deref() {
            None => {
                fallbacks += 1;
                if fallbacks > 1 {
                    return Err(DevError::InvalidTargets(format!(
                        "'{}' is a second process without a path prefix; only one default route is allowed",
                        target.log_prefix
                    )));
                }
            }
            Some(prefix) => {
                if !prefix.starts_with('/') {
                    return Err(DevError::InvalidTargets(format!(
                        "path prefix '{}' of '{}' must start with '/'",
                        prefix, target.log_prefix
                    )));
                }
                for existing in &prefixes {
                    if prefix.starts_with(existing) || existing.starts_with(prefix) {
                        return Err(DevError::InvalidTargets(format!(
                            "path prefixes '{}' and '{}' overlap",
                            existing, prefix
                        )));
                    }
                }
                prefixes.push(prefix);
            }
        }
    }

    Ok(())
}
