//! Dev process targets and the runner that drives them.
//!
//! A target is a log prefix plus an action: an async unit of work that
//! receives output sinks and the shared abort signal, runs until it
//! completes naturally or the signal fires, and reports failure by
//! returning an error. [`proxy_command_action`] and
//! [`direct_command_action`] adapt an external command into such an action.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tokio::process::Command;

use crate::error::{ActionError, DevError};
use crate::output::OutputSink;
use crate::signal::AbortSignal;

pub type ActionFuture = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send>>;

/// Action for a proxied process; receives the locally assigned upstream port.
pub type ProxyAction =
    Box<dyn FnOnce(OutputSink, OutputSink, AbortSignal, u16) -> ActionFuture + Send>;

/// Action for a process that does not need the proxy.
pub type DirectAction = Box<dyn FnOnce(OutputSink, OutputSink, AbortSignal) -> ActionFuture + Send>;

/// A process reachable through the shared reverse proxy.
pub struct ProxyTarget {
    /// Label shown in multiplexed output.
    pub log_prefix: String,
    /// URL path prefix routed to this process; `None` is the catch-all.
    pub path_prefix: Option<String>,
    /// Whether WebSocket upgrades are tunneled to this process.
    pub websocket: bool,
    pub action: ProxyAction,
}

/// A process that binds its own ports (or none at all).
pub struct DirectTarget {
    pub log_prefix: String,
    pub action: DirectAction,
}

/// External command resolved by the config layer: argv plus working
/// directory and environment.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// Build a proxied-process action from a command. The assigned port is
/// exported to the child as `PORT`.
pub fn proxy_command_action(spec: CommandSpec) -> ProxyAction {
    Box::new(move |stdout, stderr, signal, port| {
        Box::pin(run_command(spec, stdout, stderr, signal, Some(port)))
    })
}

/// Build a direct-process action from a command.
pub fn direct_command_action(spec: CommandSpec) -> DirectAction {
    Box::new(move |stdout, stderr, signal| {
        Box::pin(run_command(spec, stdout, stderr, signal, None))
    })
}

async fn run_command(
    spec: CommandSpec,
    stdout: OutputSink,
    stderr: OutputSink,
    signal: AbortSignal,
    port: Option<u16>,
) -> Result<(), ActionError> {
    let Some(program) = spec.argv.first() else {
        return Err("empty command".into());
    };

    let mut cmd = Command::new(program);
    cmd.args(&spec.argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(port) = port {
        cmd.env("PORT", port.to_string());
    }

    let mut child = cmd.spawn().map_err(|e| {
        ActionError::from(format!("failed to spawn '{}': {}", program, e))
    })?;

    let out_pipe = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_lines(out, stdout)));
    let err_pipe = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_lines(err, stderr)));

    let exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = signal.aborted() => None,
    };
    let result = match exit {
        Some(status) => match status {
            // An exit while shutdown is in progress is the stop we asked
            // for, whatever the status says.
            Ok(status) if status.success() || signal.is_aborted() => Ok(()),
            Ok(status) => Err(ActionError::from(format!(
                "'{}' exited with {}",
                program, status
            ))),
            Err(err) => Err(ActionError::from(err)),
        },
        None => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Ok(())
        }
    };

    // Let trailing output land before reporting, so the log shows what the
    // process said on its way out.
    if let Some(pipe) = out_pipe {
        let _ = pipe.await;
    }
    if let Some(pipe) = err_pipe {
        let _ = pipe.await;
    }

    result
}

async fn forward_lines<R>(reader: R, sink: OutputSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.write_line(&line);
    }
}

/// Drives a single target action to completion, tagging failures with the
/// target's log prefix.
pub struct ProcessRunner {
    log_prefix: String,
}

impl ProcessRunner {
    pub fn new(log_prefix: impl Into<String>) -> Self {
        Self {
            log_prefix: log_prefix.into(),
        }
    }

    pub async fn run(self, action: ActionFuture) -> Result<(), DevError> {
        tracing::debug!(process = %self.log_prefix, "starting dev process");
        match action.await {
            Ok(()) => {
                tracing::debug!(process = %self.log_prefix, "dev process finished");
                Ok(())
            }
            Err(source) => Err(DevError::TargetFailed {
                prefix: self.log_prefix,
                source,
            }),
        }
    }
}
