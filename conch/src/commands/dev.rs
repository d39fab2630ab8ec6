//! `conch dev`
//!
//! Loads `conch.toml`, turns every configured process into a supervisor
//! target, and runs the group behind the local proxy until all processes
//! finish, one fails, or the user interrupts.

use std::collections::HashMap;
use std::env::current_dir;
use std::path::{Path, PathBuf};

use conch_dev::{
    AbortSignal, CommandSpec, ConcurrentOutput, DirectTarget, ProxyTarget,
    direct_command_action, proxy_command_action, run_dev_supervisor,
};

use crate::config::ConchToml;
use crate::output;

pub fn run(
    port: Option<u16>,
    tunnel_url: Option<String>,
    no_timestamps: bool,
    path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(port, tunnel_url, no_timestamps, path))
}

async fn run_async(
    port: Option<u16>,
    tunnel_url: Option<String>,
    no_timestamps: bool,
    path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let project_dir = match path {
        Some(path) => path,
        None => current_dir()?,
    };

    let cfg = ConchToml::load_from_dir(&project_dir)?;
    cfg.validate()?;

    let app_name = cfg.name.clone().unwrap_or_else(|| "app".to_string());
    if let (Some(cli_port), Some(cfg_port)) = (port, cfg.dev.port)
        && cli_port != cfg_port
    {
        output::warning(&format!(
            "Ignoring [dev].port {} from conch.toml in favor of --port {}",
            cfg_port, cli_port
        ));
    }
    let listen_port = port.or(cfg.dev.port);
    let tunnel_url = tunnel_url.or_else(|| cfg.dev.tunnel_url.clone());

    let proxy_targets: Vec<ProxyTarget> = cfg
        .dev
        .proxies
        .iter()
        .map(|proc| ProxyTarget {
            log_prefix: proc.name.clone(),
            path_prefix: proc.prefix.clone(),
            websocket: proc.websocket,
            action: proxy_command_action(command_spec(
                &proc.command,
                proc.cwd.as_deref(),
                &proc.env,
                &project_dir,
            )),
        })
        .collect();
    let direct_targets: Vec<DirectTarget> = cfg
        .dev
        .processes
        .iter()
        .map(|proc| DirectTarget {
            log_prefix: proc.name.clone(),
            action: direct_command_action(command_spec(
                &proc.command,
                proc.cwd.as_deref(),
                &proc.env,
                &project_dir,
            )),
        })
        .collect();

    if proxy_targets.is_empty() && direct_targets.is_empty() {
        return Err("conch.toml declares no dev processes; add [[dev.proxy]] or [[dev.process]] entries".into());
    }

    for line in dev_startup_lines(
        &app_name,
        proxy_targets.len(),
        direct_targets.len(),
        tunnel_url.as_deref(),
        listen_port,
    ) {
        output::step(&line);
    }
    if output::is_verbose() {
        for proc in &cfg.dev.proxies {
            let route = proc.prefix.as_deref().unwrap_or("/ (default)");
            output::muted(&format!("  {} -> {}", route, proc.name));
        }
        for proc in &cfg.dev.processes {
            output::muted(&format!("  direct: {}", proc.name));
        }
    }

    let signal = AbortSignal::new();
    watch_for_interrupts(&signal);

    // The proxy rewrites Host to the tunnel's hostname; without a tunnel the
    // public origin is just localhost.
    let host_url = tunnel_url.unwrap_or_else(|| "http://localhost".to_string());
    let dev_output = ConcurrentOutput::new(!no_timestamps);
    run_dev_supervisor(
        &host_url,
        listen_port,
        proxy_targets,
        direct_targets,
        signal.clone(),
        &dev_output,
    )
    .await?;

    if signal.is_aborted() {
        output::success("Dev processes stopped.");
    } else {
        output::success("All dev processes completed.");
    }
    Ok(())
}

/// Wire Ctrl-C (and SIGTERM on Unix) to the shared abort signal so every
/// process winds down together.
fn watch_for_interrupts(signal: &AbortSignal) {
    let ctrl_c_signal = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_signal.abort();
        }
    });

    #[cfg(unix)]
    {
        let term_signal = signal.clone();
        tokio::spawn(async move {
            let Ok(mut term) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            else {
                return;
            };
            if term.recv().await.is_some() {
                term_signal.abort();
            }
        });
    }
}

fn command_spec(
    argv: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    project_dir: &Path,
) -> CommandSpec {
    let cwd = match cwd {
        Some(dir) if dir.is_relative() => project_dir.join(dir),
        Some(dir) => dir.to_path_buf(),
        None => project_dir.to_path_buf(),
    };
    CommandSpec {
        argv: argv.to_vec(),
        cwd: Some(cwd),
        env: env.clone(),
    }
}

fn dev_startup_lines(
    app_name: &str,
    proxy_count: usize,
    direct_count: usize,
    tunnel_url: Option<&str>,
    listen_port: Option<u16>,
) -> Vec<String> {
    let mut lines = vec![format!(
        "Starting {} dev process(es) for {}",
        proxy_count + direct_count,
        app_name
    )];

    if proxy_count > 0 {
        match (tunnel_url, listen_port) {
            (Some(url), _) => lines.push(format!("Serving {}", url)),
            (None, Some(port)) => lines.push(format!("Serving http://localhost:{}", port)),
            (None, None) => {
                lines.push("Proxy port will be OS-assigned (pass --port to pin it)".to_string())
            }
        }
    }

    lines
}
