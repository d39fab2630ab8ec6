use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};

/// Root configuration from conch.toml
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ConchToml {
    /// Application name
    pub name: Option<String>,

    /// [dev] section - local development processes
    #[serde(default)]
    pub dev: DevSection,
}

/// [dev] section
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DevSection {
    /// Fixed port for the local proxy (OS-assigned when omitted)
    pub port: Option<u16>,

    /// Public tunnel URL that terminates at the local proxy
    pub tunnel_url: Option<String>,

    /// [[dev.proxy]] - processes served through the local proxy
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyProcessConfig>,

    /// [[dev.process]] - processes that manage their own ports
    #[serde(default, rename = "process")]
    pub processes: Vec<DirectProcessConfig>,
}

/// One [[dev.proxy]] entry
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ProxyProcessConfig {
    /// Label shown in multiplexed output
    pub name: String,

    /// URL path prefix routed to this process; omitted = catch-all
    pub prefix: Option<String>,

    /// Tunnel WebSocket upgrades to this process (live reload)
    #[serde(default)]
    pub websocket: bool,

    /// Command to run, as argv (e.g. ["npm", "run", "dev"])
    pub command: Vec<String>,

    /// Working directory, relative to the project root
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One [[dev.process]] entry
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DirectProcessConfig {
    pub name: String,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ConchToml {
    /// Load conch.toml from a directory
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join("conch.toml");
        if !path.exists() {
            return Err(ConfigError::Validation(format!(
                "Missing conch.toml at {}. Run 'conch init' first.",
                path.display()
            )));
        }
        Self::load_from_file(&path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(path.as_ref().to_path_buf(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: ConchToml = toml::from_str(content)?;
        Ok(config)
    }

    /// Check the dev section before anything starts: every process needs a
    /// name and a command, and route prefixes must form a valid table.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = Vec::new();
        let mut fallbacks = 0usize;

        for proxy in &self.dev.proxies {
            validate_process_entry("[[dev.proxy]]", &proxy.name, &proxy.command, &mut names)?;
            match proxy.prefix.as_deref() {
                None => {
                    fallbacks += 1;
                    if fallbacks > 1 {
                        return Err(ConfigError::Validation(format!(
                            "[[dev.proxy]] '{}' has no prefix, but another entry is already the default route",
                            proxy.name
                        )));
                    }
                }
                Some(prefix) if !prefix.starts_with('/') => {
                    return Err(ConfigError::Validation(format!(
                        "[[dev.proxy]] '{}': prefix '{}' must start with '/'",
                        proxy.name, prefix
                    )));
                }
                Some(_) => {}
            }
        }

        for process in &self.dev.processes {
            validate_process_entry("[[dev.process]]", &process.name, &process.command, &mut names)?;
        }

        Ok(())
    }
}

fn validate_process_entry<'a>(
    section: &str,
    name: &'a str,
    command: &[String],
    names: &mut Vec<&'a str>,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{section} entries need a non-empty name"
        )));
    }
    if command.is_empty() {
        return Err(ConfigError::Validation(format!(
            "{section} '{name}' needs a non-empty command"
        )));
    }
    if names.contains(&name) {
        return Err(ConfigError::Validation(format!(
            "duplicate dev process name '{name}'"
        )));
    }
    names.push(name);
    Ok(())
}
