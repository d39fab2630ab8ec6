//! `conch init`
//!
//! Writes a starter conch.toml into the current directory.

use std::env::current_dir;
use std::fs;
use std::path::Path;

use crate::output;

const CONCH_TOML_TEMPLATE: &str = r#"# Conch project configuration.
name = "my-app"

[dev]
# Pin the local proxy port; omitted = OS-assigned per run.
# port = 8081
# Public tunnel URL that terminates at the local proxy.
# tunnel_url = "https://my-app.example.dev"

# Processes served through the local proxy. At most one entry may omit
# `prefix`; it becomes the catch-all route.
[[dev.proxy]]
name = "web"
command = ["npm", "run", "dev"]

[[dev.proxy]]
name = "extensions"
prefix = "/extensions"
websocket = true
command = ["npm", "run", "dev:extensions"]
cwd = "extensions"

# Processes that manage their own ports.
# [[dev.process]]
# name = "theme"
# command = ["theme-server", "--live-reload"]
"#;

pub fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let project_dir = current_dir()?;
    write_template(&project_dir, force)?;
    output::success("Wrote conch.toml");
    output::muted("Edit the [[dev.proxy]] entries, then run `conch dev`.");
    Ok(())
}

fn write_template(project_dir: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = project_dir.join("conch.toml");
    if path.exists() && !force {
        return Err("conch.toml already exists. Use --force to overwrite.".into());
    }
    fs::write(&path, CONCH_TOML_TEMPLATE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConchToml;

    #[test]
    fn template_parses_and_validates() {
        let cfg = ConchToml::parse(CONCH_TOML_TEMPLATE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.name.as_deref(), Some("my-app"));
        assert_eq!(cfg.dev.proxies.len(), 2);
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), false).unwrap();
        assert!(write_template(dir.path(), false).is_err());
        write_template(dir.path(), true).unwrap();
    }
}
