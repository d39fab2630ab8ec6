use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::{dev, init};

/// Conch - local development orchestrator for commerce apps
#[derive(Parser)]
#[command(name = "conch")]
#[command(version)]
#[command(about = "Conch - run all your app's dev processes behind one local URL")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start every configured dev process behind the local proxy
    Dev {
        /// Port the local proxy listens on (OS-assigned when omitted)
        #[arg(long)]
        port: Option<u16>,

        /// Public tunnel URL that terminates at the local proxy
        #[arg(long)]
        tunnel_url: Option<String>,

        /// Hide the timestamp column in process output
        #[arg(long)]
        no_timestamps: bool,

        /// Project directory (defaults to the current directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Write a starter conch.toml into the current directory
    Init {
        /// Overwrite an existing conch.toml
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        match self.command {
            Commands::Dev {
                port,
                tunnel_url,
                no_timestamps,
                path,
            } => dev::run(port, tunnel_url, no_timestamps, path),
            Commands::Init { force } => init::run(force),
        }
    }
}
