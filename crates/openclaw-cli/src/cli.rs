//! Clap CLI definitions for the storage diagnostics surface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OpenClaw storage control.
#[derive(Parser)]
#[command(
    name = "openclaw",
    version,
    about = "OpenClaw storage layer diagnostics",
    long_about = "Inspect and migrate the OpenClaw storage layer.\n\n\
                  Namespaces (sessions, transcripts, auth, config) route to a \
                  local or cloud backend depending on the configured mode; \
                  `storage status` shows the resolved routing and `storage \
                  migrate --dry-run` enumerates what a migration would move."
)]
pub struct Cli {
    /// Path to the storage config file (default: ~/.openclaw/storage.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Storage layer diagnostics (status, migrate) [*].
    #[command(subcommand)]
    Storage(StorageCommands),
}

#[derive(Subcommand)]
pub enum StorageCommands {
    /// Show service mode and per-namespace backend routing.
    Status {
        /// Output as JSON for scripting.
        #[arg(long)]
        json: bool,
        /// Probe each namespace's backend and include the result.
        #[arg(long)]
        health: bool,
    },
    /// Migrate data between backends (v1: dry-run enumeration only).
    Migrate {
        /// Target backend.
        #[arg(long, value_enum)]
        to: MigrateTarget,
        /// Restrict to one namespace (default: all).
        #[arg(long)]
        namespace: Option<String>,
        /// Enumerate what would move without making changes.
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum MigrateTarget {
    File,
    Agentcore,
    SecretsManager,
}

impl MigrateTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrateTarget::File => "file",
            MigrateTarget::Agentcore => "agentcore",
            MigrateTarget::SecretsManager => "secrets-manager",
        }
    }
}
