//! OpenClaw storage CLI entry point.

mod cli;
mod cmd;

use clap::Parser;
use cli::{Cli, Commands};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Storage(command) => cmd::storage::run(command, cli.config.as_deref()).await,
    };
    std::process::exit(exit_code);
}
