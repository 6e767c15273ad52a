use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use parley_gateway::bootstrap;
use parley_gateway::cli::{self, Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing(false);
            let config = cli::load_config(&cli.config)?;
            bootstrap::run_server(Arc::new(config)).await
        }
        Some(Command::Mcp { token }) => {
            // stdout belongs to the MCP transport; logs go to stderr.
            init_tracing(true);
            let config = cli::load_config(&cli.config)?;
            bootstrap::run_mcp(Arc::new(config), &token).await
        }
        Some(Command::Token { file }) => {
            let (token, hash) = cli::encode_token(&file)?;
            println!("token: {token}");
            println!("bridgeConfig64Hash: {hash}");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = cli::load_config(&cli.config)?;
            if !cli::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli::load_config(&cli.config)?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing; `stderr` keeps stdout clean for MCP stdio.
fn init_tracing(stderr: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parley_gateway=debug"));
    if stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}
