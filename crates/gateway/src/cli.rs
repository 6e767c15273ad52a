//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use parley_domain::config::{Config, ConfigSeverity};
use parley_domain::Result;

/// parley — a multi-agent conversation orchestrator.
#[derive(Debug, Parser)]
#[command(name = "parley", version, about)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "parley.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Serve the MCP bridge on stdin/stdout for one conversation template.
    Mcp {
        /// Bridge configuration token (base64url JSON template).
        #[arg(long)]
        token: String,
    },
    /// Encode a bridge template JSON file into a configuration token.
    Token {
        /// Path to the template JSON (title, scenarioId, agents,
        /// startingAgentId).
        file: PathBuf,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

pub fn load_config(path: &std::path::Path) -> Result<Config> {
    Config::load(path)
}

/// Print validation issues; false when any is an error.
pub fn validate(config: &Config, path: &std::path::Path) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: ok", path.display());
        return true;
    }
    let mut ok = true;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("warning: {issue}"),
            ConfigSeverity::Error => {
                ok = false;
                println!("error: {issue}");
            }
        }
    }
    ok
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(raw) => println!("{raw}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}

/// Read a template JSON file and print its bridge token plus the
/// config hash a launcher would search for.
pub fn encode_token(file: &std::path::Path) -> Result<(String, String)> {
    let raw = std::fs::read_to_string(file)?;
    let template: crate::mcp::BridgeTemplate = serde_json::from_str(&raw)
        .map_err(|e| parley_domain::Error::Config(format!("{}: {e}", file.display())))?;
    template.validate()?;
    let token = template.encode()?;
    let hash = crate::mcp::config_hash(&token);
    Ok((token, hash))
}
