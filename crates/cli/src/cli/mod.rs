pub mod config;
pub mod status;
pub mod tools;

use std::path::Path;

use clap::{Parser, Subcommand};

use th_domain::config::Config;

/// toolhost: supervise MCP tool-provider subprocesses.
#[derive(Debug, Parser)]
#[command(name = "toolhost", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start every enabled server and run until interrupted (default).
    Serve,
    /// Start the servers and print the combined tool catalog.
    Tools {
        /// Print the catalog as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Invoke one tool on one server and print its result.
    Call {
        /// Server id from the config.
        server: String,
        /// Tool name as reported by `tools`.
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
        /// Print the raw result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Start the servers and report each one's state.
    Status {
        #[arg(long)]
        json: bool,
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

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path in `TOOLHOST_CONFIG` (or
/// `toolhost.toml` by default). Returns the parsed [`Config`] and the
/// path that was used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path =
        std::env::var("TOOLHOST_CONFIG").unwrap_or_else(|_| "toolhost.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

/// A missing file yields the default configuration.
pub fn load_config_from(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    Config::from_toml_file(path.as_ref()).map_err(|e| anyhow::anyhow!("{e}"))
}
