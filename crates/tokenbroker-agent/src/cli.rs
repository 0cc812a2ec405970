use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tokenbroker-agent")]
#[command(about = "Keeps a tokenbroker session signed in and refreshed")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Agent config file (defaults to ~/.tokenbroker/agent.toml)
    #[arg(long, global = true, env = "TOKENBROKER_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker base URL (overrides config)
    #[arg(long, global = true, env = "TOKENBROKER_URL")]
    pub broker_url: Option<String>,

    /// Identity provider authority (overrides config)
    #[arg(long, global = true, env = "TOKENBROKER_AUTHORITY")]
    pub authority: Option<String>,

    /// Identity provider client id (overrides config)
    #[arg(long, global = true, env = "TOKENBROKER_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Space-separated scopes (overrides config)
    #[arg(long, global = true, env = "TOKENBROKER_SCOPES")]
    pub scopes: Option<String>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store a new session
    Install,
    /// Print a valid access credential
    GetToken,
    /// Refresh the stored session now
    Refresh,
    /// Keep the session refreshed until interrupted
    RefreshLoop,
    /// Show the stored session
    Status,
    /// Remove the stored session
    Uninstall,
    /// Manage agent configuration
    Config(ConfigArgs),
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current config
    Show,
    /// Set config value
    Set(ConfigSetArgs),
}

#[derive(clap::Args)]
pub struct ConfigSetArgs {
    /// Key to set, e.g. broker_url or device_code.max_wait
    pub key: String,
    /// Value
    pub value: String,
}
