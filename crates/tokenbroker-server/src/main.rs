use std::env;

use anyhow::Context;
use tokenbroker_server::ServerBuilder;
use tokenbroker_server::config::loader::load_config;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From TOKENBROKER_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (tokenbroker.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (TOKENBROKER_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    tokenbroker_server::observability::init_tracing();

    if let Err(e) = run().await {
        tracing::error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let (config_path, source) = resolve_config_path();

    let cfg = load_config(Some(&config_path))
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    tracing::info!(
        path = %config_path,
        source = %source,
        issuer = %cfg.auth.identity_provider.issuer,
        "Configuration loaded"
    );

    tokenbroker_server::observability::apply_logging_level(&cfg.logging.level);

    let server = ServerBuilder::new()
        .with_config(cfg)
        .build()
        .context("Server initialization failed")?;

    server.run().await.context("Server error")
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: TOKENBROKER_CONFIG
/// 3. Default: tokenbroker.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return (path, ConfigSource::CliArgument);
        }
    }

    if let Ok(path) = env::var("TOKENBROKER_CONFIG")
        && !path.is_empty()
    {
        return (path, ConfigSource::EnvironmentVariable);
    }

    ("tokenbroker.toml".to_string(), ConfigSource::Default)
}
