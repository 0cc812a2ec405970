mod cli;
mod output;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokenbroker_agent::config::{self, AgentConfig, KNOWN_KEYS};
use tokenbroker_agent::{RefreshScheduler, SessionManager, SessionStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigCommands};
use output::{print_error, print_field, print_session, print_success};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

/// Logs go to stderr so `get-token` owns stdout.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let mut cfg = AgentConfig::load(&config_path)?;

    if let Commands::Config(args) = &cli.command {
        return match &args.command {
            ConfigCommands::Show => {
                print_field("Config", &config_path.display().to_string());
                print!("{}", toml::to_string_pretty(&cfg)?);
                Ok(())
            }
            ConfigCommands::Set(set) => {
                cfg.set(&set.key, &set.value).with_context(|| {
                    format!("Valid keys: {}", KNOWN_KEYS.join(", "))
                })?;
                cfg.save(&config_path)?;
                print_success(&format!("Set {} = {}", set.key, set.value));
                Ok(())
            }
        };
    }

    apply_overrides(&mut cfg, &cli);

    match cli.command {
        Commands::Install => {
            let manager = SessionManager::from_config(&cfg)?;
            let state = manager.install().await.context("Sign-in failed")?;
            print_success(&format!(
                "Signed in as {}",
                state.subject.as_deref().unwrap_or("(unknown)")
            ));
            print_session(&state);
        }
        Commands::GetToken => {
            let manager = SessionManager::from_config(&cfg)?;
            let token = manager.get_token().await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(token.as_bytes())?;
            stdout.flush()?;
        }
        Commands::Refresh => {
            let manager = SessionManager::from_config(&cfg)?;
            let state = manager.force_refresh().await.context("Refresh failed")?;
            print_success("Session refreshed");
            print_session(&state);
        }
        Commands::RefreshLoop => {
            let manager = Arc::new(SessionManager::from_config(&cfg)?);
            let cancel = CancellationToken::new();
            let handle = RefreshScheduler::new(manager, cancel.clone()).spawn();

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            tracing::info!("shutting down refresh loop");
            cancel.cancel();
            handle.await.context("Refresh loop panicked")?;
        }
        Commands::Status => {
            let store = SessionStore::new(cfg.session_path()?);
            match store.load() {
                Some(state) => {
                    print_field("Broker", &cfg.broker_url);
                    print_session(&state);
                }
                None => print_error(&format!(
                    "No session stored at {}. Run: tokenbroker-agent install",
                    store.path().display()
                )),
            }
        }
        Commands::Uninstall => {
            let manager = SessionManager::from_config(&cfg)?;
            if manager.uninstall().await? {
                print_success("Session removed");
            } else {
                println!("No session found");
            }
        }
        Commands::Config(_) => {}
    }

    Ok(())
}

fn apply_overrides(cfg: &mut AgentConfig, cli: &Cli) {
    if let Some(url) = &cli.broker_url {
        cfg.broker_url = url.clone();
    }
    if let Some(authority) = &cli.authority {
        cfg.authority = Some(authority.clone());
    }
    if let Some(client_id) = &cli.client_id {
        cfg.client_id = Some(client_id.clone());
    }
    if let Some(scopes) = &cli.scopes {
        cfg.scopes = scopes.clone();
    }
}
