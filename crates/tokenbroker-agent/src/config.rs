use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

const AGENT_DIR: &str = ".tokenbroker";

/// Bound on a single broker or identity provider call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Keys accepted by `config set`.
pub const KNOWN_KEYS: &[&str] = &[
    "broker_url",
    "authority",
    "client_id",
    "scopes",
    "lead_time",
    "request_timeout",
    "session_path",
    "local_session.enabled",
    "local_session.command",
    "local_session.resource",
    "device_code.enabled",
    "device_code.device_authorization_endpoint",
    "device_code.token_endpoint",
    "device_code.max_wait",
    "retry.max_attempts",
    "retry.initial_delay",
    "retry.max_delay",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the broker.
    pub broker_url: String,
    /// Identity provider authority, e.g. `https://login.microsoftonline.com/<tenant>`.
    pub authority: Option<String>,
    pub client_id: Option<String>,
    /// Space-separated scopes requested from the identity provider.
    pub scopes: String,
    /// Margin before access expiry at which the session is refreshed.
    #[serde(with = "humantime_serde")]
    pub lead_time: Duration,
    /// Hard limit on each HTTP call and on the local CLI command.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Session file location. Defaults to `~/.tokenbroker/session.json`.
    pub session_path: Option<PathBuf>,
    pub local_session: LocalSessionConfig,
    pub device_code: DeviceCodeConfig,
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://localhost:8080".to_string(),
            authority: None,
            client_id: None,
            scopes: "openid profile email".to_string(),
            lead_time: Duration::from_secs(5 * 60),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            session_path: None,
            local_session: LocalSessionConfig::default(),
            device_code: DeviceCodeConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Reuse of an already signed-in local CLI session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalSessionConfig {
    pub enabled: bool,
    pub command: String,
    /// Resource passed as `--resource`.
    pub resource: Option<String>,
}

impl Default for LocalSessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "az".to_string(),
            resource: None,
        }
    }
}

/// Interactive device-code login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceCodeConfig {
    pub enabled: bool,
    /// Overrides `{authority}/oauth2/v2.0/devicecode`.
    pub device_authorization_endpoint: Option<String>,
    /// Overrides `{authority}/oauth2/v2.0/token`.
    pub token_endpoint: Option<String>,
    /// Upper bound on how long polling may run, whatever the code lifetime.
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for DeviceCodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_authorization_endpoint: None,
            token_endpoint: None,
            max_wait: Duration::from_secs(15 * 60),
        }
    }
}

/// Backoff for transient broker failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

fn agent_dir() -> Result<PathBuf, AgentError> {
    dirs::home_dir()
        .map(|home| home.join(AGENT_DIR))
        .ok_or_else(|| AgentError::configuration("cannot determine home directory"))
}

/// `~/.tokenbroker/agent.toml`
pub fn default_config_path() -> Result<PathBuf, AgentError> {
    Ok(agent_dir()?.join("agent.toml"))
}

/// `~/.tokenbroker/session.json`
pub fn default_session_path() -> Result<PathBuf, AgentError> {
    Ok(agent_dir()?.join("session.json"))
}

impl AgentConfig {
    /// Loads the file at `path`, or the defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| AgentError::configuration(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| AgentError::configuration(format!("{}: {e}", path.display())))
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), AgentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AgentError::configuration(e.to_string()))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AgentError::configuration(e.to_string()))?;
        fs::write(path, content)
            .map_err(|e| AgentError::configuration(format!("{}: {e}", path.display())))
    }

    /// Resolved session file location.
    pub fn session_path(&self) -> Result<PathBuf, AgentError> {
        match &self.session_path {
            Some(path) => Ok(path.clone()),
            None => default_session_path(),
        }
    }

    /// Sets a dotted key such as `device_code.max_wait` from its string form.
    ///
    /// The value is parsed as a boolean or integer when it looks like one and
    /// kept as a string otherwise; the result must still deserialize.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), AgentError> {
        if !KNOWN_KEYS.contains(&key) {
            return Err(AgentError::configuration(format!("unknown config key: {key}")));
        }

        let mut root = toml::Value::try_from(&*self)
            .map_err(|e| AgentError::configuration(e.to_string()))?;
        let mut table = root
            .as_table_mut()
            .ok_or_else(|| AgentError::configuration("configuration is not a table"))?;

        let (parents, leaf) = match key.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, key),
        };
        for segment in parents.into_iter().flat_map(|p| p.split('.')) {
            table = table
                .entry(segment.to_string())
                .or_insert(toml::Value::Table(toml::Table::new()))
                .as_table_mut()
                .ok_or_else(|| AgentError::configuration(format!("unknown config key: {key}")))?;
        }
        table.insert(leaf.to_string(), parse_value(value));

        *self = root
            .try_into()
            .map_err(|e| AgentError::configuration(format!("invalid value for {key}: {e}")))?;
        Ok(())
    }
}

fn parse_value(value: &str) -> toml::Value {
    if let Ok(b) = value.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    toml::Value::String(value.to_string())
}
