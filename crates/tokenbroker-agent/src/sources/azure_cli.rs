use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::CredentialSource;
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::SourceError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
}

/// Reuses the token of an already signed-in `az` CLI session.
#[derive(Debug, Clone)]
pub struct AzureCliSource {
    command: String,
    resource: Option<String>,
    timeout: Duration,
}

impl AzureCliSource {
    /// Source running `command` (normally `az`), optionally for `resource`.
    pub fn new(command: &str, resource: Option<String>) -> Self {
        Self {
            command: command.to_string(),
            resource,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// The command is killed if it has not exited within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CredentialSource for AzureCliSource {
    fn name(&self) -> &str {
        "local-session"
    }

    async fn try_acquire(&self) -> Result<Option<String>, SourceError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["account", "get-access-token", "--output", "json"]);
        if let Some(resource) = &self.resource {
            cmd.arg("--resource").arg(resource);
        }
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                tracing::warn!(
                    command = %self.command,
                    timeout_secs = self.timeout.as_secs(),
                    "local session command did not exit, killed"
                );
                return Err(SourceError::TimedOut);
            }
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::debug!(command = %self.command, error = %e, "local session unavailable");
                return Ok(None);
            }
        };

        if !output.status.success() {
            tracing::debug!(
                command = %self.command,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "local session unavailable"
            );
            return Ok(None);
        }

        let token: CliToken = serde_json::from_slice(&output.stdout)
            .map_err(|e| SourceError::Protocol(format!("{} output: {e}", self.command)))?;
        Ok(Some(token.access_token))
    }
}
