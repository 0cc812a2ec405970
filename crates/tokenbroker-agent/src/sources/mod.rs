//! Identity assertion sources, tried in order during acquisition.

mod azure_cli;
mod device_code;

pub use azure_cli::AzureCliSource;
pub use device_code::{DeviceCodeSource, PollDecision, PollState};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::error::SourceError;

/// A way of obtaining an identity assertion from the identity provider.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Returns `Ok(None)` when the source cannot be used on this machine.
    async fn try_acquire(&self) -> Result<Option<String>, SourceError>;
}

/// Builds the configured sources: local CLI session first, then device code.
pub fn from_config(config: &AgentConfig) -> Vec<Arc<dyn CredentialSource>> {
    let mut sources: Vec<Arc<dyn CredentialSource>> = Vec::new();

    if config.local_session.enabled {
        sources.push(Arc::new(
            AzureCliSource::new(
                &config.local_session.command,
                config.local_session.resource.clone(),
            )
            .with_timeout(config.request_timeout),
        ));
    }

    if config.device_code.enabled {
        match DeviceCodeSource::from_config(config) {
            Some(source) => sources.push(Arc::new(source)),
            None => tracing::debug!("device code login disabled: authority or client_id not set"),
        }
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_follow_configuration() {
        let mut config = AgentConfig::default();
        let names: Vec<String> = from_config(&config)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["local-session"]);

        config.authority = Some("https://login.example.com/tenant".to_string());
        config.client_id = Some("client".to_string());
        let names: Vec<String> = from_config(&config)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["local-session", "device-code"]);

        config.local_session.enabled = false;
        config.device_code.enabled = false;
        assert!(from_config(&config).is_empty());
    }
}
