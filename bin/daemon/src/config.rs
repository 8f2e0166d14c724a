//! Daemon configuration.
//!
//! Loaded via the `config` crate from `DEALFLOW__*` environment variables.
//! Engine settings sit at the top level, so the daemon reads the same
//! variables as [`EngineConfig::from_env`].

use dealflow_engine::EngineConfig;
use dealflow_engine::config::{ENV_PREFIX, ENV_SEPARATOR};
use dealflow_integration::SideEffectKind;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Daemon configuration composed from the engine config.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub nats: NatsSettings,

    /// Agent name to the URL its requests are POSTed to.
    #[serde(default)]
    pub agents: HashMap<String, String>,

    #[serde(default)]
    pub side_effects: SideEffectEndpoints,

    /// Base URL entity records are read from. Without it the daemon runs
    /// against an empty in-memory repository.
    #[serde(default)]
    pub entity_endpoint: Option<String>,

    /// Timeout applied to every outbound HTTP request, in milliseconds.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    #[serde(flatten)]
    pub engine: EngineConfig,
}

/// NATS connection and subject settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// JetStream stream lifecycle events are stored in.
    #[serde(default)]
    pub events_stream_name: Option<String>,

    /// Control requests arrive on `{control_prefix}.{operation}`.
    #[serde(default = "default_control_prefix")]
    pub control_prefix: String,
}

/// Where each side-effect kind is delivered.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SideEffectEndpoints {
    #[serde(default)]
    pub notification: Option<String>,
    #[serde(default)]
    pub crm_sync: Option<String>,
    #[serde(default)]
    pub file_upload: Option<String>,
}

impl SideEffectEndpoints {
    /// The configured endpoints, by kind.
    #[must_use]
    pub fn configured(&self) -> Vec<(SideEffectKind, &str)> {
        [
            (SideEffectKind::Notification, &self.notification),
            (SideEffectKind::CrmSync, &self.crm_sync),
            (SideEffectKind::FileUpload, &self.file_upload),
        ]
        .into_iter()
        .filter_map(|(kind, endpoint)| endpoint.as_deref().map(|url| (kind, url)))
        .collect()
    }
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_control_prefix() -> String {
    "dealflow.control".to_string()
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            events_stream_name: None,
            control_prefix: default_control_prefix(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Loads configuration from an explicit environment source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_environment(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(environment.separator(ENV_SEPARATOR).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Timeout applied to every outbound HTTP call.
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> DaemonConfig {
        let source = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<HashMap<_, _>>();
        DaemonConfig::from_environment(
            config::Environment::with_prefix(ENV_PREFIX).source(Some(source)),
        )
        .unwrap()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]);
        assert_eq!(config.nats.url, "nats://127.0.0.1:4222");
        assert_eq!(config.nats.control_prefix, "dealflow.control");
        assert!(config.agents.is_empty());
        assert!(config.side_effects.configured().is_empty());
        assert_eq!(config.entity_endpoint, None);
        assert_eq!(config.http_timeout(), Duration::from_secs(10));
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn endpoints_and_engine_settings_share_the_prefix() {
        let config = load(&[
            ("DEALFLOW__NATS__URL", "nats://bus:4222"),
            ("DEALFLOW__AGENTS__LEAD_SCORER", "http://agents/score"),
            ("DEALFLOW__SIDE_EFFECTS__NOTIFICATION", "http://notify/send"),
            ("DEALFLOW__ENTITY_ENDPOINT", "http://crm/entities"),
            ("DEALFLOW__ENABLE_LEAD_SCORING", "false"),
            ("DEALFLOW__COMMIT_RETRIES", "7"),
        ]);

        assert_eq!(config.nats.url, "nats://bus:4222");
        assert_eq!(
            config.agents.get("lead_scorer").map(String::as_str),
            Some("http://agents/score")
        );
        assert_eq!(
            config.side_effects.configured(),
            vec![(SideEffectKind::Notification, "http://notify/send")]
        );
        assert_eq!(config.entity_endpoint.as_deref(), Some("http://crm/entities"));
        assert!(!config.engine.enable_lead_scoring);
        assert_eq!(config.engine.commit_retries, 7);
    }
}
