//! Engine configuration.
//!
//! Loaded via the `config` crate from `DEALFLOW__`-prefixed environment
//! variables, with nested keys separated by `__`:
//!
//! ```text
//! DEALFLOW__ENABLE_LEAD_SCORING=false
//! DEALFLOW__THRESHOLDS__LEAD_QUALIFICATION=75
//! DEALFLOW__RESOURCES__API_RATE__LIMIT=120
//! DEALFLOW__PERMISSIONS__CRM__SYNC=false
//! DEALFLOW__STAGE_DURATIONS__DUE_DILIGENCE__TARGET_MS=1209600000
//! ```
//!
//! Every field has a default, so an empty environment yields a working
//! engine with all built-in workflows enabled.

use dealflow_core::RetryPolicy;
use dealflow_guard::{PermissionGrants, ResourceLimits};
use dealflow_integration::CrmCredential;
use dealflow_scheduler::SchedulerConfig;
use dealflow_workflow::{
    ExecutorConfig, RegistrySettings, StageDuration, StepTimeouts, Thresholds,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DEALFLOW";

/// Separator between nested keys in environment variable names.
pub const ENV_SEPARATOR: &str = "__";

/// A permission override.
///
/// Scope names contain `:`, which environment variable names cannot, so a
/// nested map is flattened by joining its keys with `:`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PermissionSetting {
    Granted(bool),
    Nested(HashMap<String, PermissionSetting>),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Registers the Lead workflow.
    pub enable_lead_scoring: bool,
    /// Registers the Assessment workflow.
    pub assessment_workflow_enabled: bool,
    /// Enables `crm_sync` side effects. Without it they are skipped.
    pub crm: Option<CrmCredential>,
    pub thresholds: Thresholds,
    /// Overrides on top of the built-in grants.
    pub permissions: HashMap<String, PermissionSetting>,
    pub resources: ResourceLimits,
    pub agent_retry: RetryPolicy,
    pub side_effect_retry: RetryPolicy,
    pub timeouts: StepTimeouts,
    /// Expected time per state, keyed by state name.
    pub stage_durations: HashMap<String, StageDuration>,
    /// Period of the overdue-state check. 0 disables it.
    pub stage_check_interval_ms: u64,
    pub lease_ttl_ms: u64,
    /// How long agent and side-effect ledger entries of a finished instance
    /// are kept for inspection.
    pub ledger_retention_ms: u64,
    pub commit_retries: u32,
    pub max_transient_retries: u32,
    pub backpressure_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_lead_scoring: true,
            assessment_workflow_enabled: true,
            crm: None,
            thresholds: Thresholds::default(),
            permissions: HashMap::new(),
            resources: ResourceLimits::default(),
            agent_retry: RetryPolicy::default(),
            side_effect_retry: RetryPolicy::default(),
            timeouts: StepTimeouts::default(),
            stage_durations: HashMap::new(),
            stage_check_interval_ms: 60_000,
            lease_ttl_ms: 30_000,
            ledger_retention_ms: 600_000,
            commit_retries: 3,
            max_transient_retries: 5,
            backpressure_delay_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Loads configuration from an environment source, which tests can
    /// populate explicitly.
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

    /// Returns the registry settings derived from this configuration.
    #[must_use]
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            enable_lead_scoring: self.enable_lead_scoring,
            assessment_workflow_enabled: self.assessment_workflow_enabled,
            thresholds: self.thresholds,
            timeouts: self.timeouts,
            stage_durations: self.stage_durations.clone(),
        }
    }

    /// The built-in grants with the configured overrides applied.
    #[must_use]
    pub fn permission_grants(&self) -> PermissionGrants {
        let mut flat = Vec::new();
        for (key, setting) in &self.permissions {
            flatten_permission(key.clone(), setting, &mut flat);
        }
        flat.into_iter()
            .fold(PermissionGrants::builtin(), |grants, (scope, granted)| {
                grants.with_grant(scope, granted)
            })
    }

    /// Returns the executor tunables derived from this configuration.
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            lease_ttl: Duration::from_millis(self.lease_ttl_ms),
            ledger_retention: Duration::from_millis(self.ledger_retention_ms),
            commit_retries: self.commit_retries,
            agent_retry: self.agent_retry.clone(),
        }
    }

    /// Returns the scheduler tunables derived from this configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            backpressure: RetryPolicy {
                initial_backoff_ms: self.backpressure_delay_ms,
                ..defaults.backpressure
            },
            max_transient_retries: self.max_transient_retries,
            stage_check_interval: (self.stage_check_interval_ms > 0)
                .then(|| Duration::from_millis(self.stage_check_interval_ms)),
            ..defaults
        }
    }
}

fn flatten_permission(scope: String, setting: &PermissionSetting, out: &mut Vec<(String, bool)>) {
    match setting {
        PermissionSetting::Granted(granted) => out.push((scope, *granted)),
        PermissionSetting::Nested(children) => {
            for (key, child) in children {
                flatten_permission(format!("{scope}:{key}"), child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealflow_guard::scopes;

    fn load(vars: &[(&str, &str)]) -> EngineConfig {
        let source = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        EngineConfig::from_environment(
            config::Environment::with_prefix(ENV_PREFIX).source(Some(source)),
        )
        .unwrap()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]);
        assert_eq!(config, EngineConfig::default());
        assert!(config.enable_lead_scoring);
        assert!(config.crm.is_none());
        assert_eq!(config.thresholds.lead_qualification, 70.0);
        assert_eq!(config.resources.cpu, 4);
        assert_eq!(config.agent_retry.max_attempts, 3);
        assert_eq!(config.timeouts.agent_ms, 30_000);
    }

    #[test]
    fn nested_variables_override_defaults() {
        let config = load(&[
            ("DEALFLOW__ENABLE_LEAD_SCORING", "false"),
            ("DEALFLOW__THRESHOLDS__LEAD_QUALIFICATION", "75"),
            ("DEALFLOW__RESOURCES__CPU", "8"),
            ("DEALFLOW__AGENT_RETRY__MAX_ATTEMPTS", "5"),
            ("DEALFLOW__BACKPRESSURE_DELAY_MS", "250"),
        ]);
        assert!(!config.enable_lead_scoring);
        assert!(!config.registry_settings().enable_lead_scoring);
        assert_eq!(config.thresholds.lead_qualification, 75.0);
        assert_eq!(config.resources.cpu, 8);
        assert_eq!(config.agent_retry.max_attempts, 5);
        assert_eq!(config.scheduler_config().backpressure.initial_backoff_ms, 250);
    }

    #[test]
    fn stage_durations_load_from_nested_keys() {
        let config = load(&[
            ("DEALFLOW__STAGE_DURATIONS__DUE_DILIGENCE__TARGET_MS", "1000"),
            ("DEALFLOW__STAGE_DURATIONS__DUE_DILIGENCE__MAX_MS", "5000"),
            ("DEALFLOW__STAGE_CHECK_INTERVAL_MS", "0"),
        ]);
        let expected = StageDuration {
            target_ms: Some(1000),
            max_ms: Some(5000),
        };
        assert_eq!(
            config.registry_settings().stage_duration("DUE_DILIGENCE"),
            Some(expected)
        );
        assert_eq!(config.scheduler_config().stage_check_interval, None);
    }

    #[test]
    fn crm_credential_is_loaded_from_nested_keys() {
        let config = load(&[
            ("DEALFLOW__CRM__TYPE", "bearer_token"),
            ("DEALFLOW__CRM__TOKEN", "secret"),
        ]);
        assert_eq!(config.crm, Some(CrmCredential::BearerToken {
            token: "secret".to_string()
        }));
    }

    #[test]
    fn nested_permissions_are_joined_into_scopes() {
        let config = load(&[("DEALFLOW__PERMISSIONS__CRM__SYNC", "false")]);
        let grants = config.permission_grants();
        assert!(!grants.is_granted(scopes::CRM_SYNC));
        assert!(grants.is_granted(scopes::WORKFLOW_EXECUTE));
    }

    #[test]
    fn flat_permissions_apply_directly() {
        let config = EngineConfig {
            permissions: HashMap::from([(
                scopes::FILE_UPLOAD.to_string(),
                PermissionSetting::Granted(false),
            )]),
            ..EngineConfig::default()
        };
        let grants = config.permission_grants();
        assert!(!grants.is_granted(scopes::FILE_UPLOAD));
        assert!(grants.is_granted(scopes::AGENT_INVOKE));
    }

    #[test]
    fn derived_configs_follow_engine_settings() {
        let config = EngineConfig {
            lease_ttl_ms: 5_000,
            ledger_retention_ms: 1_000,
            commit_retries: 7,
            max_transient_retries: 2,
            ..EngineConfig::default()
        };
        assert_eq!(config.executor_config().lease_ttl, Duration::from_secs(5));
        assert_eq!(config.executor_config().commit_retries, 7);
        assert_eq!(
            config.executor_config().ledger_retention,
            Duration::from_secs(1)
        );
        assert_eq!(config.scheduler_config().max_transient_retries, 2);
        assert_eq!(config.scheduler_config().workers, None);
        assert_eq!(
            config.scheduler_config().stage_check_interval,
            Some(Duration::from_secs(60))
        );
    }
}
