use std::time::Duration;

use log::warn;
use mapi_shared::mapi::duration::parse_duration;
use mapi_shared::mapi::providers::Platform;
use mapi_shared::os::env_var::EnvVarQuery;

/// Namespace the controllers manage; empty means all namespaces
const TARGET_NAMESPACE_LABEL: &str = "TARGET_NAMESPACE";
/// Enables the AuthoritativeAPI pause machinery when set to "true"
const MACHINE_API_MIGRATION_LABEL: &str = "FEATURE_GATE_MACHINE_API_MIGRATION";
/// Bounded poll deadline for replica create/delete visibility
const STATE_CONFIRMATION_TIMEOUT_LABEL: &str = "STATE_CONFIRMATION_TIMEOUT";
/// Bounded poll interval for replica create/delete visibility
const STATE_CONFIRMATION_INTERVAL_LABEL: &str = "STATE_CONFIRMATION_INTERVAL";
/// Default MachineHealthCheck node startup timeout
const NODE_STARTUP_TIMEOUT_LABEL: &str = "NODE_STARTUP_TIMEOUT";
/// Cloud platform tag selecting the typed provider config view
const PLATFORM_LABEL: &str = "PLATFORM";
/// Port the Prometheus scrape endpoint listens on
const METRICS_PORT_LABEL: &str = "METRICS_PORT";

/// Runtime configuration shared by all controllers.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace to manage. `None` watches all namespaces.
    pub target_namespace: Option<String>,
    /// Gates the `Paused` condition machinery on Machines and MachineSets.
    pub machine_api_migration: bool,
    pub state_confirmation_timeout: Duration,
    pub state_confirmation_interval: Duration,
    /// Default for MachineHealthChecks that do not set their own.
    pub node_startup_timeout: Duration,
    pub platform: Platform,
    pub metrics_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            target_namespace: None,
            machine_api_migration: false,
            state_confirmation_timeout: Duration::from_secs(10),
            state_confirmation_interval: Duration::from_millis(100),
            node_startup_timeout: Duration::from_secs(10 * 60),
            platform: Platform::None,
            metrics_port: 8080,
        }
    }
}

impl ControllerConfig {
    /// Builds the configuration from environment variables, falling back
    /// to defaults and logging anything unparseable.
    pub fn from_env(env: &dyn EnvVarQuery) -> Self {
        let mut config = ControllerConfig::default();

        if let Ok(namespace) = env.get_env_var(TARGET_NAMESPACE_LABEL) {
            if !namespace.is_empty() {
                config.target_namespace = Some(namespace);
            }
        }
        if let Ok(value) = env.get_env_var(MACHINE_API_MIGRATION_LABEL) {
            config.machine_api_migration = value == "true";
        }
        if let Ok(value) = env.get_env_var(STATE_CONFIRMATION_TIMEOUT_LABEL) {
            match parse_duration(&value) {
                Some(timeout) => config.state_confirmation_timeout = timeout,
                None => warn!(
                    "ignoring unparseable {}: {:?}",
                    STATE_CONFIRMATION_TIMEOUT_LABEL, value
                ),
            }
        }
        if let Ok(value) = env.get_env_var(STATE_CONFIRMATION_INTERVAL_LABEL) {
            match parse_duration(&value) {
                Some(interval) => config.state_confirmation_interval = interval,
                None => warn!(
                    "ignoring unparseable {}: {:?}",
                    STATE_CONFIRMATION_INTERVAL_LABEL, value
                ),
            }
        }
        if let Ok(value) = env.get_env_var(NODE_STARTUP_TIMEOUT_LABEL) {
            match parse_duration(&value) {
                Some(timeout) => config.node_startup_timeout = timeout,
                None => warn!(
                    "ignoring unparseable {}: {:?}",
                    NODE_STARTUP_TIMEOUT_LABEL, value
                ),
            }
        }
        if let Ok(value) = env.get_env_var(PLATFORM_LABEL) {
            match value.parse() {
                Ok(platform) => config.platform = platform,
                Err(e) => warn!("ignoring {}: {}", PLATFORM_LABEL, e),
            }
        }
        if let Ok(value) = env.get_env_var(METRICS_PORT_LABEL) {
            match value.parse() {
                Ok(port) => config.metrics_port = port,
                Err(_) => warn!("ignoring unparseable {}: {:?}", METRICS_PORT_LABEL, value),
            }
        }

        config
    }
}
