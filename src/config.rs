//! Agent configuration
//!
//! TOML configuration for the device agent: device identity, the MQTT broker
//! connection, per-operation retry tables and work-queue limits. Secrets are
//! never stored in the file; credentials are read from the environment
//! variables the file names.

use crate::retry::{RetryParams, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub operations: OperationsSection,
    #[serde(default)]
    pub queues: QueueSection,
}

/// Device identity and main-loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// External device id, used until the provisioning store supplies one
    pub device_id: Option<String>,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Main loop period in milliseconds
    #[serde(default = "default_do_work_interval")]
    pub do_work_interval_ms: u64,
    /// Optional JSON file the agent state store persists to
    pub state_file: Option<PathBuf>,
}

fn default_manufacturer() -> String {
    "contoso".to_string()
}

fn default_model() -> String {
    "generic".to_string()
}

fn default_do_work_interval() -> u64 {
    100
}

/// Where the broker hostname comes from
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostnameSource {
    /// `mqtt.hostname` in this file
    #[default]
    Config,
    /// Written to the state store by a separate provisioning flow
    Dps,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    pub hostname: Option<String>,
    #[serde(default)]
    pub hostname_source: HostnameSource,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// CA bundle; the OS trust store is used when absent
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Defaults to the external device id
    pub client_id: Option<String>,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Seconds a connect attempt may stay unanswered, 0 disables
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Override of the reconnect backoff
    pub retry: Option<RetryParams>,
}

fn default_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u16 {
    30
}

fn default_qos() -> u8 {
    1
}

fn default_protocol_version() -> u8 {
    5
}

fn default_connect_timeout() -> u64 {
    120
}

/// Minimum keep-alive accepted by the MQTT client
pub const MIN_KEEP_ALIVE_SECS: u16 = 5;

/// Per-operation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationSettings {
    /// Period between successful runs
    #[serde(default = "default_operation_interval")]
    pub interval_secs: u64,
    /// Lifetime of one operation instance before it expires
    #[serde(default = "default_operation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_operation_retry")]
    pub retry: RetryPolicy,
}

fn default_operation_interval() -> u64 {
    60 * 60
}

fn default_operation_timeout() -> u64 {
    60 * 60 * 24
}

fn default_operation_retry() -> RetryPolicy {
    RetryPolicy::uniform(RetryParams {
        max_retries: i32::MAX as u32,
        initial_delay_ms: 1000,
        max_delay_s: 60 * 60,
        fallback_wait_s: 60,
        max_jitter_percent: 60.0,
    })
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_operation_interval(),
            timeout_secs: default_operation_timeout(),
            retry: default_operation_retry(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationsSection {
    #[serde(default)]
    pub enrollment: OperationSettings,
    #[serde(default)]
    pub agent_info: OperationSettings,
    #[serde(default)]
    pub update: OperationSettings,
}

/// Work-queue high-water marks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default = "default_queue_capacity")]
    pub update_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub reporting_capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            update_capacity: default_queue_capacity(),
            reporting_capacity: default_queue_capacity(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(device_id) = &self.agent.device_id {
            validate_device_id(device_id)?;
        }
        self.mqtt.validate()?;

        for (name, settings) in [
            ("enrollment", &self.operations.enrollment),
            ("agent_info", &self.operations.agent_info),
            ("update", &self.operations.update),
        ] {
            settings.retry.validate().map_err(|e| {
                ConfigError::InvalidConfig(format!("operations.{name}.retry: {e}"))
            })?;
        }

        if self.queues.update_capacity == 0 || self.queues.reporting_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue capacities must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[agent]
device_id = "test-device"

[mqtt]
hostname = "broker.example.com"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl MqttSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_version != 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.protocol_version {} is not supported, the device protocol needs MQTT 5 properties",
                self.protocol_version
            )));
        }

        if self.qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }

        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port cannot be 0".to_string(),
            ));
        }

        if self.hostname_source == HostnameSource::Config
            && self.hostname.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::InvalidConfig(
                "mqtt.hostname is required when hostname_source = \"config\"".to_string(),
            ));
        }

        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.cert_file and mqtt.key_file must be set together".to_string(),
            ));
        }

        if let Some(retry) = &self.retry {
            retry
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.retry: {e}")))?;
        }

        Ok(())
    }
}

/// Validate external device ID format: `[a-zA-Z0-9._-]+`
pub fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[agent]
device_id = "device-42"
manufacturer = "contoso"
model = "toaster"
do_work_interval_ms = 250
state_file = "/var/lib/du-agent/state.json"

[mqtt]
hostname = "broker.example.com"
port = 8883
use_tls = true
ca_file = "/etc/ssl/ca.pem"
cert_file = "/etc/du/cert.pem"
key_file = "/etc/du/key.pem"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
clean_session = true
keep_alive_secs = 60
qos = 1
connect_timeout_secs = 0

[mqtt.retry]
initial_delay_ms = 500
max_delay_s = 30

[operations.enrollment]
interval_secs = 600

[operations.enrollment.retry.default]
max_retries = 5

[operations.enrollment.retry.client_transient]
max_retries = 10
max_jitter_percent = 10.0

[queues]
update_capacity = 8
"#;

        let config = AgentConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.agent.device_id.as_deref(), Some("device-42"));
        assert_eq!(config.agent.do_work_interval_ms, 250);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert!(config.mqtt.clean_session);
        assert_eq!(config.mqtt.connect_timeout_secs, 0);

        let retry = config.mqtt.retry.unwrap();
        assert_eq!(retry.initial_delay_ms, 500);
        assert_eq!(retry.max_delay_s, 30);
        // unspecified fields keep their defaults
        assert_eq!(retry.max_jitter_percent, 5.0);

        let enrollment = &config.operations.enrollment;
        assert_eq!(enrollment.interval_secs, 600);
        assert_eq!(enrollment.timeout_secs, 86_400);
        assert_eq!(enrollment.retry.default.max_retries, 5);
        assert_eq!(
            enrollment.retry.client_transient.map(|p| p.max_retries),
            Some(10)
        );

        assert_eq!(config.queues.update_capacity, 8);
        assert_eq!(config.queues.reporting_capacity, 64);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = AgentConfig::test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.mqtt.port, 8883);
        assert!(config.mqtt.use_tls);
        assert!(!config.mqtt.clean_session);
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.mqtt.protocol_version, 5);
        assert_eq!(config.mqtt.connect_timeout_secs, 120);
        assert_eq!(config.mqtt.hostname_source, HostnameSource::Config);
        assert_eq!(config.operations.update.interval_secs, 3600);
        assert_eq!(
            config.operations.update.retry.default.max_retries,
            i32::MAX as u32
        );
        assert_eq!(config.agent.do_work_interval_ms, 100);
    }

    #[test]
    fn test_dps_hostname_source_without_hostname() {
        let toml_content = r#"
[agent]

[mqtt]
hostname_source = "dps"
"#;
        let config = AgentConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.hostname_source, HostnameSource::Dps);
        assert!(config.mqtt.hostname.is_none());
    }

    #[test]
    fn test_config_source_requires_hostname() {
        let toml_content = r#"
[agent]

[mqtt]
port = 1883
"#;
        let result = AgentConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_mqtt_311() {
        let mut config = AgentConfig::test_config();
        config.mqtt.protocol_version = 4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_bad_qos_and_keep_alive() {
        let mut config = AgentConfig::test_config();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::test_config();
        config.mqtt.keep_alive_secs = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cert_and_key_must_pair() {
        let mut config = AgentConfig::test_config();
        config.mqtt.cert_file = Some(PathBuf::from("/tmp/cert.pem"));
        assert!(config.validate().is_err());

        config.mqtt.key_file = Some(PathBuf::from("/tmp/key.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_retry_jitter() {
        let mut config = AgentConfig::test_config();
        config.operations.update.retry.default.max_jitter_percent = 250.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("invalid@device").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("valid-device_123.test").is_ok());
    }
}
