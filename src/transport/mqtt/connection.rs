//! Pure connection state and configuration for the MQTT session
//!
//! This module contains the session's state enum, its timing constants and
//! the construction of rumqttc options (TLS, credentials, keep-alive, clean
//! start) from configuration.

use crate::config::{AgentConfig, MqttSection, MIN_KEEP_ALIVE_SECS};
use crate::transport::EngineError;
use chrono::TimeDelta;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delay added to the backoff after a failed or dropped connection
pub const DEFAULT_CONNECT_RETRY_DELAY_SECS: i64 = 5 * 60;
/// Delay added after a connect call rejected its arguments; misconfiguration
/// is not fixed by retrying quickly
pub const INVALID_ARGUMENT_RETRY_DELAY_SECS: i64 = 60 * 60;
/// How often to ask the provisioning store for a missing hostname
pub const HOSTNAME_REQUERY_SECS: i64 = 5;
/// Window during which the engine is not pumped after an unrecoverable error
pub const FAILURE_SUPPRESSION_SECS: i64 = 60;
/// Upper bound of one engine poll
pub const POLL_TIMEOUT_MS: u64 = 100;
/// Default time a connect attempt may stay unanswered
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 120;
/// Largest packet the client accepts
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in flight
    #[default]
    Unknown,
    /// Connect issued, waiting for CONNACK
    Connecting,
    Connected,
    /// Lost or refused; waiting for the next retry time
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unknown => "Unknown",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs of the session state machine
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTimings {
    pub retry_delay: TimeDelta,
    pub invalid_argument_delay: TimeDelta,
    pub hostname_requery: TimeDelta,
    pub suppression_window: TimeDelta,
    pub poll_timeout: Duration,
    /// `None` waits for CONNACK forever
    pub connect_timeout: Option<TimeDelta>,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            retry_delay: TimeDelta::seconds(DEFAULT_CONNECT_RETRY_DELAY_SECS),
            invalid_argument_delay: TimeDelta::seconds(INVALID_ARGUMENT_RETRY_DELAY_SECS),
            hostname_requery: TimeDelta::seconds(HOSTNAME_REQUERY_SECS),
            suppression_window: TimeDelta::seconds(FAILURE_SUPPRESSION_SECS),
            poll_timeout: Duration::from_millis(POLL_TIMEOUT_MS),
            connect_timeout: Some(TimeDelta::seconds(DEFAULT_CONNECT_TIMEOUT_SECS as i64)),
        }
    }
}

impl SessionTimings {
    pub fn from_config(config: &MqttSection) -> Self {
        let connect_timeout = match config.connect_timeout_secs {
            0 => None,
            secs => TimeDelta::try_seconds(secs.min(i64::MAX as u64) as i64),
        };
        Self {
            connect_timeout,
            ..Self::default()
        }
    }
}

/// Everything the engine needs to open a connection except the endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectSettings {
    pub client_id: String,
    pub use_tls: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_start: bool,
}

impl ConnectSettings {
    /// Build settings from configuration; the client id defaults to the
    /// external device id
    pub fn from_config(config: &AgentConfig, device_id: &str) -> Self {
        let mqtt = &config.mqtt;
        Self {
            client_id: mqtt
                .client_id
                .clone()
                .unwrap_or_else(|| device_id.to_string()),
            use_tls: mqtt.use_tls,
            ca_file: mqtt.ca_file.clone(),
            cert_file: mqtt.cert_file.clone(),
            key_file: mqtt.key_file.clone(),
            username: config.get_mqtt_username(),
            password: config.get_mqtt_password(),
            clean_start: mqtt.clean_session,
        }
    }
}

fn read_tls_file(path: &Path, what: &str) -> Result<Vec<u8>, EngineError> {
    std::fs::read(path).map_err(|e| {
        EngineError::InvalidArgument(format!("cannot read {what} '{}': {e}", path.display()))
    })
}

/// Pure function to configure MQTT options for one connect attempt
///
/// TLS material is read here so a fixed file is picked up by the next
/// attempt without restarting the agent.
pub fn configure_mqtt_options(
    settings: &ConnectSettings,
    host: &str,
    port: u16,
    keep_alive_secs: u16,
) -> Result<MqttOptions, EngineError> {
    if host.is_empty() {
        return Err(EngineError::InvalidArgument("empty hostname".to_string()));
    }
    if port == 0 {
        return Err(EngineError::InvalidArgument("port 0".to_string()));
    }
    if settings.client_id.is_empty() {
        return Err(EngineError::InvalidArgument("empty client id".to_string()));
    }
    if keep_alive_secs < MIN_KEEP_ALIVE_SECS {
        return Err(EngineError::InvalidArgument(format!(
            "keep-alive {keep_alive_secs}s is below {MIN_KEEP_ALIVE_SECS}s"
        )));
    }

    let mut mqtt_options = MqttOptions::new(settings.client_id.clone(), host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(u64::from(keep_alive_secs)));
    mqtt_options.set_clean_start(settings.clean_start);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(username) = &settings.username {
        let password = settings.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    if settings.use_tls {
        let client_auth = match (&settings.cert_file, &settings.key_file) {
            (Some(cert), Some(key)) => Some((
                read_tls_file(cert, "client certificate")?,
                read_tls_file(key, "client key")?,
            )),
            (None, None) => None,
            _ => {
                return Err(EngineError::InvalidArgument(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        };

        let transport = match &settings.ca_file {
            Some(ca) => RumqttcTransport::tls(read_tls_file(ca, "CA file")?, client_auth, None),
            None if client_auth.is_none() => RumqttcTransport::tls_with_default_config(),
            None => {
                return Err(EngineError::InvalidArgument(
                    "client certificates need an explicit ca_file".to_string(),
                ))
            }
        };
        mqtt_options.set_transport(transport);
    }

    Ok(mqtt_options)
}
