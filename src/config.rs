//! Configuration system for the MirAIe session manager
//!
//! Configuration is read once from a TOML file and fixed for the lifetime of
//! a session. Credentials never live in the file; `[mqtt]` names the
//! environment variables that hold them.

use crate::session::{ReconnectPolicy, SessionConfig};
use crate::transport::{Credentials, Endpoint, DEFAULT_BROKER_URL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub account: AccountSection,
}

/// MQTT section: broker location and credential sources
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL with protocol and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable containing the home identifier
    #[serde(default = "default_username_env")]
    pub username_env: String,
    /// Environment variable containing the access token
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Prefix of the generated client identifier
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_username_env() -> String {
    "MIRAIE_HOME_ID".to_string()
}

fn default_password_env() -> String {
    "MIRAIE_ACCESS_TOKEN".to_string()
}

fn default_client_id_prefix() -> String {
    "miraie-mqtt".to_string()
}

/// Session section: timing and retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Bound on each subscribe, unsubscribe and publish attempt
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_alive_check_interval")]
    pub alive_check_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_ceiling")]
    pub backoff_ceiling_secs: u64,
    /// Inbound silence longer than keep-alive times this factor is stale
    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: f64,
    /// Reconnect attempts a publish may make while disconnected
    #[serde(default = "default_publish_reconnect_attempts")]
    pub publish_reconnect_attempts: u32,
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
    #[serde(default = "default_publish_retry_delay")]
    pub publish_retry_delay_ms: u64,
    #[serde(default = "default_reconnect_delay_after_loss")]
    pub reconnect_delay_after_loss_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            monitor_interval_secs: default_monitor_interval(),
            alive_check_interval_secs: default_alive_check_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_ceiling_secs: default_backoff_ceiling(),
            stale_multiplier: default_stale_multiplier(),
            publish_reconnect_attempts: default_publish_reconnect_attempts(),
            publish_retries: default_publish_retries(),
            publish_retry_delay_ms: default_publish_retry_delay(),
            reconnect_delay_after_loss_ms: default_reconnect_delay_after_loss(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    5
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_alive_check_interval() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_ceiling() -> u64 {
    60
}

fn default_stale_multiplier() -> f64 {
    1.5
}

fn default_publish_reconnect_attempts() -> u32 {
    2
}

fn default_publish_retries() -> u32 {
    3
}

fn default_publish_retry_delay() -> u64 {
    500
}

fn default_reconnect_delay_after_loss() -> u64 {
    1000
}

/// Account section: values owned by the login layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSection {
    /// Login scope identifier; a random one is chosen when absent
    #[serde(default = "default_scope_id")]
    pub scope_id: u32,
}

impl Default for AccountSection {
    fn default() -> Self {
        Self {
            scope_id: default_scope_id(),
        }
    }
}

impl AccountSection {
    /// Scope string sent with the MirAIe login request: `an_{scope_id}`
    pub fn login_scope(&self) -> String {
        format!("an_{}", self.scope_id)
    }
}

fn default_scope_id() -> u32 {
    (Uuid::new_v4().as_u128() % 1_000_000_000) as u32
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        Endpoint::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.mqtt.client_id_prefix.trim().is_empty() {
            return Err(invalid("mqtt.client_id_prefix cannot be empty"));
        }

        let session = &self.session;
        if session.keep_alive_secs < 5 {
            return Err(invalid("session.keep_alive_secs must be at least 5"));
        }
        for (name, value) in [
            ("connect_timeout_secs", session.connect_timeout_secs),
            ("operation_timeout_secs", session.operation_timeout_secs),
            ("monitor_interval_secs", session.monitor_interval_secs),
            ("alive_check_interval_secs", session.alive_check_interval_secs),
            ("backoff_base_secs", session.backoff_base_secs),
        ] {
            if value == 0 {
                return Err(invalid(&format!("session.{name} must be greater than 0")));
            }
        }
        if session.max_reconnect_attempts == 0 {
            return Err(invalid("session.max_reconnect_attempts must be greater than 0"));
        }
        if session.publish_retries == 0 {
            return Err(invalid("session.publish_retries must be greater than 0"));
        }
        if session.backoff_ceiling_secs < session.backoff_base_secs {
            return Err(invalid(
                "session.backoff_ceiling_secs must not be below session.backoff_base_secs",
            ));
        }
        if !session.stale_multiplier.is_finite() || session.stale_multiplier <= 1.0 {
            return Err(invalid("session.stale_multiplier must be greater than 1.0"));
        }

        Ok(())
    }

    /// Runtime session configuration derived from this file
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        self.validate()?;

        let endpoint = Endpoint::parse(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        let session = &self.session;

        Ok(SessionConfig {
            endpoint,
            client_id_prefix: self.mqtt.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(session.keep_alive_secs),
            connect_timeout: Duration::from_secs(session.connect_timeout_secs),
            operation_timeout: Duration::from_secs(session.operation_timeout_secs),
            monitor_interval: Duration::from_secs(session.monitor_interval_secs),
            alive_check_interval: Duration::from_secs(session.alive_check_interval_secs),
            stale_multiplier: session.stale_multiplier,
            reconnect: ReconnectPolicy {
                max_attempts: session.max_reconnect_attempts,
                base_delay: Duration::from_secs(session.backoff_base_secs),
                ceiling: Duration::from_secs(session.backoff_ceiling_secs),
            },
            publish_reconnect_attempts: session.publish_reconnect_attempts,
            publish_retries: session.publish_retries,
            publish_retry_delay: Duration::from_millis(session.publish_retry_delay_ms),
            reconnect_delay_after_loss: Duration::from_millis(
                session.reconnect_delay_after_loss_ms,
            ),
        })
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Resolve broker credentials from the configured environment variables
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let username = Self::get_env_var_required(&self.mqtt.username_env)?;
        let password = Self::get_env_var_required(&self.mqtt.password_env)?;
        Ok(Credentials::new(username, password))
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtts://mqtt.miraie.in:8883"
username_env = "HOME_ID"
password_env = "TOKEN"
client_id_prefix = "ha-panasonic-miraie"

[session]
keep_alive_secs = 30
connect_timeout_secs = 15
max_reconnect_attempts = 4
backoff_ceiling_secs = 20
stale_multiplier = 2.0

[account]
scope_id = 424242
"#;

        let config = ClientConfig::from_toml_str(toml_content).unwrap();

        assert_eq!(config.mqtt.username_env, "HOME_ID");
        assert_eq!(config.mqtt.client_id_prefix, "ha-panasonic-miraie");
        assert_eq!(config.session.keep_alive_secs, 30);
        assert_eq!(config.session.max_reconnect_attempts, 4);
        assert_eq!(config.session.operation_timeout_secs, 5);
        assert_eq!(config.account.login_scope(), "an_424242");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();

        assert_eq!(config.mqtt.broker_url, DEFAULT_BROKER_URL);
        assert_eq!(config.mqtt.username_env, "MIRAIE_HOME_ID");
        assert_eq!(config.session, SessionSection::default());
        assert!(config.account.login_scope().starts_with("an_"));
    }

    #[test]
    fn test_session_config_conversion() {
        let config = ClientConfig::default();
        let session = config.session_config().unwrap();

        assert_eq!(session.endpoint, Endpoint::new("mqtt.miraie.in", 8883, true));
        assert_eq!(session.keep_alive, Duration::from_secs(60));
        assert_eq!(session.stale_threshold(), Duration::from_secs(90));
        assert_eq!(session.reconnect.max_attempts, 10);
        assert_eq!(session.reconnect.ceiling, Duration::from_secs(60));
        assert_eq!(session.publish_retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let result = ClientConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "https://mqtt.miraie.in"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_stale_multiplier_must_exceed_one() {
        let result = ClientConfig::from_toml_str(
            r#"
[session]
stale_multiplier = 1.0
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("stale_multiplier")));
    }

    #[test]
    fn test_ceiling_below_base_rejected() {
        let result = ClientConfig::from_toml_str(
            r#"
[session]
backoff_base_secs = 10
backoff_ceiling_secs = 5
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        for field in [
            "connect_timeout_secs",
            "operation_timeout_secs",
            "monitor_interval_secs",
            "max_reconnect_attempts",
            "publish_retries",
        ] {
            let content = format!("[session]\n{field} = 0\n");
            assert!(
                ClientConfig::from_toml_str(&content).is_err(),
                "{field} = 0 should be rejected"
            );
        }
    }

    #[test]
    fn test_short_keep_alive_rejected() {
        let result = ClientConfig::from_toml_str("[session]\nkeep_alive_secs = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let result = ClientConfig::from_toml_str("[session\nkeep_alive_secs = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_missing_credential_env_var() {
        let mut config = ClientConfig::default();
        config.mqtt.username_env = "MIRAIE_TEST_DEFINITELY_UNSET_USER".to_string();

        let result = config.credentials();

        assert!(
            matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "MIRAIE_TEST_DEFINITELY_UNSET_USER")
        );
    }
}
