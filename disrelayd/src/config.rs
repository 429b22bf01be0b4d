use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_SERVICE_NAME, DEFAULT_TXT_ATTRIBUTE, DIS_SERVICE_TYPE};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Address to listen on; the port is always ephemeral
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Instance name to advertise the relay under
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Start the relay server as soon as the daemon is up
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Restrict mDNS to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
    /// Free-text TXT attribute, `key=value[,key=value...]`
    #[serde(default = "default_attribute")]
    pub attribute: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

fn default_service_type() -> String {
    DIS_SERVICE_TYPE.to_string()
}

fn default_attribute() -> String {
    DEFAULT_TXT_ATTRIBUTE.to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

fn default_message_log_capacity() -> usize {
    256
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            service_name: default_service_name(),
            autostart: false,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            interface: None,
            attribute: default_attribute(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            message_log_capacity: default_message_log_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.relay.bind_address, "0.0.0.0");
        assert_eq!(config.relay.service_name, "ESPDU-PRODUCER");
        assert!(!config.relay.autostart);
        assert_eq!(config.discovery.service_type, "_dis._tcp.local.");
        assert!(config.discovery.interface.is_none());
        assert_eq!(config.discovery.attribute, "foo=bar");
        assert_eq!(config.api.listen, "127.0.0.1:8054");
        assert_eq!(config.state.message_log_capacity, 256);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [relay]
            service_name = "TANK-SIM"
            autostart = true

            [discovery]
            interface = "eth0"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.service_name, "TANK-SIM");
        assert!(config.relay.autostart);
        assert_eq!(config.relay.bind_address, "0.0.0.0");
        assert_eq!(config.discovery.interface.as_deref(), Some("eth0"));
        assert_eq!(config.discovery.service_type, "_dis._tcp.local.");
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert!(Config::parse("[relay]\nautostart = \"yes\"").is_err());
    }
}
