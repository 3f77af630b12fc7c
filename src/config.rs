use crate::quic::EndpointConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Highest ACK delay exponent a peer may be asked to apply.
const MAX_ACK_DELAY_EXPONENT: u8 = 20;
/// Smallest UDP payload a QUIC endpoint must support.
const MIN_PACKET_SIZE: usize = 1200;
const MAX_PACKET_SIZE: usize = 65527;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub server: ServerConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    pub ack_delay_exponent: u8,
    pub max_ack_delay_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_packet_size: usize,
    pub loss_threshold_ms: u64,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:4433".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Quartz".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let defaults = EndpointConfig::default();
        Self {
            ack_delay_exponent: defaults.ack_delay_exponent,
            max_ack_delay_ms: defaults.max_ack_delay.as_millis() as u64,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            max_packet_size: defaults.max_packet_size,
            loss_threshold_ms: defaults.loss_threshold.as_millis() as u64,
            max_connections: defaults.max_connections,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            server: ServerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if SocketAddr::from_str(&self.network.address).is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid network address format: '{}'. Expected format like 'IP:PORT'.",
                self.network.address
            )));
        }

        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Server name cannot be empty.".to_string(),
            ));
        }

        if self.transport.ack_delay_exponent > MAX_ACK_DELAY_EXPONENT {
            return Err(ConfigError::Validation(format!(
                "ACK delay exponent must be at most {}.",
                MAX_ACK_DELAY_EXPONENT
            )));
        }

        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.transport.max_packet_size) {
            return Err(ConfigError::Validation(format!(
                "Maximum packet size must be between {} and {}.",
                MIN_PACKET_SIZE, MAX_PACKET_SIZE
            )));
        }

        if self.transport.max_connections == 0 {
            return Err(ConfigError::Validation(
                "Maximum connections must be greater than 0.".to_string(),
            ));
        }

        Ok(())
    }

    /// Maps the transport section onto the endpoint configuration consumed
    /// by the QUIC server.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            ack_delay_exponent: self.transport.ack_delay_exponent,
            max_ack_delay: Duration::from_millis(self.transport.max_ack_delay_ms),
            idle_timeout: Duration::from_secs(self.transport.idle_timeout_secs),
            max_packet_size: self.transport.max_packet_size,
            loss_threshold: Duration::from_millis(self.transport.loss_threshold_ms),
            max_connections: self.transport.max_connections,
        }
    }
}

pub fn handle() -> Result<Config> {
    let config_path = PathBuf::from(CONFIG_FILE_NAME);
    if config_path.exists() {
        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    } else {
        let config = Config::default();
        save(&config, &config_path)?;
        Ok(config)
    }
}

fn save(config: &Config, path: &Path) -> Result<()> {
    let config_content = toml::to_string_pretty(config)?;
    let mut file = fs::File::create(path)?;
    file.write_all(config_content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_address_rejected() {
        let mut config = Config::default();
        config.network.address = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_packet_size_bounds() {
        let mut config = Config::default();
        config.transport.max_packet_size = 100;
        assert!(config.validate().is_err());
        config.transport.max_packet_size = MAX_PACKET_SIZE + 1;
        assert!(config.validate().is_err());
        config.transport.max_packet_size = 1350;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_config_mapping() {
        let config = Config::default();
        let endpoint = config.endpoint_config();
        assert_eq!(endpoint.ack_delay_exponent, 3);
        assert_eq!(endpoint.max_ack_delay, Duration::from_millis(100));
        assert_eq!(endpoint.loss_threshold, Duration::from_secs(1));
    }
}
