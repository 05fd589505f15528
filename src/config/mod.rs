//! Configuration management for redshard

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::client::ClientOptions;
use crate::core::ServerAddress;
pub use crate::error::ConfigError;
use crate::error::RedshardResult;
use crate::ring::HashRing;

/// Main redshard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend servers, in ring ordinal order
    pub servers: Vec<ServerConfig>,
    /// Client behaviour
    #[serde(default)]
    pub client: ClientConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port`
    pub address: String,
    /// Relative share of the key space
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Client timeouts and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Operation deadline in milliseconds
    pub default_timeout_ms: u64,
    /// Connect deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Extra attempts after a connection error
    pub retry_count_on_connection_error: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

fn default_weight() -> u32 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        let options = ClientOptions::default();
        Self {
            default_timeout_ms: options.default_timeout.as_millis() as u64,
            connect_timeout_ms: 1000,
            retry_count_on_connection_error: options.retry_count_on_connection_error,
        }
    }
}

impl ClientConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: vec![ServerConfig {
                address: "127.0.0.1:6379".to_string(),
                weight: 1,
            }],
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "servers cannot be empty".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let address = server.parse_address()?;
            if server.weight == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "weight of {} must be greater than 0",
                    server.address
                )));
            }
            if seen.contains(&address) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate server: {}",
                    server.address
                )));
            }
            seen.push(address);
        }

        if self.client.default_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "default_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.client.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Build the ketama ring over the configured servers
    pub fn build_ring(&self) -> RedshardResult<HashRing> {
        let mut builder = HashRing::builder();
        for server in &self.servers {
            builder.add_server(server.parse_address()?, server.weight)?;
        }
        builder.create_continuum()
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            default_timeout: self.client.default_timeout(),
            retry_count_on_connection_error: self.client.retry_count_on_connection_error,
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            servers: vec![
                ServerConfig {
                    address: "10.0.1.20:6379".to_string(),
                    weight: 1,
                },
                ServerConfig {
                    address: "10.0.1.21:6379".to_string(),
                    weight: 1,
                },
                ServerConfig {
                    address: "10.0.1.22:6379".to_string(),
                    weight: 2,
                },
            ],
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

impl ServerConfig {
    pub fn parse_address(&self) -> Result<ServerAddress, ConfigError> {
        self.address.parse::<ServerAddress>().map_err(|_| {
            ConfigError::ValidationError(format!("Invalid server address: {}", self.address))
        })
    }
}
