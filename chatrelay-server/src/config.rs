//! Server configuration
//!
//! Defaults cover everything; an optional TOML file at
//! `$XDG_CONFIG_HOME/chatrelay/config.toml` overrides them, and the binary's
//! positional port argument overrides the port last.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use chatrelay_utils::{config_file, LogOutput, RelayError, Result};
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchStrategy;

/// Listening port when neither the config file nor the command line sets one
pub const DEFAULT_PORT: u16 = 8888;

/// Bytes read per transport read
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Worker threads for the completion strategy
pub const DEFAULT_WORKERS: usize = 8;

/// Messages queued per connection before sends start failing (completion strategy)
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener to
    pub bind_address: String,
    /// Listening port
    pub port: u16,
    /// Dispatch strategy
    pub strategy: DispatchStrategy,
    /// Worker pool size (completion strategy only)
    pub workers: usize,
    /// Read buffer size in bytes
    pub read_buffer_size: usize,
    /// Per-connection outbound queue capacity (completion strategy only)
    pub outbound_queue: usize,
    /// Where log lines go: `"stderr"`, `"file"` or `"both"`
    pub log_output: LogOutput,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            strategy: DispatchStrategy::default(),
            workers: DEFAULT_WORKERS,
            read_buffer_size: DEFAULT_READ_BUFFER,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            log_output: LogOutput::Stderr,
        }
    }
}

impl ServerConfig {
    /// Socket address to listen on
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            RelayError::config(format!("invalid bind_address: {}", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Replace the port with one given on the command line
    pub fn with_port_arg(mut self, arg: &str) -> Result<Self> {
        self.port = arg
            .trim()
            .parse()
            .map_err(|_| RelayError::InvalidPort(arg.to_string()))?;
        Ok(self)
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default location
    ///
    /// The file's absence is not an error; defaults apply.
    pub fn load() -> Result<ServerConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(ServerConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<ServerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| RelayError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<ServerConfig> {
        toml::from_str(content).map_err(|e| RelayError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &ServerConfig) -> Result<()> {
        if config.workers == 0 {
            return Err(RelayError::config("workers must be at least 1"));
        }
        if config.read_buffer_size == 0 {
            return Err(RelayError::config("read_buffer_size must be at least 1"));
        }
        if config.outbound_queue == 0 {
            return Err(RelayError::config("outbound_queue must be at least 1"));
        }
        config.listen_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.workers, 8);
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.strategy, DispatchStrategy::Completion);
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(
            &path,
            r#"
            port = 9000
            strategy = "readiness"
            "#,
        )
        .unwrap();

        let config = ConfigLoader::load_from_path(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.strategy, DispatchStrategy::Readiness);
        // Unspecified keys keep their defaults
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.log_output, LogOutput::Stderr);
    }

    #[test]
    fn test_parse_log_output() {
        let config = ConfigLoader::parse(r#"log_output = "both""#, Path::new("test.toml")).unwrap();
        assert_eq!(config.log_output, LogOutput::Both);

        let result = ConfigLoader::parse(r#"log_output = "syslog""#, Path::new("test.toml"));
        assert!(matches!(result, Err(RelayError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_load_missing_path_is_file_read_error() {
        let dir = tempdir().unwrap();
        let err = ConfigLoader::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, RelayError::FileRead { .. }));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = ConfigLoader::parse("invalid { toml", Path::new("test.toml"));
        assert!(matches!(result, Err(RelayError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_parse_unknown_strategy() {
        let result = ConfigLoader::parse(r#"strategy = "threads""#, Path::new("test.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_zero_workers() {
        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_zero_buffer() {
        let config = ServerConfig {
            read_buffer_size: 0,
            ..ServerConfig::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_bad_bind_address() {
        let config = ServerConfig {
            bind_address: "localhost:80".into(),
            ..ServerConfig::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_listen_addr() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 7777,
            ..ServerConfig::default()
        };
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:7777".parse().unwrap());
    }

    #[test]
    fn test_port_arg_overrides() {
        let config = ServerConfig::default().with_port_arg("7777").unwrap();
        assert_eq!(config.port, 7777);
    }

    #[test]
    fn test_port_arg_invalid() {
        let err = ServerConfig::default().with_port_arg("77777").unwrap_err();
        assert!(matches!(err, RelayError::InvalidPort(_)));
    }
}
