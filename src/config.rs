use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::net::TransportOptions;

/// Environment variable naming an optional YAML config file.
pub const CONFIG_ENV: &str = "SLUICE_CONFIG";

/// Environment variable overriding the listen address.
pub const LISTEN_ENV: &str = "LISTEN";

/// Server configuration.
///
/// Timeouts are in whole seconds; `0` disables the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_addr: String,
    pub receive_timeout_secs: u64,
    pub send_timeout_secs: u64,
    /// Listen backlog; the OS maximum when unset.
    pub backlog: Option<u32>,
    pub input_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            receive_timeout_secs: 10,
            send_timeout_secs: 10,
            backlog: None,
            input_buffer_size: 4096,
        }
    }
}

impl Config {
    /// Loads from the file named by `SLUICE_CONFIG` if set, then applies `LISTEN`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), reading variables through `lookup`.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(listen_addr) = lookup(LISTEN_ENV) {
            config.listen_addr = listen_addr;
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::ListenAddr(self.listen_addr.clone()))
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        seconds(self.receive_timeout_secs)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        seconds(self.send_timeout_secs)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            input_buffer_size: self.input_buffer_size.max(1),
            receive_timeout: self.receive_timeout(),
            send_timeout: self.send_timeout(),
        }
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
