use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{CHAT_SERVICE_NAME, DEFAULT_BUFFER_CAPACITY, DEFAULT_DOMAIN};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Display name advertised to other peers. Defaults to the system
    /// hostname.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Service type name; peers only see each other when this matches.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Refuse every inbound connection when false.
    #[serde(default = "default_accept_inbound")]
    pub accept_inbound: bool,
    /// Bytes pulled from a socket per read.
    #[serde(default = "default_buffer_capacity")]
    pub input_buffer_capacity: usize,
    /// Bytes pushed to a socket per write.
    #[serde(default = "default_buffer_capacity")]
    pub output_buffer_capacity: usize,
}

fn default_device_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "lanchat-peer".to_string())
}

fn default_service_name() -> String {
    CHAT_SERVICE_NAME.to_string()
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_accept_inbound() -> bool {
    true
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_name: default_service_name(),
            domain: default_domain(),
            accept_inbound: default_accept_inbound(),
            input_buffer_capacity: default_buffer_capacity(),
            output_buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
