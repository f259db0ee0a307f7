//! Configuration file parser for ChatOps
//!
//! Supports chatops.yml with the status port and the relay settings. Command
//! line flags override whatever the file sets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chatops_relay::{tls, Mode, TlsConfig, DEFAULT_WHITELIST};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOpsConfig {
    /// Port for the status api and public routes
    #[serde(default = "default_port")]
    pub port: u16,

    /// Verbose output
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub relay: RelayConfig,
}

/// Tunnel relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Passthrough host to dial (handler) or address to bind (passthrough)
    #[serde(default)]
    pub host: String,

    /// Relay communications port
    #[serde(default = "default_relay_port")]
    pub port: u16,

    #[serde(default)]
    pub passthrough: bool,

    #[serde(default)]
    pub handler: bool,

    /// PEM certificate chain (passthrough)
    #[serde(default = "default_cert")]
    pub cert: PathBuf,

    /// PEM private key (passthrough)
    #[serde(default = "default_key")]
    pub key: PathBuf,

    /// Extra CA to trust when dialing (handler)
    pub ca: Option<PathBuf>,

    /// Skip certificate verification when dialing
    #[serde(default)]
    pub insecure: bool,

    /// Regex over peer IPs allowed to connect (passthrough only)
    #[serde(default = "default_whitelist")]
    pub whitelist: String,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_relay_port(),
            passthrough: false,
            handler: false,
            cert: default_cert(),
            key: default_key(),
            ca: None,
            insecure: false,
            whitelist: default_whitelist(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl Default for ChatOpsConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            debug: false,
            relay: RelayConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    8040
}

fn default_relay_port() -> u16 {
    5000
}

fn default_cert() -> PathBuf {
    PathBuf::from("cert.crt")
}

fn default_key() -> PathBuf {
    PathBuf::from("cert.key")
}

fn default_whitelist() -> String {
    DEFAULT_WHITELIST.to_string()
}

fn default_check_interval_ms() -> u64 {
    2000
}

impl ChatOpsConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ChatOpsConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.relay.passthrough && self.relay.handler {
            anyhow::bail!("relay handler and passthrough modes are mutually exclusive");
        }
        if self.port == 0 {
            anyhow::bail!("Invalid status port 0");
        }
        if self.relay.port == 0 && self.mode()? != Mode::Off {
            anyhow::bail!("Invalid relay port 0");
        }
        if self.relay.check_interval_ms == 0 {
            anyhow::bail!("Relay check interval must be positive");
        }
        Ok(())
    }

    pub fn mode(&self) -> Result<Mode> {
        Mode::from_flags(self.relay.passthrough, self.relay.handler)
            .context("Invalid relay mode")
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.relay.check_interval_ms)
    }

    /// Load the TLS material the configured mode needs.
    pub fn tls_config(&self) -> Result<TlsConfig> {
        let config = match self.mode()? {
            Mode::PassThrough => TlsConfig::Server(
                tls::server_config_from_pem(&self.relay.cert, &self.relay.key)
                    .context("Failed to load relay certificate")?,
            ),
            Mode::Handler => TlsConfig::Client(
                tls::client_config(self.relay.ca.as_deref(), self.relay.insecure)
                    .context("Failed to build relay client TLS config")?,
            ),
            Mode::Off => TlsConfig::None,
        };
        Ok(config)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["chatops.yml", "chatops.yaml", ".chatops.yml", ".chatops.yaml"];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
