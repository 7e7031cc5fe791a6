//! Engine configuration
//!
//! Every option has a default, so a config file only needs the keys it
//! changes. Command-line arguments are applied on top of the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::args::CliArgs;
use crate::error::{Result, TransferError};

/// HTTP proxy settings shared by the HTTP and FTP initiate commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Route HTTP/FTP connections through the proxy
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// `get` or `tunnel`; anything else fails when a connection is initiated
    pub method: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 8080,
            method: "tunnel".to_string(),
        }
    }
}

/// Configuration for the transfer engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket inactivity timeout in seconds
    pub timeout: u64,
    /// Timeout for establishing a peer connection, in seconds
    pub peer_connection_timeout: u64,
    /// Inactivity timeout of a peer connection past the handshake, in seconds
    pub peer_timeout: u64,
    /// Seconds of outbound silence before a keep-alive is sent
    pub keep_alive_interval: u64,
    /// Seconds a peer may keep us choked while we are interested
    pub max_peer_choking_interval: u64,
    /// Seconds before an outstanding block request is given up
    pub request_timeout: u64,
    /// Seconds to wait before retrying when no peer is available
    pub retry_wait: u64,
    /// Upload limit in KiB/s, 0 = unlimited
    pub upload_limit: u64,
    /// Maximum outstanding block requests per peer
    pub max_outstanding_requests: usize,
    /// Maximum simultaneously active peers
    pub max_peers: usize,
    /// Regular unchoke slots handed out by the choke policy
    pub max_unchoked_peers: usize,
    /// Seconds between choke policy rounds
    pub choke_interval: u64,
    pub listen_port_start: u16,
    pub listen_port_end: u16,
    /// Advertise the fast extension in the handshake
    pub fast_extension: bool,
    /// Keep serving peers after the download completed
    pub seed: bool,
    pub http_proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: 60,
            peer_connection_timeout: 20,
            peer_timeout: 180,
            keep_alive_interval: 120,
            max_peer_choking_interval: 180,
            request_timeout: 60,
            retry_wait: 5,
            upload_limit: 0,
            max_outstanding_requests: 16,
            max_peers: 55,
            max_unchoked_peers: 4,
            choke_interval: 10,
            listen_port_start: 6881,
            listen_port_end: 6999,
            fast_extension: true,
            seed: false,
            http_proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Load a configuration file in JSON format
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let data = std::fs::read_to_string(path).map_err(|e| {
            TransferError::config_error(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&data)
    }

    /// Parse a JSON configuration document
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| TransferError::config_error(format!("Invalid configuration: {}", e)))
    }

    /// Override file values with command-line arguments
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.listen_port_start = port;
            self.listen_port_end = self.listen_port_end.max(port);
        }
        if let Some(limit) = args.upload_limit {
            self.upload_limit = limit;
        }
        if args.seed {
            self.seed = true;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout == 0 || self.peer_connection_timeout == 0 || self.peer_timeout == 0 {
            return Err(TransferError::config_error("timeouts must be at least 1 second"));
        }

        if self.keep_alive_interval == 0 {
            return Err(TransferError::config_error(
                "keep_alive_interval must be at least 1 second",
            ));
        }

        if self.max_outstanding_requests == 0 {
            return Err(TransferError::config_error(
                "max_outstanding_requests must be at least 1",
            ));
        }

        if self.max_peers == 0 {
            return Err(TransferError::config_error("max_peers must be at least 1"));
        }

        if self.choke_interval == 0 {
            return Err(TransferError::config_error("choke_interval must be at least 1 second"));
        }

        if self.listen_port_start == 0 || self.listen_port_start > self.listen_port_end {
            return Err(TransferError::config_error(format!(
                "invalid listen port range {}-{}",
                self.listen_port_start, self.listen_port_end
            )));
        }

        if self.http_proxy.enabled && self.http_proxy.host.is_empty() {
            return Err(TransferError::config_error("http_proxy.host cannot be empty"));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn peer_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connection_timeout)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }

    pub fn max_peer_choking_interval(&self) -> Duration {
        Duration::from_secs(self.max_peer_choking_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait)
    }

    pub fn choke_interval(&self) -> Duration {
        Duration::from_secs(self.choke_interval)
    }

    /// Upload limit in bytes per second, 0 = unlimited
    pub fn upload_limit_bytes(&self) -> u64 {
        self.upload_limit * 1024
    }
}
