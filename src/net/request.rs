//! Download requests
//!
//! A [`Request`] is the parsed target of a download: scheme, host and port,
//! with the port filled in from the scheme's well-known default.

use std::fmt;

use tracing::trace;
use url::Url;

use crate::error::{Result, TransferError};

/// Target of a single download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    url: Url,
    protocol: String,
    host: String,
    port: u16,
}

impl Request {
    /// Parse a URL into a request
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        let protocol = url.scheme().to_string();
        let host = url
            .host_str()
            .ok_or_else(|| TransferError::config_error(format!("URL has no host: {}", input)))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(0);
        trace!("Parsed request {}://{}:{}", protocol, host, port);
        Ok(Self {
            url,
            protocol,
            host,
            port,
        })
    }

    /// Scheme, e.g. `http`, `https`, `ftp`
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Origin host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Origin port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the origin expects TLS
    pub fn is_secure(&self) -> bool {
        self.protocol == "https"
    }

    /// Full URL
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}
