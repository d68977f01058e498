//! Shared value objects

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// SIP URI value object (`sip:user@host[:port]`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: String,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// URI addressing `user` at a concrete socket address
    pub fn at(user: impl Into<String>, addr: SocketAddr) -> Self {
        Self::new(user, addr.ip().to_string(), Some(addr.port()))
    }

    pub fn parse(uri: &str) -> Result<Self, String> {
        let uri = uri.trim().trim_start_matches('<');
        let rest = uri
            .strip_prefix("sip:")
            .or_else(|| uri.strip_prefix("sips:"))
            .ok_or_else(|| "URI must start with 'sip:'".to_string())?;

        // Drop URI parameters and anything after the closing bracket
        let rest = rest
            .split(|c| c == ';' || c == '>' || c == '?')
            .next()
            .unwrap_or_default();

        let (user, host_port) = rest
            .split_once('@')
            .ok_or_else(|| "Invalid SIP URI format".to_string())?;
        if user.is_empty() || host_port.is_empty() {
            return Err("Invalid SIP URI format".to_string());
        }

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                Some(
                    port.parse::<u16>()
                        .map_err(|_| format!("Invalid port in SIP URI: {}", port))?,
                ),
            ),
            None => (host_port, None),
        };

        Ok(Self::new(user, host, port))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Socket address when the host is a literal IP and a port is present
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let port = self.port?;
        let ip = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()?;
        Some(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(port) = self.port {
            write!(f, "sip:{}@{}:{}", self.user, self.host, port)
        } else {
            write!(f, "sip:{}@{}", self.user, self.host)
        }
    }
}
