//! Configuration management
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `SIPRELAY__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::shared::{DomainError, Result};

const ENV_PREFIX: &str = "SIPRELAY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: IpAddr,
    pub bind_port: u16,
    pub domain: String,
    /// Applied when a REGISTER carries no Expires header
    pub default_expires: u32,
    /// Upper bound for granted registration lifetimes
    pub max_expires: u32,
    pub sweep_interval_secs: u64,
    /// Unanswered calls older than this are dropped by the sweep
    pub ringing_timeout_secs: u64,
    /// Store the Contact header's host:port instead of the packet source
    pub trust_contact_header: bool,
    pub auth: SipAuthConfig,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 5060,
            domain: "localhost".to_string(),
            default_expires: 3600,
            max_expires: 3600,
            sweep_interval_secs: 60,
            ringing_timeout_secs: 180,
            trust_contact_header: false,
            auth: SipAuthConfig::default(),
        }
    }
}

impl SipConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }
}

/// Digest authentication of REGISTER requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipAuthConfig {
    pub enabled: bool,
    pub realm: String,
    /// username -> password
    pub users: HashMap<String, String>,
}

impl Default for SipAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            realm: "siprelay".to_string(),
            users: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Address advertised in rewritten session descriptions
    pub relay_address: IpAddr,
    /// Address the relay sockets bind to
    pub bind_address: IpAddr,
    pub relay_port_min: u16,
    pub relay_port_max: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_port_min: 10000,
            relay_port_max: 20000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Tone,
    Silence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub mode: AudioMode,
    pub frequency: f32,
    pub amplitude: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::Tone,
            frequency: 440.0,
            amplitude: 0.3,
        }
    }
}

/// Demo client agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub server_host: IpAddr,
    pub server_port: u16,
    pub local_address: IpAddr,
    /// 0 picks an ephemeral port
    pub sip_port: u16,
    /// 0 picks an ephemeral port
    pub rtp_port: u16,
    pub expires: u32,
    pub register_timeout_ms: u64,
    pub max_auth_attempts: u32,
    pub auto_answer: bool,
    /// Length of each telephone-event digit
    pub dtmf_duration_ms: u32,
    pub audio: AudioConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: "100".to_string(),
            password: String::new(),
            domain: "localhost".to_string(),
            server_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 5060,
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            sip_port: 0,
            rtp_port: 0,
            expires: 3600,
            register_timeout_ms: 10_000,
            max_auth_attempts: 3,
            auto_answer: true,
            dtmf_duration_ms: 100,
            audio: AudioConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_host, self.server_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| DomainError::Internal(format!("default configuration: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DomainError::ValidationError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, e.g. to seed a configuration file
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DomainError::Internal(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sip.domain.trim().is_empty() {
            return Err(invalid("sip.domain must not be empty"));
        }
        if self.sip.max_expires == 0 {
            return Err(invalid("sip.max_expires must be positive"));
        }
        if self.sip.sweep_interval_secs == 0 {
            return Err(invalid("sip.sweep_interval_secs must be positive"));
        }
        if !(1..=86_400).contains(&self.sip.ringing_timeout_secs) {
            return Err(invalid("sip.ringing_timeout_secs must be within 1..=86400"));
        }
        if self.sip.auth.enabled && self.sip.auth.realm.trim().is_empty() {
            return Err(invalid("sip.auth.realm is required when auth is enabled"));
        }

        if self.media.relay_port_min == 0 {
            return Err(invalid("media.relay_port_min must be positive"));
        }
        if self.media.relay_port_max <= self.media.relay_port_min {
            return Err(invalid(
                "media relay port range must span at least two ports",
            ));
        }
        if self.media.relay_address.is_unspecified() {
            return Err(invalid("media.relay_address must be a routable address"));
        }

        if self.client.username.trim().is_empty() {
            return Err(invalid("client.username must not be empty"));
        }
        if self.client.register_timeout_ms == 0 {
            return Err(invalid("client.register_timeout_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&self.client.audio.amplitude) {
            return Err(invalid("client.audio.amplitude must be within 0.0..=1.0"));
        }
        if self.client.audio.frequency <= 0.0 || self.client.audio.frequency >= 4000.0 {
            return Err(invalid("client.audio.frequency must be within (0, 4000) Hz"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> DomainError {
    DomainError::ValidationError(message.to_string())
}
