//! siprelay - SIP registrar and proxy with an embedded RTP media relay
//!
//! Endpoints register an extension, call each other through the server, and
//! exchange audio through relay ports the server allocates per call.

pub mod config;
pub mod domain;
pub mod infrastructure;

pub use crate::config::Config;
pub use domain::shared::{DomainError, Result};
pub use infrastructure::protocols::sip::{ClientAgent, ClientEvent, SipServer};
