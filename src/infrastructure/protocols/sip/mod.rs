//! SIP signaling
//!
//! Layers, bottom up:
//! ```text
//! ┌──────────────────────────────┐
//! │  server / client             │  sockets, tasks, events
//! ├──────────────────────────────┤
//! │  engine                      │  registrar + dialogs + relay
//! ├──────────────────────────────┤
//! │  message / sdp / auth        │  text codecs, digest
//! ├──────────────────────────────┤
//! │  transport (UDP)             │
//! └──────────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod client;
pub mod dialog;
pub mod engine;
pub mod message;
pub mod registrar;
pub mod rport;
pub mod sdp;
pub mod server;
pub mod transport;

pub use auth::{AuthChallenge, DigestAuth};
pub use client::{ClientAgent, ClientEvent};
pub use dialog::{CallState, Dialog, DialogTable};
pub use engine::SignalingEngine;
pub use message::{SipError, SipMessage, SipMethod};
pub use registrar::{Registrar, Registration};
pub use sdp::SessionDescription;
pub use server::SipServer;
pub use transport::{OutgoingMessage, UdpTransport};
