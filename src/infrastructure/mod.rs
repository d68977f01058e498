//! Infrastructure layer - sockets, codecs and the tasks that drive them
//!
//! - `protocols::sip`: signaling (registrar, proxy, client agent)
//! - `media`: RTP packets, μ-law audio and the media relay

pub mod media;
pub mod protocols;
