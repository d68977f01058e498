//! RTP (Real-time Transport Protocol) Implementation
//!
//! This module implements the RFC 3550 fixed header and sender bookkeeping.

pub mod packet;
pub mod session;

pub use packet::{build_packet, parse_header, RtpError, RtpHeader, RTP_HEADER_SIZE};
pub use session::{RtpSession, RtpStats, SAMPLES_PER_FRAME};
