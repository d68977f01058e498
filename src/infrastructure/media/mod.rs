//! Media processing implementations

pub mod codec;
pub mod generator;
pub mod relay;
pub mod rtp;

pub use codec::PcmuCodec;
pub use generator::{AudioSource, ToneGenerator};
pub use relay::{MediaRelay, RelayBinding, RelayEndpoint, RelayError};
pub use rtp::{RtpError, RtpHeader, RtpSession, RtpStats};
