//! Audio Codec Implementations

pub mod dtmf;
pub mod g711;

pub use dtmf::{digit_to_event, event_payloads, TelephoneEvent, TELEPHONE_EVENT_PAYLOAD_TYPE};
pub use g711::{PcmuCodec, PCMU_PAYLOAD_TYPE, ULAW_SILENCE};
