//! Telephone-event payload (RFC 4733 DTMF)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     event     |E|R| volume    |          duration             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use super::super::rtp::SAMPLES_PER_FRAME;

/// Dynamic payload type advertised for `telephone-event/8000`
pub const TELEPHONE_EVENT_PAYLOAD_TYPE: u8 = 101;

/// Power level in -dBm0 (0 is loudest, 63 quietest)
pub const DEFAULT_VOLUME: u8 = 10;

/// The end-of-event packet is sent this many times
const END_REPEATS: usize = 3;

pub const TELEPHONE_EVENT_SIZE: usize = 4;

/// Event code for a keypad digit: `0`-`9`, `*`, `#`, `A`-`D`
pub fn digit_to_event(digit: char) -> Option<u8> {
    match digit.to_ascii_uppercase() {
        d @ '0'..='9' => Some(d as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        d @ 'A'..='D' => Some(d as u8 - b'A' + 12),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    /// Samples since the event began
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn to_bytes(&self) -> [u8; TELEPHONE_EVENT_SIZE] {
        let duration = self.duration.to_be_bytes();
        [
            self.event,
            ((self.end as u8) << 7) | (self.volume & 0x3F),
            duration[0],
            duration[1],
        ]
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let bytes: [u8; TELEPHONE_EVENT_SIZE] = data.get(..TELEPHONE_EVENT_SIZE)?.try_into().ok()?;
        Some(Self {
            event: bytes[0],
            end: bytes[1] & 0x80 != 0,
            volume: bytes[1] & 0x3F,
            duration: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// Payloads for one digit, one per 20 ms frame.
///
/// Duration grows by a frame per packet; the last update carries the end
/// flag and is repeated.
pub fn event_payloads(event: u8, duration_ms: u32, volume: u8) -> Vec<TelephoneEvent> {
    let frames = (duration_ms / 20).max(1);
    let mut payloads: Vec<TelephoneEvent> = (1..=frames)
        .map(|frame| TelephoneEvent {
            event,
            end: false,
            volume,
            duration: (frame * SAMPLES_PER_FRAME).min(u16::MAX as u32) as u16,
        })
        .collect();

    if let Some(last) = payloads.last_mut() {
        last.end = true;
        let last = *last;
        payloads.extend(std::iter::repeat(last).take(END_REPEATS - 1));
    }
    payloads
}
