//! RTP Session Management

use super::packet::{build_packet, RtpHeader};
use bytes::Bytes;
use rand::Rng;
use tracing::trace;

/// Samples per 20 ms frame at 8 kHz
pub const SAMPLES_PER_FRAME: u32 = 160;

/// RTP Session
///
/// Sequence/timestamp bookkeeping for one outgoing media stream. Owned by the
/// task that sends the stream.
#[derive(Debug)]
pub struct RtpSession {
    /// Synchronization source identifier (randomly generated)
    ssrc: u32,
    /// Next sequence number, wraps at 65536
    sequence: u16,
    /// Next timestamp, wraps at 2^32
    timestamp: u32,
    payload_type: u8,
    samples_per_packet: u32,
    packets_sent: u64,
}

impl RtpSession {
    /// Create a new RTP session with random SSRC, sequence and timestamp bases
    pub fn new(payload_type: u8) -> Self {
        let mut rng = rand::thread_rng();
        Self::with_bases(rng.gen(), rng.gen(), rng.gen(), payload_type)
    }

    pub fn with_bases(ssrc: u32, sequence: u16, timestamp: u32, payload_type: u8) -> Self {
        Self {
            ssrc,
            sequence,
            timestamp,
            payload_type,
            samples_per_packet: SAMPLES_PER_FRAME,
            packets_sent: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Build the next packet and advance sequence and timestamp.
    ///
    /// The first packet of the stream carries the marker bit.
    pub fn next_packet(&mut self, payload: &[u8]) -> Bytes {
        let header = RtpHeader::new(self.payload_type, self.sequence, self.timestamp, self.ssrc)
            .with_marker(self.packets_sent == 0);

        trace!("Sending {}", header);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet);
        self.packets_sent += 1;

        build_packet(&header, payload)
    }

    /// Build a packet for a named event such as a DTMF digit.
    ///
    /// Every packet of one event carries the event's start timestamp, so
    /// `event_timestamp` is taken from the caller; the stream clock still
    /// advances by a frame so audio resumes in step afterwards.
    pub fn next_event_packet(
        &mut self,
        payload_type: u8,
        event_timestamp: u32,
        marker: bool,
        payload: &[u8],
    ) -> Bytes {
        let header = RtpHeader::new(payload_type, self.sequence, event_timestamp, self.ssrc)
            .with_marker(marker);

        trace!("Sending event {}", header);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet);
        self.packets_sent += 1;

        build_packet(&header, payload)
    }
}

/// RTP Statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}
