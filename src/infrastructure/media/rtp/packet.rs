//! RTP Header Codec (RFC 3550)
//!
//! Only the fixed header is interpreted. CSRC lists, extensions and padding
//! travel inside the payload and are never touched by the relay.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Fixed RTP header size
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP fixed header
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Version 2 header with no flags set
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }
}

impl fmt::Display for RtpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP[PT={}, Seq={}, TS={}, SSRC={:08x}, Marker={}]",
            self.payload_type, self.sequence, self.timestamp, self.ssrc, self.marker
        )
    }
}

/// RTP errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtpError {
    #[error("Packet too short")]
    PacketTooShort,
    #[error("Invalid version: {0}")]
    InvalidVersion(u8),
}

/// Parse the fixed header at the front of `data`
pub fn parse_header(data: &[u8]) -> Result<RtpHeader, RtpError> {
    if data.len() < RTP_HEADER_SIZE {
        return Err(RtpError::PacketTooShort);
    }

    let mut buf = data;

    // Byte 0: V(2), P(1), X(1), CC(4)
    let byte0 = buf.get_u8();
    let version = (byte0 >> 6) & 0x03;
    if version != 2 {
        return Err(RtpError::InvalidVersion(version));
    }

    // Byte 1: M(1), PT(7)
    let byte1 = buf.get_u8();

    Ok(RtpHeader {
        version,
        padding: (byte0 & 0x20) != 0,
        extension: (byte0 & 0x10) != 0,
        csrc_count: byte0 & 0x0F,
        marker: (byte1 & 0x80) != 0,
        payload_type: byte1 & 0x7F,
        sequence: buf.get_u16(),
        timestamp: buf.get_u32(),
        ssrc: buf.get_u32(),
    })
}

/// Payload bytes following the fixed header
pub fn payload(data: &[u8]) -> &[u8] {
    data.get(RTP_HEADER_SIZE..).unwrap_or(&[])
}

/// Serialize `header` followed by `payload`
pub fn build_packet(header: &RtpHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + payload.len());

    let byte0 = (header.version << 6)
        | ((header.padding as u8) << 5)
        | ((header.extension as u8) << 4)
        | (header.csrc_count & 0x0F);
    buf.put_u8(byte0);
    buf.put_u8(((header.marker as u8) << 7) | (header.payload_type & 0x7F));
    buf.put_u16(header.sequence);
    buf.put_u32(header.timestamp);
    buf.put_u32(header.ssrc);
    buf.put_slice(payload);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_then_parse() {
        let header = RtpHeader::new(0, 1234, 567890, 0x12345678).with_marker(true);
        let data = build_packet(&header, &[0xFF; 160]);

        assert_eq!(data.len(), RTP_HEADER_SIZE + 160);
        assert_eq!(&data[..2], &[0x80, 0x80]);

        let parsed = parse_header(&data).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload(&data).len(), 160);
    }

    #[test]
    fn test_big_endian_fields() {
        let data = [
            0x80, 0x08, 0xAB, 0xCD, 0x00, 0x00, 0x01, 0x40, 0xDE, 0xAD, 0xBE, 0xEF,
        ];
        let header = parse_header(&data).unwrap();
        assert_eq!(header.payload_type, 8);
        assert_eq!(header.sequence, 0xABCD);
        assert_eq!(header.timestamp, 320);
        assert_eq!(header.ssrc, 0xDEADBEEF);
        assert!(payload(&data).is_empty());
    }

    #[test]
    fn test_rtp_min_size() {
        let data = vec![0x80u8; 11];
        assert_eq!(parse_header(&data), Err(RtpError::PacketTooShort));
        assert_eq!(payload(&data), &[] as &[u8]);
    }

    #[test]
    fn test_rtp_invalid_version() {
        let mut data = vec![0u8; 12];
        data[0] = 0x40; // Version 1
        assert_eq!(parse_header(&data), Err(RtpError::InvalidVersion(1)));
    }
}
