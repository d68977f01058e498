//! G.711 μ-law (PCMU) codec
//!
//! The relay forwards payloads opaquely; only the demo client encodes audio.

use bytes::{BufMut, Bytes, BytesMut};

/// RTP static payload type for PCMU
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

/// μ-law code for a zero sample
pub const ULAW_SILENCE: u8 = 0xFF;

/// G.711 μ-law (PCMU) Codec
pub struct PcmuCodec;

impl PcmuCodec {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    /// Encode one linear sample
    pub fn encode_sample(sample: i16) -> u8 {
        let sample = sample as i32;
        let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
        let mag = sample.abs().min(Self::CLIP) + Self::BIAS;

        // Segment is the position of the highest set bit above bit 7
        let segment = (mag >> 7) as u8;
        let exponent = if segment == 0 {
            0
        } else {
            7 - segment.leading_zeros() as u8
        };
        let mantissa = ((mag >> (exponent + 3)) & 0x0F) as u8;

        !(sign | (exponent << 4) | mantissa)
    }

    /// Decode one μ-law byte
    pub fn decode_sample(ulaw: u8) -> i16 {
        let ulaw = !ulaw;
        let exponent = (ulaw >> 4) & 0x07;
        let mantissa = (ulaw & 0x0F) as i32;
        let mag = (((mantissa << 3) + Self::BIAS) << exponent) - Self::BIAS;

        if ulaw & 0x80 != 0 {
            -mag as i16
        } else {
            mag as i16
        }
    }

    /// Encode PCM samples to μ-law
    pub fn encode(pcm: &[i16]) -> Bytes {
        let mut output = BytesMut::with_capacity(pcm.len());
        for &sample in pcm {
            output.put_u8(Self::encode_sample(sample));
        }
        output.freeze()
    }

    /// Decode μ-law to PCM samples
    pub fn decode(ulaw: &[u8]) -> Vec<i16> {
        ulaw.iter().map(|&b| Self::decode_sample(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcmu_silence() {
        let encoded = PcmuCodec::encode(&[0i16; 160]);
        assert_eq!(encoded.len(), 160);
        assert!(encoded.iter().all(|&b| b == ULAW_SILENCE));
        assert_eq!(PcmuCodec::decode_sample(ULAW_SILENCE), 0);
    }

    #[test]
    fn test_pcmu_reference_values() {
        assert_eq!(PcmuCodec::decode_sample(0x00), -32124);
        assert_eq!(PcmuCodec::decode_sample(0x80), 32124);
        assert_eq!(PcmuCodec::encode_sample(i16::MAX), 0x80);
        assert_eq!(PcmuCodec::encode_sample(i16::MIN), 0x00);
    }

    #[test]
    fn test_pcmu_encode_decode() {
        let pcm: Vec<i16> = vec![0, 100, -100, 1000, -1000, 10000, -10000];
        let decoded = PcmuCodec::decode(&PcmuCodec::encode(&pcm));

        for (original, back) in pcm.iter().zip(decoded.iter()) {
            let error = (*original as i32 - *back as i32).abs();
            // Quantization step grows with magnitude
            assert!(error <= (original.abs() as i32 / 16).max(8), "{} -> {}", original, back);
        }
    }
}
