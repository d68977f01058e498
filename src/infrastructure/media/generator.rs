//! Local audio source for the demo client
//!
//! Produces one 20 ms μ-law frame per call: a sine tone or digital silence.

use super::codec::g711::{PcmuCodec, ULAW_SILENCE};
use super::rtp::session::SAMPLES_PER_FRAME;
use bytes::Bytes;

const SAMPLE_RATE: u32 = 8000;

/// What the client plays into a call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioSource {
    Tone { frequency: f32, amplitude: f32 },
    Silence,
}

impl Default for AudioSource {
    fn default() -> Self {
        AudioSource::Tone {
            frequency: 440.0,
            amplitude: 0.3,
        }
    }
}

/// Frame generator for one outgoing stream
pub struct ToneGenerator {
    source: AudioSource,
    /// Fraction of a cycle, kept in [0, 1)
    phase: f32,
}

impl ToneGenerator {
    pub fn new(source: AudioSource) -> Self {
        Self { source, phase: 0.0 }
    }

    /// Next linear sample
    fn next_sample(&mut self, frequency: f32, amplitude: f32) -> i16 {
        let sample = amplitude * (self.phase * 2.0 * std::f32::consts::PI).sin();

        self.phase += frequency / SAMPLE_RATE as f32;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        (sample.clamp(-1.0, 1.0) * 32767.0) as i16
    }

    /// Next 160-byte μ-law frame
    pub fn next_frame(&mut self) -> Bytes {
        match self.source {
            AudioSource::Silence => Bytes::from(vec![ULAW_SILENCE; SAMPLES_PER_FRAME as usize]),
            AudioSource::Tone {
                frequency,
                amplitude,
            } => {
                let pcm: Vec<i16> = (0..SAMPLES_PER_FRAME)
                    .map(|_| self.next_sample(frequency, amplitude))
                    .collect();
                PcmuCodec::encode(&pcm)
            }
        }
    }
}
