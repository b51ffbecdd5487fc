//! Audio framing between the wire and the ASR/TTS providers.
//!
//! Frames are opaque byte slabs plus metadata; the gateway never transcodes.
//! Opus packets pass through untouched, PCM is cut into fixed-duration
//! frames matching the session's negotiated parameters.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Opus,
    Pcm16le,
}

impl std::str::FromStr for AudioCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(AudioCodec::Opus),
            "pcm" | "pcm16le" | "pcm_s16le" => Ok(AudioCodec::Pcm16le),
            other => Err(Error::Protocol(format!("unsupported codec: {other}"))),
        }
    }
}

/// Stream parameters negotiated during the `hello` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default)]
    pub format: AudioCodec,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: AudioCodec::Opus,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

/// Frame duration in milliseconds.
fn default_frame_duration() -> u32 {
    60
}

/// One immutable audio frame.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
    pub data: Bytes,
}

impl AudioFrame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Wraps wire payloads and provider output into [`AudioFrame`]s for one
/// negotiated parameter set.
#[derive(Debug, Clone, Copy)]
pub struct AudioFramer {
    params: AudioParams,
}

impl AudioFramer {
    pub fn new(params: AudioParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> AudioParams {
        self.params
    }

    /// Bytes per PCM frame at the negotiated duration.
    pub fn pcm_frame_bytes(&self) -> usize {
        let samples_per_frame =
            self.params.sample_rate as usize * self.params.frame_duration as usize / 1000;
        samples_per_frame * self.params.channels as usize * 2
    }

    /// Wrap one binary wire message. Opus packets are already one frame per
    /// message; PCM payloads must land on a sample boundary.
    pub fn wrap_wire(&self, data: Bytes) -> Result<AudioFrame> {
        if data.is_empty() {
            return Err(Error::Protocol("empty audio frame".to_string()));
        }
        if self.params.format == AudioCodec::Pcm16le && data.len() % 2 != 0 {
            return Err(Error::Protocol(format!(
                "pcm16le frame has odd length {}",
                data.len()
            )));
        }
        Ok(self.frame_from(data))
    }

    /// Cut a contiguous PCM16LE buffer into frames of the negotiated
    /// duration. The final frame may be shorter.
    pub fn frame_pcm(&self, pcm: &[u8]) -> Vec<AudioFrame> {
        let chunk = self.pcm_frame_bytes().max(2);
        pcm.chunks(chunk)
            .filter(|c| !c.is_empty())
            .map(|c| self.frame_from(Bytes::copy_from_slice(c)))
            .collect()
    }

    fn frame_from(&self, data: Bytes) -> AudioFrame {
        AudioFrame {
            codec: self.params.format,
            sample_rate: self.params.sample_rate,
            channels: self.params.channels,
            frame_duration: self.params.frame_duration,
            data,
        }
    }
}

/// Encode interleaved i16 samples as little-endian bytes.
pub fn pcm_i16_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// Minimal WAV wrapper for PCM16LE uploads to transcription APIs.
pub fn pcm16le_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * 2;
    let block_align = channels * 2;

    let mut buf = Vec::with_capacity(44 + pcm.len());
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(pcm);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_params() -> AudioParams {
        AudioParams {
            format: AudioCodec::Pcm16le,
            sample_rate: 16000,
            channels: 1,
            frame_duration: 20,
        }
    }

    #[test]
    fn pcm_frame_bytes_matches_duration() {
        // 16 kHz mono, 20 ms => 320 samples => 640 bytes.
        let framer = AudioFramer::new(pcm_params());
        assert_eq!(framer.pcm_frame_bytes(), 640);
    }

    #[test]
    fn frame_pcm_cuts_on_frame_boundaries() {
        let framer = AudioFramer::new(pcm_params());
        let pcm = vec![0u8; 640 * 2 + 100];
        let frames = framer.frame_pcm(&pcm);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data.len(), 640);
        assert_eq!(frames[2].data.len(), 100);
    }

    #[test]
    fn wrap_wire_rejects_odd_pcm() {
        let framer = AudioFramer::new(pcm_params());
        assert!(framer.wrap_wire(Bytes::from_static(&[0u8; 3])).is_err());
        assert!(framer.wrap_wire(Bytes::from_static(&[0u8; 4])).is_ok());
    }

    #[test]
    fn opus_passes_through_opaque() {
        let framer = AudioFramer::new(AudioParams::default());
        let frame = framer
            .wrap_wire(Bytes::from_static(&[1, 2, 3]))
            .expect("opus frames are opaque");
        assert_eq!(frame.codec, AudioCodec::Opus);
        assert_eq!(frame.data.len(), 3);
    }

    #[test]
    fn wav_header_is_well_formed() {
        let wav = pcm16le_to_wav(&[0u8; 320], 16000, 1);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320);
    }
}
