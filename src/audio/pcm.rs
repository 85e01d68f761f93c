//! Float ⇄ 16-bit PCM conversion and the base64 transport encoding.
//!
//! Wire layout is signed 16-bit little-endian, interleaved by channel.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, VoiceError};

/// Float samples are scaled by this before truncation, and divided by it on decode.
pub const PCM_SCALE: f32 = 32768.0;

const BYTES_PER_SAMPLE: usize = 2;

/// One fixed-length block of normalized samples as produced by the capture device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Base64 PCM payload plus its MIME tag, e.g. `audio/pcm;rate=16000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Decoded, de-interleaved audio ready to be scheduled for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// Truncating float → int16 conversion. Out-of-range input wraps modulo 2^16
/// instead of saturating, so `1.0` becomes `-32768`.
pub fn sample_to_i16(sample: f32) -> i16 {
    ((sample * PCM_SCALE) as i64) as i16
}

pub fn i16_to_sample(value: i16) -> f32 {
    value as f32 / PCM_SCALE
}

/// Convert float samples to little-endian 16-bit PCM bytes.
pub fn encode_samples(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        buf.put_i16_le(sample_to_i16(sample));
    }
    buf.freeze()
}

/// Encode raw PCM bytes for transport.
pub fn encode_bytes(pcm: &[u8], sample_rate: u32) -> EncodedChunk {
    EncodedChunk {
        data: STANDARD.encode(pcm),
        mime_type: format!("audio/pcm;rate={}", sample_rate),
    }
}

/// Encode one captured frame: float → int16 LE → base64.
pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    encode_bytes(&encode_samples(&frame.samples), frame.sample_rate)
}

/// Reverse of [`encode_bytes`] followed by PCM de-interleaving.
pub fn decode_chunk(data: &str, sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| VoiceError::MalformedAudio(format!("invalid base64 payload: {}", e)))?;
    decode_pcm(&bytes, sample_rate, channels)
}

/// Reinterpret little-endian 16-bit PCM bytes as de-interleaved float channels.
pub fn decode_pcm(mut bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer> {
    if channels == 0 {
        return Err(VoiceError::MalformedAudio("channel count is zero".to_string()));
    }
    let channels = channels as usize;
    let frame_bytes = BYTES_PER_SAMPLE * channels;
    if bytes.len() % frame_bytes != 0 {
        return Err(VoiceError::MalformedAudio(format!(
            "{} bytes is not a whole number of {}-channel frames",
            bytes.len(),
            channels
        )));
    }

    let frame_count = bytes.len() / frame_bytes;
    let mut data: Vec<Vec<f32>> = (0..channels)
        .map(|_| Vec::with_capacity(frame_count))
        .collect();
    for _ in 0..frame_count {
        for channel in data.iter_mut() {
            channel.push(i16_to_sample(bytes.get_i16_le()));
        }
    }

    Ok(AudioBuffer::new(sample_rate, data))
}
