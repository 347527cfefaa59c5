//! PCM frame codec
//!
//! Converts captured f32 audio into the 16-bit little-endian PCM + base64
//! payload the Gemini Live API expects, and turns the model's base64 PCM
//! replies back into f32 sample buffers for playback.

use base64::engine::general_purpose;
use base64::Engine;

/// Microphone sample rate expected by the Live API.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized speech returned by the Live API.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured frame (256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;
/// Mime type attached to every outbound audio chunk.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

const PCM_SCALE: f32 = 32768.0;

/// One block of captured mono samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

/// Wire form of an audio block: base64 text plus its sample format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Decoded mono audio ready to be scheduled on an output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl DecodedAudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),
}

/// Quantize a single sample to signed 16-bit PCM.
///
/// Out-of-range input saturates at the i16 bounds rather than wrapping.
pub fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample * PCM_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a captured frame as base64 16-bit little-endian PCM.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    encode_samples(frame.samples())
}

pub fn encode_samples(samples: &[f32]) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }

    EncodedChunk {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: INPUT_MIME_TYPE.to_string(),
    }
}

/// Decode a base64 PCM chunk into a mono buffer at `output_sample_rate`.
pub fn decode(
    chunk: &EncodedChunk,
    output_sample_rate: u32,
) -> Result<DecodedAudioBuffer, DecodeError> {
    let bytes = general_purpose::STANDARD.decode(chunk.data.as_bytes())?;
    decode_pcm(&bytes, output_sample_rate)
}

/// Convert raw 16-bit little-endian PCM bytes into a decoded buffer.
pub fn decode_pcm(
    bytes: &[u8],
    output_sample_rate: u32,
) -> Result<DecodedAudioBuffer, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM_SCALE)
        .collect();

    Ok(DecodedAudioBuffer::new(samples, output_sample_rate))
}
