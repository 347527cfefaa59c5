//! MindMate voice - live spoken conversation with a Gemini agent
//!
//! Streams microphone audio to the Gemini Live API and plays the synthesized
//! reply back gaplessly, with live captions for both sides.

#![forbid(unsafe_code)]

/// Microphone access and PulseAudio device listing
pub mod audio;
/// Capture thread feeding encoded frames to the transport
pub mod capture;
/// PCM frame encoding and decoding
pub mod codec;
/// Transport events and traits
pub mod events;
/// Gemini Live wire types and configuration
pub mod gemini;
/// Gemini Live WebSocket transport
pub mod gemini_client;
/// Playback scheduling
pub mod playback;
/// Session lifecycle controller
pub mod session;
/// PulseAudio output device
pub mod speaker;
/// Live captions
pub mod transcript;
/// Bounded outbound queue and WebSocket writer
pub mod ws_writer;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::{AudioError, PulseMicrophone};
pub use codec::{AudioFrame, DecodedAudioBuffer, EncodedChunk};
pub use gemini::{GeminiClientConfig, GeminiError};
pub use gemini_client::GeminiConnector;
pub use session::{LiveSession, SessionConfig, SessionError, SessionState, SessionStatus};
pub use speaker::PulseSpeaker;
pub use transcript::{Direction, TranscriptionRelay, TranscriptionState};
