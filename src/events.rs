//! Events exchanged between the live session and its transport

use crate::codec::EncodedChunk;
use crate::gemini::Result;
use std::future::Future;
use tokio::sync::mpsc;

/// Inbound content delivered by the remote agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEvent {
    /// Synthesized speech fragment (base64 PCM, 24 kHz)
    pub audio: Vec<EncodedChunk>,
    /// Latest transcription of the user's speech
    pub input_transcript: Option<String>,
    /// Latest transcription of the agent's speech
    pub output_transcript: Option<String>,
    /// The agent stopped talking because the user barged in
    pub interrupted: bool,
    pub turn_complete: bool,
}

impl ServerEvent {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
            && self.input_transcript.is_none()
            && self.output_transcript.is_none()
            && !self.interrupted
            && !self.turn_complete
    }
}

/// Lifecycle and content notifications from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Session setup acknowledged, ready for media
    Open,
    Message(ServerEvent),
    /// Remote side closed the connection
    Closed,
    Error(String),
}

/// Outbound half of a duplex connection to the conversational agent.
///
/// `send` is called from the capture thread once per frame and must not block.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, chunk: EncodedChunk);

    /// Close the connection. Calling it more than once has no further effect.
    fn close(&self);
}

/// Opens transports. Inbound traffic is delivered on `events`.
pub trait Connector {
    type Transport: Transport;

    fn connect(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> impl Future<Output = Result<Self::Transport>> + Send;
}
