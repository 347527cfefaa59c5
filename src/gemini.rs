//! Gemini Live API wire types
//!
//! Message shapes, configuration and error type for the bidirectional
//! `BidiGenerateContent` WebSocket used by the voice session.

use crate::codec::EncodedChunk;
use crate::events::ServerEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an empathetic listener. Keep responses brief, warm, and encouraging. Focus on the user's tone and stress levels.";

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Configuration for the Gemini client
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub url: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub voice_name: Option<String>,
    pub system_instruction: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub setup_timeout: Duration,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            url: LIVE_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            response_modality: ResponseModality::Audio,
            voice_name: Some(DEFAULT_VOICE.to_string()),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            input_transcription: true,
            output_transcription: true,
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl GeminiClientConfig {
    /// Build a config that authenticates with `api_key`.
    pub fn from_api_key(api_key: &str, config: Option<GeminiClientConfig>) -> Self {
        let mut config = config.unwrap_or_default();
        config.url = format!("{}?key={}", LIVE_ENDPOINT, api_key);
        config
    }

    /// The setup message that opens every session.
    pub fn setup_message(&self) -> BidiGenerateContentSetup {
        let speech_config = match (self.response_modality, &self.voice_name) {
            (ResponseModality::Audio, Some(voice)) => Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.clone(),
                    },
                },
            }),
            _ => None,
        };

        BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![self.response_modality.as_str().to_string()],
                speech_config,
            }),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part { text: text.clone() }],
            }),
            input_audio_transcription: self
                .input_transcription
                .then(AudioTranscriptionConfig::default),
            output_audio_transcription: self
                .output_transcription
                .then(AudioTranscriptionConfig::default),
        }
    }
}

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Content {
    pub parts: Vec<Part>,
}

/// Empty marker object that switches a transcription stream on.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AudioTranscriptionConfig {}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime microphone input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Message sent from client to server.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Setup { setup: BidiGenerateContentSetup },
    RealtimeInput { realtime_input: RealtimeInput },
}

impl ClientMessage {
    /// Serialize to the `{"<kind>": {...}}` envelope the server expects.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Setup { setup } => serde_json::json!({ "setup": setup }),
            ClientMessage::RealtimeInput { realtime_input } => {
                serde_json::json!({ "realtimeInput": realtime_input })
            }
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Server -> client messages
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: serde_json::Value,
    },
    Other(serde_json::Value),
}

/// What the reader task should do with a parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    SetupComplete,
    Content(ServerEvent),
    GoAway,
    Ignored,
}

/// Parse one text frame from the server.
pub fn parse_server_message(text: &str) -> Result<ApiResponse> {
    let message = serde_json::from_str::<ServerMessage>(text)?;

    Ok(match message {
        ServerMessage::SetupComplete { .. } => ApiResponse::SetupComplete,
        ServerMessage::ServerContent { server_content } => {
            ApiResponse::Content(parse_server_content(&server_content))
        }
        ServerMessage::GoAway { go_away } => {
            warn!("Server sent goAway: {}", go_away);
            ApiResponse::GoAway
        }
        ServerMessage::ToolCall { .. } => {
            warn!("Ignoring tool call, no tools are configured for voice sessions");
            ApiResponse::Ignored
        }
        ServerMessage::Other(value) => {
            if let Some(error) = value.get("error") {
                return Err(GeminiError::Server(error.to_string()));
            }
            ApiResponse::Ignored
        }
    })
}

/// Extract audio, transcripts and turn flags from a `serverContent` payload.
pub fn parse_server_content(content: &serde_json::Value) -> ServerEvent {
    let mut event = ServerEvent {
        input_transcript: transcript_text(content, "inputTranscription"),
        output_transcript: transcript_text(content, "outputTranscription"),
        interrupted: flag(content, "interrupted"),
        turn_complete: flag(content, "turnComplete"),
        ..Default::default()
    };

    if let Some(model_turn) = content.get("modelTurn") {
        let parts: &[serde_json::Value] = match model_turn.get("parts").and_then(|p| p.as_array()) {
            Some(parts) => parts.as_slice(),
            None => {
                warn!("Received model turn without parts array: {:?}", model_turn);
                &[]
            }
        };

        for part in parts {
            let Some(inline_data) = part.get("inlineData") else {
                continue;
            };
            match inline_data.get("data").and_then(|d| d.as_str()) {
                Some(data) if !data.is_empty() => {
                    let mime_type = inline_data
                        .get("mimeType")
                        .and_then(|m| m.as_str())
                        .unwrap_or("audio/pcm;rate=24000");
                    event.audio.push(EncodedChunk {
                        data: data.to_string(),
                        mime_type: mime_type.to_string(),
                    });
                }
                Some(_) => {}
                None => warn!("Received inline data without data field: {:?}", inline_data),
            }
        }
    }

    event
}

fn transcript_text(content: &serde_json::Value, key: &str) -> Option<String> {
    content
        .get(key)?
        .get("text")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn flag(content: &serde_json::Value, key: &str) -> bool {
    content.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
