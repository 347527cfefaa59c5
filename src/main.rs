//! MindMate voice - terminal front end
//!
//! Starts a live voice session with the default microphone and speaker,
//! prints status changes and captions, and ends the session on Ctrl-C.

use anyhow::{Context, Result};
use mindmate_voice::codec::INPUT_SAMPLE_RATE;
use mindmate_voice::gemini::DEFAULT_VOICE;
use mindmate_voice::{
    GeminiClientConfig, GeminiConnector, LiveSession, PulseMicrophone, PulseSpeaker, SessionConfig,
    SessionState,
};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "MindMate";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting MindMate voice session");

    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?;
    let voice = std::env::var("MINDMATE_VOICE").unwrap_or_else(|_| DEFAULT_VOICE.to_string());
    let mic_device = std::env::var("MINDMATE_MIC").ok();
    let speaker_device = std::env::var("MINDMATE_SPEAKER").ok();

    let session_config = SessionConfig::default();

    let gemini_config = GeminiClientConfig {
        voice_name: Some(voice),
        ..Default::default()
    };
    let connector = GeminiConnector::from_api_key(&api_key, Some(gemini_config));

    let microphone = match mic_device.as_deref() {
        Some(device) => PulseMicrophone::with_device(APP_NAME, device, INPUT_SAMPLE_RATE),
        None => PulseMicrophone::new(APP_NAME, INPUT_SAMPLE_RATE),
    };
    let speaker = match speaker_device.as_deref() {
        Some(device) => {
            PulseSpeaker::with_device(APP_NAME, device, session_config.output_sample_rate)
        }
        None => PulseSpeaker::new(APP_NAME, session_config.output_sample_rate),
    };

    let mut session = LiveSession::new(connector, microphone, speaker, session_config);
    let mut status = session.subscribe_status();
    let mut captions = session.subscribe_transcript();

    println!("{}", status.borrow_and_update().message);

    // Status and caption printer
    let printer = tokio::spawn(async move {
        let mut last_in = String::new();
        let mut last_out = String::new();
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!("[{}]", status.borrow_and_update().message);
                }
                changed = captions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = captions.borrow_and_update().clone();
                    if !state.input_text.is_empty() && state.input_text != last_in {
                        println!("You: {}", state.input_text);
                        last_in = state.input_text;
                    }
                    if !state.output_text.is_empty() && state.output_text != last_out {
                        println!("MindMate: {}", state.output_text);
                        last_out = state.output_text;
                    }
                }
            }
        }
    });

    if let Err(e) = session.start().await {
        error!("Could not start session: {}", e);
        printer.abort();
        return Err(e).context("failed to start voice session");
    }

    // Run until Ctrl-C or until the session fails on its own
    let mut watch_state = session.subscribe_status();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, ending session");
        }
        _ = async {
            loop {
                if watch_state.borrow_and_update().state == SessionState::Error {
                    break;
                }
                if watch_state.changed().await.is_err() {
                    break;
                }
            }
        } => {
            error!("Session ended unexpectedly");
        }
    }

    session.stop().await;
    drop(session);
    // Let the printer show the final status line
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    info!("MindMate voice session finished");
    Ok(())
}
