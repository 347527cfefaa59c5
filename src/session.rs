//! Live voice session controller
//!
//! Drives one conversation at a time through
//! `Idle → Connecting → Active → Ending → Closed`, or `Error` on failure.
//! Starting acquires the speaker, the microphone and the transport; stopping
//! releases them in reverse dependency order. Inbound traffic is handled on a
//! single task that decodes and schedules audio and relays captions.

use crate::audio::{AudioError, Microphone};
use crate::capture::{CaptureGate, CapturePipeline, ErrorSink, FrameSink};
use crate::codec::{self, FRAME_SAMPLES, OUTPUT_SAMPLE_RATE};
use crate::events::{Connector, ServerEvent, Transport, TransportEvent};
use crate::gemini::GeminiError;
use crate::playback::{OutputDevice, PlaybackScheduler, Speaker};
use crate::transcript::{Direction, TranscriptionRelay, TranscriptionState};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const STATUS_READY: &str = "Ready to start session";
pub const STATUS_INITIALIZING: &str = "Initializing audio...";
pub const STATUS_CONNECTING: &str = "Connecting to Gemini Live...";
pub const STATUS_ACTIVE: &str = "Session Active - I'm listening.";
pub const STATUS_FAILED: &str = "Failed to connect microphone or API.";
pub const STATUS_CONNECTION_LOST: &str = "Connection lost. Session Ended.";
pub const STATUS_ENDING: &str = "Ending session...";
pub const STATUS_ENDED: &str = "Session Ended";

/// Lifecycle of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Ending,
    Closed,
    Error,
}

impl SessionState {
    /// Resources may be held in this state.
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active | SessionState::Ending)
    }
}

/// State plus the line shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub message: String,
}

/// Errors returned by [`LiveSession::start`]
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("audio device unavailable: {0}")]
    Acquisition(#[from] AudioError),

    #[error("transport failure: {0}")]
    Transport(#[from] GeminiError),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("failed to start capture thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("session already running")]
    AlreadyRunning,
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Samples per captured frame
    pub frame_size: usize,
    /// Rate of the PCM the agent sends back
    pub output_sample_rate: u32,
    /// How long to wait for the transport to report open
    pub open_timeout: Duration,
    /// How long teardown waits for the inbound task
    pub teardown_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SAMPLES,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            open_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(2),
            event_buffer: 64,
        }
    }
}

#[derive(Debug)]
struct StatusBoard {
    tx: watch::Sender<SessionStatus>,
}

impl StatusBoard {
    fn new() -> Self {
        let (tx, _) = watch::channel(SessionStatus {
            state: SessionState::Idle,
            message: STATUS_READY.to_string(),
        });
        Self { tx }
    }

    fn state(&self) -> SessionState {
        self.tx.borrow().state
    }

    fn set(&self, state: SessionState, message: &str) {
        info!("Session {:?}: {}", state, message);
        self.tx.send_replace(SessionStatus {
            state,
            message: message.to_string(),
        });
    }

    /// Move from `from` to `to` atomically. Returns false if the state had
    /// already moved on.
    fn transition(&self, from: &[SessionState], to: SessionState, message: &str) -> bool {
        let moved = self.tx.send_if_modified(|status| {
            if !from.contains(&status.state) {
                return false;
            }
            *status = SessionStatus {
                state: to,
                message: message.to_string(),
            };
            true
        });
        if moved {
            info!("Session {:?}: {}", to, message);
        }
        moved
    }
}

type SharedScheduler<D> = Arc<Mutex<PlaybackScheduler<D>>>;

fn lock<D: OutputDevice>(
    scheduler: &Mutex<PlaybackScheduler<D>>,
) -> MutexGuard<'_, PlaybackScheduler<D>> {
    match scheduler.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Everything a running session holds.
struct Live<T: Transport, D: OutputDevice> {
    transport: Arc<T>,
    scheduler: SharedScheduler<D>,
    capture: Option<CapturePipeline>,
    inbound: Option<JoinHandle<()>>,
}

/// Controller for live voice sessions.
///
/// Each successful [`start`](Self::start) builds a fresh transport, capture
/// pipeline and playback scheduler; nothing carries over between sessions.
pub struct LiveSession<C, M, S>
where
    C: Connector,
    M: Microphone,
    S: Speaker,
{
    connector: C,
    microphone: Arc<M>,
    speaker: Arc<S>,
    config: SessionConfig,
    status: Arc<StatusBoard>,
    relay: TranscriptionRelay,
    live: Option<Live<C::Transport, S::Device>>,
    sessions_started: u64,
}

impl<C, M, S> LiveSession<C, M, S>
where
    C: Connector,
    M: Microphone,
    S: Speaker,
{
    pub fn new(connector: C, microphone: M, speaker: S, config: SessionConfig) -> Self {
        Self {
            connector,
            microphone: Arc::new(microphone),
            speaker: Arc::new(speaker),
            config,
            status: Arc::new(StatusBoard::new()),
            relay: TranscriptionRelay::new(),
            live: None,
            sessions_started: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.tx.subscribe()
    }

    pub fn transcript(&self) -> TranscriptionState {
        self.relay.current()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<TranscriptionState> {
        self.relay.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Acquire devices, connect, and begin streaming.
    ///
    /// On failure the session is left in `Error` with nothing held.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state().is_running() {
            return Err(SessionError::AlreadyRunning);
        }

        // Leftovers from a session that ended in Error
        self.release().await;

        self.sessions_started += 1;
        info!("🎙️ Starting voice session #{}", self.sessions_started);
        self.relay.clear();
        self.status.set(SessionState::Connecting, STATUS_INITIALIZING);

        match self.open().await {
            Ok(live) => {
                self.live = Some(live);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start session: {}", e);
                self.status.set(SessionState::Error, STATUS_FAILED);
                Err(e)
            }
        }
    }

    async fn open(&mut self) -> Result<Live<C::Transport, S::Device>, SessionError> {
        let speaker = self.speaker.clone();
        let device = run_blocking(move || speaker.acquire()).await?;
        let scheduler = Arc::new(Mutex::new(PlaybackScheduler::new(device)));

        let microphone = self.microphone.clone();
        let source = match run_blocking(move || microphone.acquire()).await {
            Ok(source) => source,
            Err(e) => {
                lock(&scheduler).stop();
                return Err(e.into());
            }
        };

        self.status.set(SessionState::Connecting, STATUS_CONNECTING);
        let (events_tx, mut events) = mpsc::channel(self.config.event_buffer);
        let transport = match self.connector.connect(events_tx).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                lock(&scheduler).stop();
                return Err(e.into());
            }
        };

        let opened = tokio::time::timeout(self.config.open_timeout, wait_for_open(&mut events))
            .await
            .unwrap_or(Err(SessionError::Transport(GeminiError::Timeout)));
        if let Err(e) = opened {
            transport.close();
            lock(&scheduler).stop();
            return Err(e);
        }

        self.status.set(SessionState::Active, STATUS_ACTIVE);

        let (failed_tx, failed_rx) = oneshot::channel();
        let sink_transport = transport.clone();
        let sink: FrameSink = Box::new(move |chunk| sink_transport.send(chunk));
        let on_error: ErrorSink = Box::new(move |e| {
            let _ = failed_tx.send(e);
        });

        let capture = match CapturePipeline::start(source, self.config.frame_size, sink, on_error) {
            Ok(capture) => capture,
            Err(e) => {
                transport.close();
                lock(&scheduler).stop();
                return Err(e.into());
            }
        };

        let inbound = Inbound {
            transport: transport.clone(),
            scheduler: scheduler.clone(),
            gate: capture.gate(),
            relay: self.relay.clone(),
            status: self.status.clone(),
            output_sample_rate: self.config.output_sample_rate,
        };
        let inbound = tokio::spawn(inbound.run(events, failed_rx));

        Ok(Live {
            transport,
            scheduler,
            capture: Some(capture),
            inbound: Some(inbound),
        })
    }

    /// End the session. Does nothing to the state when nothing is running.
    pub async fn stop(&mut self) {
        let ending = self.status.transition(
            &[SessionState::Connecting, SessionState::Active],
            SessionState::Ending,
            STATUS_ENDING,
        );

        self.release().await;

        if ending {
            self.status.set(SessionState::Closed, STATUS_ENDED);
        }
    }

    /// Tear down whatever the last session still holds.
    async fn release(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };

        if let Some(capture) = live.capture.as_ref() {
            capture.stop();
        }
        if let Some(mut capture) = live.capture.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || capture.join()).await {
                error!("Failed to join capture thread: {}", e);
            }
        }

        lock(&live.scheduler).stop();
        live.transport.close();

        if let Some(mut inbound) = live.inbound.take() {
            if tokio::time::timeout(self.config.teardown_timeout, &mut inbound).await.is_err() {
                warn!("Inbound task did not finish in time, aborting it");
                inbound.abort();
            }
        }
        debug!("Session resources released");
    }
}

impl<C, M, S> Drop for LiveSession<C, M, S>
where
    C: Connector,
    M: Microphone,
    S: Speaker,
{
    fn drop(&mut self) {
        if let Some(mut live) = self.live.take() {
            if let Some(capture) = live.capture.as_ref() {
                capture.stop();
            }
            lock(&live.scheduler).stop();
            live.transport.close();
            if let Some(inbound) = live.inbound.take() {
                inbound.abort();
            }
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, AudioError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AudioError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(AudioError::ConnectionError(format!("device task failed: {}", e))),
    }
}

async fn wait_for_open(events: &mut mpsc::Receiver<TransportEvent>) -> Result<(), SessionError> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Open) => return Ok(()),
            Some(TransportEvent::Message(_)) => {
                debug!("Ignoring content before the session opened")
            }
            Some(TransportEvent::Error(message)) => return Err(SessionError::Disconnected(message)),
            Some(TransportEvent::Closed) => return Err(GeminiError::ConnectionClosed.into()),
            None => return Err(GeminiError::ChannelClosed.into()),
        }
    }
}

/// State owned by the inbound task.
struct Inbound<T: Transport, D: OutputDevice> {
    transport: Arc<T>,
    scheduler: SharedScheduler<D>,
    gate: Arc<CaptureGate>,
    relay: TranscriptionRelay,
    status: Arc<StatusBoard>,
    output_sample_rate: u32,
}

impl<T: Transport, D: OutputDevice> Inbound<T, D> {
    async fn run(
        self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut capture_failed: oneshot::Receiver<AudioError>,
    ) {
        info!("Inbound event task started");
        let mut capture_done = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Message(event)) => self.handle(event),
                    Some(TransportEvent::Open) => debug!("Ignoring repeated open notification"),
                    Some(TransportEvent::Error(message)) => {
                        self.fail(&format!("transport error: {}", message));
                        break;
                    }
                    Some(TransportEvent::Closed) | None => {
                        self.fail("connection closed");
                        break;
                    }
                },
                result = &mut capture_failed, if !capture_done => {
                    capture_done = true;
                    if let Ok(e) = result {
                        self.fail(&format!("microphone failed: {}", e));
                        break;
                    }
                }
            }
        }

        info!("Inbound event task finished");
    }

    fn handle(&self, event: ServerEvent) {
        if event.interrupted {
            info!("🔇 Agent interrupted, flushing playback");
            lock(&self.scheduler).flush();
        }

        for chunk in &event.audio {
            match codec::decode(chunk, self.output_sample_rate) {
                Ok(buffer) => {
                    if let Some(slot) = lock(&self.scheduler).schedule(buffer) {
                        debug!("🔊 Scheduled {:.3}s - {:.3}s", slot.start, slot.end);
                    }
                }
                Err(e) => warn!("Dropping malformed audio chunk: {}", e),
            }
        }

        if let Some(text) = event.input_transcript {
            self.relay.on_fragment(Direction::In, text);
        }
        if let Some(text) = event.output_transcript {
            self.relay.on_fragment(Direction::Out, text);
        }
        if event.turn_complete {
            debug!("Agent turn complete");
        }
    }

    /// Move a live session to Error and release what this task can reach.
    /// Does nothing if the session is already ending.
    fn fail(&self, reason: &str) {
        let failed = self.status.transition(
            &[SessionState::Connecting, SessionState::Active],
            SessionState::Error,
            STATUS_CONNECTION_LOST,
        );
        if !failed {
            debug!("Ignoring {} during teardown", reason);
            return;
        }

        error!("Session failed: {}", reason);
        self.gate.close();
        lock(&self.scheduler).stop();
        self.transport.close();
    }
}
