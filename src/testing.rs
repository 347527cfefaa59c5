//! In-memory devices and transport for unit tests

use crate::audio::{AudioError, AudioSource, Microphone};
use crate::codec::{DecodedAudioBuffer, EncodedChunk};
use crate::events::{Connector, Transport, TransportEvent};
use crate::gemini::{GeminiError, Result};
use crate::playback::{OutputDevice, Speaker};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct OutputState {
    now: f64,
    /// Clock advance applied when a buffer is placed
    drift: f64,
    starts: Vec<f64>,
    closed: bool,
    close_count: usize,
    clear_count: usize,
}

/// Output device with a hand-driven clock. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<OutputState>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_now(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    pub fn set_drift(&self, drift: f64) {
        self.state.lock().unwrap().drift = drift;
    }

    pub fn starts(&self) -> Vec<f64> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn played(&self) -> usize {
        self.state.lock().unwrap().starts.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_count
    }

    pub fn clear_count(&self) -> usize {
        self.state.lock().unwrap().clear_count
    }
}

impl OutputDevice for ManualOutput {
    fn now(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn play_at(
        &mut self,
        start_time: f64,
        _buffer: DecodedAudioBuffer,
    ) -> std::result::Result<f64, AudioError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(AudioError::StreamError("closed".to_string()));
        }
        state.now += state.drift;
        let start = start_time.max(state.now);
        state.starts.push(start);
        Ok(start)
    }

    fn clear(&mut self) {
        self.state.lock().unwrap().clear_count += 1;
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            state.close_count += 1;
        }
    }
}

/// Hands out fresh [`ManualOutput`]s and remembers each one.
#[derive(Debug, Clone, Default)]
pub struct ManualSpeaker {
    outputs: Arc<Mutex<Vec<ManualOutput>>>,
    unavailable: bool,
}

impl ManualSpeaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn outputs(&self) -> Vec<ManualOutput> {
        self.outputs.lock().unwrap().clone()
    }

    pub fn last(&self) -> ManualOutput {
        self.outputs.lock().unwrap().last().cloned().expect("no output acquired")
    }
}

impl Speaker for ManualSpeaker {
    type Device = ManualOutput;

    fn acquire(&self) -> std::result::Result<ManualOutput, AudioError> {
        if self.unavailable {
            return Err(AudioError::NoDevicesFound);
        }
        let output = ManualOutput::new();
        self.outputs.lock().unwrap().push(output.clone());
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceMode {
    /// A fixed number of frames, then end of stream
    Frames(usize),
    /// Frames forever, one per interval
    Live(Duration),
    /// Some frames, then a read error
    FailAfter(usize),
}

/// Microphone producing synthetic frames.
#[derive(Debug, Clone)]
pub struct FakeMicrophone {
    mode: SourceMode,
    value: f32,
    denied: bool,
    active: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    fn with_mode(mode: SourceMode) -> Self {
        Self {
            mode,
            value: 0.0,
            denied: false,
            active: Arc::new(AtomicUsize::new(0)),
            acquired: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_frames(frames: usize, value: f32) -> Self {
        Self {
            value,
            ..Self::with_mode(SourceMode::Frames(frames))
        }
    }

    pub fn live(interval: Duration) -> Self {
        Self::with_mode(SourceMode::Live(interval))
    }

    pub fn failing_after(frames: usize) -> Self {
        Self::with_mode(SourceMode::FailAfter(frames))
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::with_mode(SourceMode::Frames(0))
        }
    }

    /// Sources acquired and not yet dropped.
    pub fn active_sources(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn times_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl Microphone for FakeMicrophone {
    type Source = FakeSource;

    fn acquire(&self) -> std::result::Result<FakeSource, AudioError> {
        if self.denied {
            return Err(AudioError::ConnectionError("permission denied".to_string()));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSource {
            mode: self.mode,
            value: self.value,
            produced: 0,
            active: self.active.clone(),
        })
    }
}

pub struct FakeSource {
    mode: SourceMode,
    value: f32,
    produced: usize,
    active: Arc<AtomicUsize>,
}

impl AudioSource for FakeSource {
    fn read_frame(&mut self, frame: &mut [f32]) -> std::result::Result<(), AudioError> {
        match self.mode {
            SourceMode::Frames(n) if self.produced >= n => return Err(AudioError::EndOfStream),
            SourceMode::FailAfter(n) if self.produced >= n => {
                return Err(AudioError::StreamError("device unplugged".to_string()))
            }
            SourceMode::Live(interval) => std::thread::sleep(interval),
            _ => {}
        }
        frame.fill(self.value);
        self.produced += 1;
        Ok(())
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct TransportLog {
    sent: Vec<EncodedChunk>,
    close_count: usize,
}

/// Records what the session sends. Closing reports `Closed` on the event channel.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    log: Arc<Mutex<TransportLog>>,
    events: mpsc::Sender<TransportEvent>,
}

impl Transport for FakeTransport {
    fn send(&self, chunk: EncodedChunk) {
        self.log.lock().unwrap().sent.push(chunk);
    }

    fn close(&self) {
        let mut log = self.log.lock().unwrap();
        log.close_count += 1;
        if log.close_count == 1 {
            let _ = self.events.try_send(TransportEvent::Closed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    /// Report Open right away
    Open,
    /// Connect but never acknowledge setup
    Silent,
    /// Fail the connect call
    Refuse,
}

#[derive(Debug, Default)]
struct ConnectorState {
    events: Option<mpsc::Sender<TransportEvent>>,
    logs: Vec<Arc<Mutex<TransportLog>>>,
}

/// Connector handing out [`FakeTransport`]s; tests inject inbound events.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    mode: ConnectMode,
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    fn with_mode(mode: ConnectMode) -> Self {
        Self {
            mode,
            state: Arc::new(Mutex::new(ConnectorState::default())),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(ConnectMode::Open)
    }

    pub fn silent() -> Self {
        Self::with_mode(ConnectMode::Silent)
    }

    pub fn refusing() -> Self {
        Self::with_mode(ConnectMode::Refuse)
    }

    /// Deliver an event on the most recent connection.
    pub async fn inject(&self, event: TransportEvent) {
        let events = self.state.lock().unwrap().events.clone().expect("not connected");
        events.send(event).await.expect("session stopped listening");
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().logs.len()
    }

    /// Chunks sent on the most recent connection.
    pub fn sent(&self) -> usize {
        self.last_log().lock().unwrap().sent.len()
    }

    pub fn sent_chunks(&self) -> Vec<EncodedChunk> {
        self.last_log().lock().unwrap().sent.clone()
    }

    pub fn close_count(&self) -> usize {
        self.last_log().lock().unwrap().close_count
    }

    fn last_log(&self) -> Arc<Mutex<TransportLog>> {
        self.state.lock().unwrap().logs.last().cloned().expect("not connected")
    }
}

impl Connector for FakeConnector {
    type Transport = FakeTransport;

    fn connect(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> impl Future<Output = Result<FakeTransport>> + Send {
        let mode = self.mode;
        let state = self.state.clone();
        async move {
            if mode == ConnectMode::Refuse {
                return Err(GeminiError::Server("connection refused".to_string()));
            }
            let log = Arc::new(Mutex::new(TransportLog::default()));
            {
                let mut state = state.lock().unwrap();
                state.events = Some(events.clone());
                state.logs.push(log.clone());
            }
            if mode == ConnectMode::Open {
                let _ = events.send(TransportEvent::Open).await;
            }
            Ok(FakeTransport { log, events })
        }
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
