//! Microphone access
//!
//! Captures mono f32 audio at 16 kHz from PulseAudio. The session only sees
//! the [`Microphone`] and [`AudioSource`] traits so capture can be driven by
//! an in-memory source in tests.

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::Proplist;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Length of each block read from the sound server
const RECORD_BLOCK_MS: u32 = 32;
const RECORD_QUEUE_BLOCKS: usize = 64;

/// Custom error for audio device operations
#[derive(Debug)]
pub enum AudioError {
    /// No audio devices were found
    NoDevicesFound,
    /// Failed to create PulseAudio context
    PulseContextError(String),
    /// Failed to connect to PulseAudio or open a stream
    ConnectionError(String),
    /// A read or write on an open stream failed
    StreamError(String),
    /// The source has no more audio
    EndOfStream,
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::NoDevicesFound => write!(f, "No audio devices found"),
            AudioError::PulseContextError(msg) => write!(f, "PulseAudio context error: {}", msg),
            AudioError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            AudioError::StreamError(msg) => write!(f, "Stream error: {}", msg),
            AudioError::EndOfStream => write!(f, "End of audio stream"),
        }
    }
}

impl Error for AudioError {}

/// A live stream of microphone samples.
pub trait AudioSource: Send + 'static {
    /// Fill `frame` with the next block of samples, blocking until available.
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError>;
}

/// Grants access to an input device.
pub trait Microphone: Send + Sync + 'static {
    type Source: AudioSource;

    /// Open the device. Fails when it is missing or access is denied.
    fn acquire(&self) -> Result<Self::Source, AudioError>;
}

/// Microphone backed by a PulseAudio record stream.
#[derive(Debug, Clone)]
pub struct PulseMicrophone {
    app_name: String,
    device_name: Option<String>,
    sample_rate: u32,
}

impl PulseMicrophone {
    /// Use the default input device.
    pub fn new(app_name: &str, sample_rate: u32) -> Self {
        Self {
            app_name: app_name.to_string(),
            device_name: None,
            sample_rate,
        }
    }

    /// Use a specific PulseAudio source.
    pub fn with_device(app_name: &str, device_name: &str, sample_rate: u32) -> Self {
        Self {
            app_name: app_name.to_string(),
            device_name: Some(device_name.to_string()),
            sample_rate,
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

impl Microphone for PulseMicrophone {
    type Source = PulseSource;

    fn acquire(&self) -> Result<PulseSource, AudioError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: self.sample_rate,
        };
        if !spec.is_valid() {
            return Err(AudioError::ConnectionError(format!(
                "invalid capture spec at {} Hz",
                self.sample_rate
            )));
        }

        let (tx, rx) = std_mpsc::sync_channel(RECORD_QUEUE_BLOCKS);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (app_name, device_name, stop) =
            (self.app_name.clone(), self.device_name.clone(), shutdown.clone());
        let block_samples = (self.sample_rate * RECORD_BLOCK_MS / 1000) as usize;
        // The record stream lives entirely on its own thread.
        let handle = std::thread::Builder::new()
            .name("mindmate-record".to_string())
            .spawn(move || {
                let simple = match Simple::new(
                    None,
                    &app_name,
                    Direction::Record,
                    device_name.as_deref(),
                    "microphone",
                    &spec,
                    None,
                    None,
                ) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::ConnectionError(format!(
                            "failed to open microphone: {}",
                            e
                        ))));
                        return;
                    }
                };
                run_record(simple, block_samples, tx, stop);
            })
            .map_err(|e| AudioError::StreamError(format!("failed to spawn record thread: {}", e)))?;

        let mut source = PulseSource {
            rx: Some(rx),
            pending: VecDeque::new(),
            shutdown,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                source.release();
                return Err(AudioError::ConnectionError("record thread exited".to_string()));
            }
        }

        info!(
            "Microphone capture connected ({}, {} Hz)",
            self.device_name.as_deref().unwrap_or("default source"),
            self.sample_rate
        );
        Ok(source)
    }
}

type RecordBlock = Result<Vec<f32>, AudioError>;

/// Open PulseAudio record stream producing f32 samples.
///
/// A reader thread owns the stream and hands over blocks; dropping the
/// source stops the thread and closes the stream.
pub struct PulseSource {
    rx: Option<std_mpsc::Receiver<RecordBlock>>,
    pending: VecDeque<f32>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PulseSource {
    fn release(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Unblocks a reader waiting on a full queue
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Record thread panicked");
            }
        }
    }
}

impl AudioSource for PulseSource {
    fn read_frame(&mut self, frame: &mut [f32]) -> Result<(), AudioError> {
        let rx = self.rx.as_ref().ok_or(AudioError::EndOfStream)?;
        fill_frame(&mut self.pending, frame, || {
            rx.recv().unwrap_or(Err(AudioError::EndOfStream))
        })
    }
}

/// Re-block recorded audio into `frame`, pulling blocks until enough is
/// buffered. Leftover samples stay in `pending` for the next frame.
fn fill_frame(
    pending: &mut VecDeque<f32>,
    frame: &mut [f32],
    mut next_block: impl FnMut() -> Result<Vec<f32>, AudioError>,
) -> Result<(), AudioError> {
    let len = frame.len();
    while pending.len() < len {
        pending.extend(next_block()?);
    }
    for (sample, value) in frame.iter_mut().zip(pending.drain(..len)) {
        *sample = value;
    }
    Ok(())
}

impl Drop for PulseSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_record(
    simple: Simple,
    block_samples: usize,
    tx: std_mpsc::SyncSender<RecordBlock>,
    shutdown: Arc<AtomicBool>,
) {
    let mut bytes = vec![0u8; block_samples * 4];

    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut bytes) {
            let _ = tx.send(Err(AudioError::StreamError(format!("failed to read audio: {}", e))));
            break;
        }
        let block = bytes
            .chunks_exact(4)
            .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect();
        if tx.send(Ok(block)).is_err() {
            break;
        }
    }
    debug!("Record thread exiting");
}

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// PulseAudio source or sink name
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of system playback rather than a real microphone
    pub is_monitor: bool,
}

/// Which side of the sound server to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Microphones (monitor sources excluded)
    Input,
    /// Speakers and headphones
    Output,
}

/// List PulseAudio devices of the given kind.
pub fn list_devices(kind: DeviceKind) -> Result<Vec<AudioDevice>, AudioError> {
    let mut proplist = Proplist::new()
        .ok_or_else(|| AudioError::PulseContextError("Failed to create proplist".to_string()))?;
    proplist
        .set_str(
            libpulse_binding::proplist::properties::APPLICATION_NAME,
            "mindmate-device-lister",
        )
        .map_err(|_| AudioError::PulseContextError("Failed to set application name".to_string()))?;

    let mut mainloop = Mainloop::new()
        .ok_or_else(|| AudioError::PulseContextError("Failed to create mainloop".to_string()))?;
    let mut context = Context::new_with_proplist(&mainloop, "mindmate-context", &proplist)
        .ok_or_else(|| AudioError::PulseContextError("Failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| AudioError::ConnectionError(format!("{:?}", e)))?;

    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(AudioError::ConnectionError("Connection failed".to_string()));
            }
            _ => {}
        }
    }

    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(false));
    let introspector = context.introspect();

    let (devices_cb, done_cb) = (devices.clone(), done.clone());
    match kind {
        DeviceKind::Input => {
            let _op = introspector.get_source_info_list(move |result| match result {
                ListResult::Item(info) => {
                    let is_monitor = info.monitor_of_sink.is_some();
                    if let (false, Some(name), Some(description)) =
                        (is_monitor, info.name.as_ref(), info.description.as_ref())
                    {
                        push_device(&devices_cb, AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: info.sample_spec.rate,
                            channels: info.sample_spec.channels,
                            is_monitor,
                        });
                    }
                }
                ListResult::End | ListResult::Error => mark_done(&done_cb),
            });
            wait_until_done(&mut mainloop, &done)?;
        }
        DeviceKind::Output => {
            let _op = introspector.get_sink_info_list(move |result| match result {
                ListResult::Item(info) => {
                    let (name, description) = (info.name.as_ref(), info.description.as_ref());
                    if let (Some(name), Some(description)) = (name, description) {
                        push_device(&devices_cb, AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: info.sample_spec.rate,
                            channels: info.sample_spec.channels,
                            is_monitor: false,
                        });
                    }
                }
                ListResult::End | ListResult::Error => mark_done(&done_cb),
            });
            wait_until_done(&mut mainloop, &done)?;
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let list = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| AudioError::PulseContextError("Failed to access devices list".to_string()))?;
    if list.is_empty() {
        return Err(AudioError::NoDevicesFound);
    }
    Ok(list)
}

fn iterate(mainloop: &mut Mainloop) -> Result<(), AudioError> {
    match mainloop.iterate(true) {
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            error!("PulseAudio mainloop iterate failed");
            Err(AudioError::PulseContextError("Mainloop iterate failed".to_string()))
        }
        IterateResult::Success(_) => Ok(()),
    }
}

fn wait_until_done(mainloop: &mut Mainloop, done: &Arc<Mutex<bool>>) -> Result<(), AudioError> {
    loop {
        iterate(mainloop)?;
        if done.lock().map(|d| *d).unwrap_or(true) {
            return Ok(());
        }
    }
}

fn push_device(devices: &Arc<Mutex<Vec<AudioDevice>>>, device: AudioDevice) {
    if let Ok(mut list) = devices.lock() {
        list.push(device);
    }
}

fn mark_done(done: &Arc<Mutex<bool>>) {
    if let Ok(mut done) = done.lock() {
        *done = true;
    }
}
