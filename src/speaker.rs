//! PulseAudio output with a sample-accurate timeline
//!
//! A dedicated thread writes 20 ms blocks to a PulseAudio playback stream,
//! filling each block from the segments scheduled on the timeline and with
//! silence elsewhere. The device clock is the number of samples handed to
//! the server divided by the sample rate.

use crate::audio::AudioError;
use crate::codec::DecodedAudioBuffer;
use crate::playback::{OutputDevice, Speaker};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

const BLOCK_MS: u32 = 20;
/// Audio kept buffered in the server ahead of the clock.
const TARGET_LATENCY_MS: u32 = 100;

/// Speaker backed by a PulseAudio playback stream.
#[derive(Debug, Clone)]
pub struct PulseSpeaker {
    app_name: String,
    device_name: Option<String>,
    sample_rate: u32,
}

impl PulseSpeaker {
    pub fn new(app_name: &str, sample_rate: u32) -> Self {
        Self {
            app_name: app_name.to_string(),
            device_name: None,
            sample_rate,
        }
    }

    pub fn with_device(app_name: &str, device_name: &str, sample_rate: u32) -> Self {
        Self {
            app_name: app_name.to_string(),
            device_name: Some(device_name.to_string()),
            sample_rate,
        }
    }
}

impl Speaker for PulseSpeaker {
    type Device = PulseOutput;

    fn acquire(&self) -> Result<PulseOutput, AudioError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: self.sample_rate,
        };
        let bytes_per_ms = self.sample_rate * 4 / 1000;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: bytes_per_ms * TARGET_LATENCY_MS,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let output = PulseOutput::spawn(
            self.app_name.clone(),
            self.device_name.clone(),
            spec,
            attr,
        )?;

        info!(
            "Speaker connected ({}, {} Hz)",
            self.device_name.as_deref().unwrap_or("default sink"),
            self.sample_rate
        );
        Ok(output)
    }
}

#[derive(Debug)]
struct Segment {
    start: u64,
    samples: Vec<f32>,
}

impl Segment {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Debug, Default)]
struct Timeline {
    /// Samples already handed to the sound server
    written: u64,
    segments: VecDeque<Segment>,
}

impl Timeline {
    /// Render the next `block.len()` samples and advance the clock.
    fn render(&mut self, block: &mut [f32]) {
        block.fill(0.0);
        let from = self.written;
        let to = from + block.len() as u64;

        for segment in self.segments.iter() {
            if segment.start >= to {
                break;
            }
            let overlap_start = segment.start.max(from);
            let overlap_end = segment.end().min(to);
            if overlap_start >= overlap_end {
                continue;
            }
            let src = (overlap_start - segment.start) as usize;
            let dst = (overlap_start - from) as usize;
            let len = (overlap_end - overlap_start) as usize;
            let source = &segment.samples[src..src + len];
            for (out, sample) in block[dst..dst + len].iter_mut().zip(source) {
                *out += *sample;
            }
        }

        while self.segments.front().map(|s| s.end() <= to).unwrap_or(false) {
            self.segments.pop_front();
        }
        self.written = to;
    }

    /// Place `samples` no earlier than the clock. Returns the start used.
    fn insert(&mut self, start: u64, samples: Vec<f32>) -> u64 {
        let start = start.max(self.written);
        let position = self
            .segments
            .iter()
            .position(|s| s.start > start)
            .unwrap_or(self.segments.len());
        self.segments.insert(position, Segment { start, samples });
        start
    }
}

/// Open playback stream driven by its own writer thread.
pub struct PulseOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PulseOutput {
    fn spawn(
        app_name: String,
        device_name: Option<String>,
        spec: Spec,
        attr: BufferAttr,
    ) -> Result<Self, AudioError> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let (tl, stop, fail) = (timeline.clone(), shutdown.clone(), failed.clone());
        let sample_rate = spec.rate;
        let block_len = (sample_rate * BLOCK_MS / 1000) as usize;
        // The playback stream is opened and used only on the writer thread.
        let handle = std::thread::Builder::new()
            .name("mindmate-playback".to_string())
            .spawn(move || {
                let simple = match Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    device_name.as_deref(),
                    "assistant voice",
                    &spec,
                    None,
                    Some(&attr),
                ) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::ConnectionError(format!(
                            "failed to open speaker: {}",
                            e
                        ))));
                        return;
                    }
                };
                run_output(simple, tl, block_len, stop, fail);
            })
            .map_err(|e| {
                AudioError::StreamError(format!("failed to spawn playback thread: {}", e))
            })?;

        let mut output = Self {
            timeline,
            sample_rate,
            shutdown,
            failed,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(output),
            Ok(Err(e)) => {
                output.close();
                Err(e)
            }
            Err(_) => {
                output.close();
                Err(AudioError::ConnectionError("playback thread exited".to_string()))
            }
        }
    }

    fn with_timeline<R>(&self, f: impl FnOnce(&mut Timeline) -> R) -> R {
        let mut timeline = match self.timeline.lock() {
            Ok(timeline) => timeline,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut timeline)
    }
}

impl OutputDevice for PulseOutput {
    fn now(&self) -> f64 {
        self.with_timeline(|t| t.written) as f64 / self.sample_rate as f64
    }

    fn play_at(&mut self, start_time: f64, buffer: DecodedAudioBuffer) -> Result<f64, AudioError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(AudioError::StreamError("playback stream failed".to_string()));
        }
        if self.handle.is_none() {
            return Err(AudioError::StreamError("playback stream closed".to_string()));
        }
        let start = (start_time.max(0.0) * self.sample_rate as f64).round() as u64;
        // The writer may have rendered past `start` since the caller read the clock
        let placed = self.with_timeline(|t| t.insert(start, buffer.into_samples()));
        Ok(placed as f64 / self.sample_rate as f64)
    }

    fn clear(&mut self) {
        self.with_timeline(|t| t.segments.clear());
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Playback thread panicked");
            }
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_output(
    simple: Simple,
    timeline: Arc<Mutex<Timeline>>,
    block_len: usize,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
) {
    let mut block = vec![0.0f32; block_len];
    let mut bytes = Vec::with_capacity(block_len * 4);

    while !shutdown.load(Ordering::Relaxed) {
        {
            let mut timeline = match timeline.lock() {
                Ok(timeline) => timeline,
                Err(poisoned) => poisoned.into_inner(),
            };
            timeline.render(&mut block);
        }

        bytes.clear();
        for sample in &block {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        // Blocks once the server buffer holds TARGET_LATENCY_MS of audio.
        if let Err(e) = simple.write(&bytes) {
            error!("Failed to write audio: {}", e);
            failed.store(true, Ordering::Relaxed);
            break;
        }
    }

    // Queued audio is discarded rather than drained.
    let _ = simple.flush();
    debug!("Playback thread exiting");
}
