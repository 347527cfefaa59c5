//! Microphone capture loop
//!
//! Reads fixed-size frames on a dedicated thread, encodes each one and hands
//! it to a sink (normally the transport). Forwarding goes through a
//! [`CaptureGate`]; once the gate is closed no further chunk reaches the sink.

use crate::audio::{AudioError, AudioSource};
use crate::codec::{self, AudioFrame, EncodedChunk};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Receives every encoded frame while the gate is open.
pub type FrameSink = Box<dyn FnMut(EncodedChunk) + Send>;
/// Called once if the source fails while capture is still wanted.
pub type ErrorSink = Box<dyn FnOnce(AudioError) + Send>;

/// Open/closed switch shared by the capture thread and the session.
#[derive(Debug)]
pub struct CaptureGate {
    open: Mutex<bool>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self { open: Mutex::new(true) }
    }

    /// Run `deliver` only if the gate is open. Closing waits for an
    /// in-flight delivery to finish.
    fn forward(&self, deliver: impl FnOnce()) -> bool {
        let open = match self.open.lock() {
            Ok(open) => open,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*open {
            return false;
        }
        deliver();
        true
    }

    pub fn close(&self) {
        let mut open = match self.open.lock() {
            Ok(open) => open,
            Err(poisoned) => poisoned.into_inner(),
        };
        *open = false;
    }

    pub fn is_open(&self) -> bool {
        match self.open.lock() {
            Ok(open) => *open,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for CaptureGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Running capture thread for one session.
pub struct CapturePipeline {
    gate: Arc<CaptureGate>,
    frames_sent: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start reading `frame_size`-sample frames from `source`.
    pub fn start<S: AudioSource>(
        source: S,
        frame_size: usize,
        sink: FrameSink,
        on_error: ErrorSink,
    ) -> std::io::Result<Self> {
        let gate = Arc::new(CaptureGate::new());
        let frames_sent = Arc::new(AtomicU64::new(0));

        let (thread_gate, counter) = (gate.clone(), frames_sent.clone());
        let handle = std::thread::Builder::new()
            .name("mindmate-capture".to_string())
            .spawn(move || run_capture(source, frame_size, sink, on_error, thread_gate, counter))?;

        info!("🎤 Capture started ({} samples per frame)", frame_size);
        Ok(Self {
            gate,
            frames_sent,
            handle: Some(handle),
        })
    }

    pub fn gate(&self) -> Arc<CaptureGate> {
        self.gate.clone()
    }

    /// Stop forwarding. Returns once no frame can reach the sink anymore.
    pub fn stop(&self) {
        self.gate.close();
    }

    /// Wait for the capture thread to exit, releasing the microphone.
    pub fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        // The thread notices the closed gate after its current read.
        self.stop();
    }
}

fn run_capture<S: AudioSource>(
    mut source: S,
    frame_size: usize,
    mut sink: FrameSink,
    on_error: ErrorSink,
    gate: Arc<CaptureGate>,
    frames_sent: Arc<AtomicU64>,
) {
    let mut buffer = vec![0.0f32; frame_size];

    while gate.is_open() {
        match source.read_frame(&mut buffer) {
            Ok(()) => {
                let frame = AudioFrame::new(buffer.clone());
                let chunk = codec::encode(&frame);
                if !gate.forward(|| sink(chunk)) {
                    break;
                }
                let sent = frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                if sent % 100 == 0 {
                    debug!("🎤 {} frames sent", sent);
                }
            }
            Err(AudioError::EndOfStream) => {
                info!("Microphone stream ended");
                break;
            }
            Err(e) => {
                if gate.is_open() {
                    error!("Microphone read failed: {}", e);
                    on_error(e);
                }
                break;
            }
        }
    }

    drop(source);
    info!(
        "🎤 Capture stopped after {} frames, microphone released",
        frames_sent.load(Ordering::Relaxed)
    );
}
