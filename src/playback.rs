//! Gapless playback of streamed speech
//!
//! [`PlaybackScheduler`] places each decoded buffer on the output device's
//! timeline directly after the previous one. Buffers that arrive faster than
//! real time queue back-to-back; a late buffer starts "now" and the gap is
//! simply heard.

use crate::audio::AudioError;
use crate::codec::DecodedAudioBuffer;
use tracing::{debug, error, info};

/// A speaker that accepts buffers with an explicit start time.
pub trait OutputDevice: Send + 'static {
    /// Monotonic device clock in seconds.
    fn now(&self) -> f64;

    /// Play `buffer` starting at `start_time` on the device clock.
    ///
    /// Returns the start actually used, which is later than `start_time` if
    /// the clock passed it in the meantime.
    fn play_at(&mut self, start_time: f64, buffer: DecodedAudioBuffer) -> Result<f64, AudioError>;

    /// Discard everything queued but not yet played.
    fn clear(&mut self);

    /// Stop output and release the device. Must be idempotent.
    fn close(&mut self);
}

/// Grants access to an output device.
pub trait Speaker: Send + Sync + 'static {
    type Device: OutputDevice;

    fn acquire(&self) -> Result<Self::Device, AudioError>;
}

/// Interval a buffer was placed at, in device seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub start: f64,
    pub end: f64,
}

/// Owns the output device and the playback cursor for one session.
pub struct PlaybackScheduler<D: OutputDevice> {
    device: Option<D>,
    /// Earliest time the next buffer may start
    next_start_time: f64,
    scheduled: u64,
}

impl<D: OutputDevice> PlaybackScheduler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device: Some(device),
            next_start_time: 0.0,
            scheduled: 0,
        }
    }

    /// Queue a buffer right after the previous one, or now if playback starved.
    ///
    /// Returns `None` when the scheduler is stopped or the device refused it.
    pub fn schedule(&mut self, buffer: DecodedAudioBuffer) -> Option<ScheduledPlayback> {
        let Some(device) = self.device.as_mut() else {
            debug!("Dropping {:.3}s of audio, playback is stopped", buffer.duration());
            return None;
        };

        let requested = self.next_start_time.max(device.now());
        let duration = buffer.duration();

        let start = match device.play_at(requested, buffer) {
            Ok(start) => start,
            Err(e) => {
                error!("Output device rejected buffer: {}", e);
                return None;
            }
        };

        self.next_start_time = start + duration;
        self.scheduled += 1;
        Some(ScheduledPlayback {
            start,
            end: self.next_start_time,
        })
    }

    /// Drop queued audio, e.g. when the agent was interrupted mid-sentence.
    pub fn flush(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.clear();
            self.next_start_time = device.now();
            debug!("Playback flushed, cursor reset to {:.3}s", self.next_start_time);
        }
    }

    /// Release the output device and reset the cursor.
    pub fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
            info!("Playback stopped after {} buffers", self.scheduled);
        }
        self.next_start_time = 0.0;
    }

    pub fn is_stopped(&self) -> bool {
        self.device.is_none()
    }

    pub fn cursor(&self) -> f64 {
        self.next_start_time
    }
}

impl<D: OutputDevice> Drop for PlaybackScheduler<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualOutput;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn buffer(seconds: f64) -> DecodedAudioBuffer {
        DecodedAudioBuffer::new(vec![0.0; (seconds * 1000.0).round() as usize], 1000)
    }

    #[test]
    fn test_back_to_back_when_arriving_early() {
        let output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        let first = scheduler.schedule(buffer(0.5)).unwrap();
        output.set_now(0.1);
        let second = scheduler.schedule(buffer(0.5)).unwrap();

        assert_eq!(first.start, 0.0);
        assert_eq!(second.start, 0.5);
        assert!((scheduler.cursor() - 1.0).abs() < 1e-9);
        assert_eq!(output.starts(), vec![0.0, 0.5]);
    }

    #[test]
    fn test_starved_buffer_starts_now() {
        let output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule(buffer(0.25)).unwrap();
        output.set_now(2.0);
        let late = scheduler.schedule(buffer(0.25)).unwrap();

        assert_eq!(late.start, 2.0);
        assert!((scheduler.cursor() - 2.25).abs() < 1e-9);
    }

    #[test]
    fn test_random_arrivals_never_overlap() {
        let mut rng = StdRng::seed_from_u64(42);
        let output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        let mut now = 0.0;
        let mut intervals = Vec::new();
        for _ in 0..500 {
            // Bursts of simultaneous arrivals mixed with pauses
            if rng.random_bool(0.3) {
                now += rng.random_range(0.0..0.6);
                output.set_now(now);
            }
            let duration = rng.random_range(1..400) as f64 / 1000.0;
            intervals.push(scheduler.schedule(buffer(duration)).unwrap());
        }

        for pair in intervals.windows(2) {
            assert!(pair[1].start >= pair[0].end - 1e-9);
            assert!(pair[1].start >= pair[0].start);
        }
    }

    #[test]
    fn test_stop_releases_device_and_resets_cursor() {
        let output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());
        scheduler.schedule(buffer(1.0)).unwrap();

        scheduler.stop();
        assert!(scheduler.is_stopped());
        assert!(output.is_closed());
        assert_eq!(scheduler.cursor(), 0.0);

        // Late arrivals are dropped, and stopping twice is harmless
        assert!(scheduler.schedule(buffer(0.1)).is_none());
        scheduler.stop();
        assert_eq!(output.close_count(), 1);
    }

    #[test]
    fn test_flush_clears_pending_audio() {
        let output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new(output.clone());
        scheduler.schedule(buffer(3.0)).unwrap();
        output.set_now(0.4);

        scheduler.flush();
        assert_eq!(output.clear_count(), 1);
        assert_eq!(scheduler.cursor(), 0.4);

        let next = scheduler.schedule(buffer(0.5)).unwrap();
        assert_eq!(next.start, 0.4);
    }

    #[test]
    fn test_cursor_follows_late_placement() {
        let output = ManualOutput::new();
        // The device clock moves 20 ms between reading it and placing a buffer
        output.set_drift(0.02);
        let mut scheduler = PlaybackScheduler::new(output.clone());

        let first = scheduler.schedule(buffer(0.5)).unwrap();
        let second = scheduler.schedule(buffer(0.5)).unwrap();

        assert!((first.start - 0.02).abs() < 1e-9);
        assert!((first.end - 0.52).abs() < 1e-9);
        assert!(second.start >= first.end - 1e-9);
        assert_eq!(output.starts(), vec![first.start, second.start]);
    }

    #[test]
    fn test_drop_closes_device() {
        let output = ManualOutput::new();
        {
            let _scheduler = PlaybackScheduler::new(output.clone());
        }
        assert!(output.is_closed());
    }
}
