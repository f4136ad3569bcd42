//! Wall-clock soundcard.
//!
//! Ticks from a dedicated thread at the rate the presets imply and keeps a
//! running meter of what it was given instead of driving hardware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tactus_core::Presets;

use crate::soundcard::{Soundcard, StreamHandle, TickCallback};
use crate::{Error, Result};

/// Shared view of a [`TimerSoundcard`]'s output.
#[derive(Debug, Clone, Default)]
pub struct OutputMeter {
    buffers: Arc<AtomicU64>,
    peak: Arc<AtomicU32>,
}

impl OutputMeter {
    /// Buffers written so far.
    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    /// Absolute peak of the most recent buffer.
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }

    fn record(&self, frames: &[f32]) {
        let peak = frames.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        self.peak.store(peak.to_bits(), Ordering::Relaxed);
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Soundcard clocked by `thread::sleep`.
#[derive(Debug)]
pub struct TimerSoundcard {
    presets: Presets,
    meter: OutputMeter,
}

impl TimerSoundcard {
    /// Creates a timer soundcard for `presets`.
    pub fn new(presets: Presets) -> Self {
        Self {
            presets,
            meter: OutputMeter::default(),
        }
    }

    /// Handle to the output meter, valid after the soundcard moved into an engine.
    pub fn meter(&self) -> OutputMeter {
        self.meter.clone()
    }
}

struct Clock {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_clock(period: Duration, stop: &AtomicBool, mut on_tick: TickCallback) {
    let mut next = Instant::now() + period;
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else if now - next > period {
            tracing::warn!(
                "clock: {:.1} ms behind, resyncing",
                (now - next).as_secs_f64() * 1000.0
            );
            next = now;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        on_tick();
        next += period;
    }
}

impl Soundcard for TimerSoundcard {
    fn name(&self) -> &str {
        "timer"
    }

    fn presets(&self) -> Presets {
        self.presets
    }

    fn start(&mut self, on_tick: TickCallback) -> Result<StreamHandle> {
        let period = self.presets.tick_duration();
        if period.is_zero() {
            return Err(Error::Soundcard("tick duration is zero".into()));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("tactus-clock".into())
                .spawn(move || run_clock(period, &stop, on_tick))?
        };
        tracing::info!(
            "clock: started at {:.2} ms per tick",
            period.as_secs_f64() * 1000.0
        );
        Ok(StreamHandle::new(Clock {
            stop,
            thread: Some(thread),
        }))
    }

    fn write(&mut self, frames: &[f32]) -> Result<()> {
        self.meter.record(frames);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Presets {
        Presets {
            samplerate: 48000,
            buffer_size: 48,
            ..Presets::default()
        }
    }

    #[test]
    fn test_clock_ticks_until_dropped() {
        let mut card = TimerSoundcard::new(fast());
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = card
            .start(Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        for _ in 0..5 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        drop(handle);
        // Whatever was in flight has landed; nothing follows.
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_meter_tracks_peak() {
        let mut card = TimerSoundcard::new(fast());
        let meter = card.meter();
        card.write(&[0.1, -0.6, 0.3]).unwrap();
        assert_eq!(meter.buffers(), 1);
        assert!((meter.peak() - 0.6).abs() < 1e-6);
        card.write(&[0.0; 4]).unwrap();
        assert_eq!(meter.peak(), 0.0);
    }

    #[test]
    fn test_zero_buffer_is_rejected() {
        let mut card = TimerSoundcard::new(Presets {
            buffer_size: 0,
            ..Presets::default()
        });
        assert!(card.start(Box::new(|| {})).is_err());
    }
}
