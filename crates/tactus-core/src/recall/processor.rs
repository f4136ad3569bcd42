//! Recall processors: the per-stage behaviour attached to a recall.
//!
//! The set of recall *shapes* is closed ([`RecallScope`](super::RecallScope)
//! × template/instance), but what a recall does per stage is open-ended, so
//! it lives behind the [`RecallProcessor`] trait. The built-in processors
//! cover the engine's own needs (signal generation, routing, gain, metering
//! and beat counting); hosts can plug in their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::RecallId;
use super::state::Stage;
use crate::error::RecallError;
use crate::graph::{AudioId, ChannelId, Direction, Frame};
use crate::timing::TickTiming;

/// Position of the channel a processor is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel handle.
    pub id: ChannelId,
    /// Input or output side.
    pub direction: Direction,
    /// Pad index.
    pub pad: u32,
    /// Sub-channel index within the pad.
    pub audio_channel: u32,
    /// Flat position, `pad * audio_channels + audio_channel`.
    pub line: u32,
}

/// Everything a processor may look at during one stage.
pub struct RunContext<'a> {
    /// Run being processed.
    pub recall_id: RecallId,
    /// Audio the recall belongs to.
    pub audio: AudioId,
    /// Channel the recall is bound to, `None` for audio-scoped recalls.
    pub channel: Option<ChannelInfo>,
    /// Frames per second.
    pub samplerate: u32,
    /// Musical position of the current tick.
    pub timing: &'a TickTiming,
    /// Writable frame of the bound recycling. Only set during `RunInter`.
    pub buffer: Option<&'a mut [f32]>,
    /// Frame published by the linked upstream channel this tick.
    pub upstream: Option<&'a [f32]>,
    /// Frames of this audio's input channels on the same sub-channel.
    /// Only set for output channels during `RunInter`.
    pub inputs: &'a [Frame],
}

/// What a processor asks the engine to do after a run stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunControl {
    /// Keep running next tick.
    #[default]
    Continue,
    /// This instance has finished. Ignored for persistent recalls.
    Done,
    /// End the whole run: every instance of the RecallID is cancelled.
    Finish,
}

/// Per-stage behaviour of a recall.
pub trait RecallProcessor: Send {
    /// Short identifier used in logs and notifications.
    fn name(&self) -> &str;

    /// One-time init hook, called for `InitPre`, `InitInter` and `InitPost`.
    fn init(&mut self, _stage: Stage, _ctx: &mut RunContext<'_>) -> Result<(), RecallError> {
        Ok(())
    }

    /// Per-tick hook, called for `RunPre`, `RunInter` and `RunPost`.
    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError>;

    /// Clones the processor for a new instance. Per-run state starts fresh.
    fn box_clone(&self) -> Box<dyn RecallProcessor>;
}

/// Sine generator added into the bound buffer.
#[derive(Debug, Clone)]
pub struct Tone {
    frequency: f64,
    amplitude: f32,
    phase: f64,
}

impl Tone {
    /// Creates a generator at `frequency` Hz with peak `amplitude`.
    pub fn new(frequency: f64, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude,
            phase: 0.0,
        }
    }
}

impl RecallProcessor for Tone {
    fn name(&self) -> &str {
        "tone"
    }

    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
        if stage != Stage::RunInter {
            return Ok(RunControl::Continue);
        }
        if !self.frequency.is_finite() || ctx.samplerate == 0 {
            return Err(RecallError::failed(self.name(), "frequency is not finite"));
        }
        let step = self.frequency / f64::from(ctx.samplerate);
        if let Some(buffer) = ctx.buffer.as_deref_mut() {
            for sample in buffer.iter_mut() {
                *sample += self.amplitude * (core::f64::consts::TAU * self.phase).sin() as f32;
                self.phase = (self.phase + step).fract();
            }
        }
        Ok(RunControl::Continue)
    }

    fn box_clone(&self) -> Box<dyn RecallProcessor> {
        Box::new(Self::new(self.frequency, self.amplitude))
    }
}

/// Linear gain applied to the bound buffer.
#[derive(Debug, Clone)]
pub struct Volume {
    gain: f32,
}

impl Volume {
    /// Creates a gain stage. `gain` must be finite.
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl RecallProcessor for Volume {
    fn name(&self) -> &str {
        "volume"
    }

    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
        if stage != Stage::RunInter {
            return Ok(RunControl::Continue);
        }
        if !self.gain.is_finite() {
            return Err(RecallError::failed(self.name(), "gain is not finite"));
        }
        if let Some(buffer) = ctx.buffer.as_deref_mut() {
            for sample in buffer.iter_mut() {
                *sample *= self.gain;
            }
        }
        Ok(RunControl::Continue)
    }

    fn box_clone(&self) -> Box<dyn RecallProcessor> {
        Box::new(self.clone())
    }
}

/// Sums this audio's same-line input frames into an output channel.
#[derive(Debug, Clone, Default)]
pub struct Mixdown;

impl RecallProcessor for Mixdown {
    fn name(&self) -> &str {
        "mixdown"
    }

    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
        if stage != Stage::RunInter {
            return Ok(RunControl::Continue);
        }
        let inputs = ctx.inputs;
        if let Some(buffer) = ctx.buffer.as_deref_mut() {
            for frame in inputs {
                for (out, sample) in buffer.iter_mut().zip(frame.iter()) {
                    *out += *sample;
                }
            }
        }
        Ok(RunControl::Continue)
    }

    fn box_clone(&self) -> Box<dyn RecallProcessor> {
        Box::new(Self)
    }
}

/// Adds the linked upstream channel's frame into an input channel.
#[derive(Debug, Clone, Default)]
pub struct CopyUpstream;

impl RecallProcessor for CopyUpstream {
    fn name(&self) -> &str {
        "copy-upstream"
    }

    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
        if stage != Stage::RunInter {
            return Ok(RunControl::Continue);
        }
        let upstream = ctx.upstream;
        if let (Some(buffer), Some(upstream)) = (ctx.buffer.as_deref_mut(), upstream) {
            for (out, sample) in buffer.iter_mut().zip(upstream.iter()) {
                *out += *sample;
            }
        }
        Ok(RunControl::Continue)
    }

    fn box_clone(&self) -> Box<dyn RecallProcessor> {
        Box::new(Self)
    }
}

/// Lock-free peak readout shared between a [`PeakMeter`] and its observers.
///
/// Non-negative `f32` values order the same way as their bit patterns, so
/// the peak is kept as raw bits in an `AtomicU32` and merged with `fetch_max`.
#[derive(Debug, Clone, Default)]
pub struct PeakHandle(Arc<AtomicU32>);

impl PeakHandle {
    /// Peak since the last [`take`](Self::take).
    pub fn peek(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Returns the peak and resets it to zero.
    pub fn take(&self) -> f32 {
        f32::from_bits(self.0.swap(0, Ordering::Relaxed))
    }

    fn merge(&self, value: f32) {
        self.0.fetch_max(value.abs().to_bits(), Ordering::Relaxed);
    }
}

/// Publishes the absolute peak of the bound buffer.
///
/// All clones of one meter report into the same [`PeakHandle`].
#[derive(Debug, Clone, Default)]
pub struct PeakMeter {
    handle: PeakHandle,
}

impl PeakMeter {
    /// Creates a meter with a fresh handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer side of the meter.
    pub fn handle(&self) -> PeakHandle {
        self.handle.clone()
    }
}

impl RecallProcessor for PeakMeter {
    fn name(&self) -> &str {
        "peak-meter"
    }

    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
        if stage == Stage::RunInter
            && let Some(buffer) = ctx.buffer.as_deref()
        {
            let peak = buffer
                .iter()
                .filter(|s| s.is_finite())
                .fold(0.0_f32, |acc, s| acc.max(s.abs()));
            self.handle.merge(peak);
        }
        Ok(RunControl::Continue)
    }

    fn box_clone(&self) -> Box<dyn RecallProcessor> {
        Box::new(self.clone())
    }
}

/// Audio-scoped beat counter that ends the run after `length` subdivisions.
#[derive(Debug, Clone)]
pub struct CountBeats {
    length: u64,
    looping: bool,
    counted: u64,
}

impl CountBeats {
    /// Ends the run after `length` subdivisions unless `looping`.
    pub fn new(length: u64, looping: bool) -> Self {
        Self {
            length,
            looping,
            counted: 0,
        }
    }

    /// Subdivisions seen so far by this instance.
    pub fn counted(&self) -> u64 {
        self.counted
    }
}

impl RecallProcessor for CountBeats {
    fn name(&self) -> &str {
        "count-beats"
    }

    fn run(&mut self, stage: Stage, ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
        if stage != Stage::RunPost {
            return Ok(RunControl::Continue);
        }
        self.counted += u64::from(ctx.timing.subdivisions);
        if !self.looping && self.counted >= self.length {
            return Ok(RunControl::Finish);
        }
        Ok(RunControl::Continue)
    }

    fn box_clone(&self) -> Box<dyn RecallProcessor> {
        Box::new(Self::new(self.length, self.looping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::SoundScope;

    fn timing(subdivisions: u32) -> TickTiming {
        TickTiming {
            subdivisions,
            ..TickTiming::default()
        }
    }

    fn ctx<'a>(timing: &'a TickTiming, buffer: Option<&'a mut [f32]>) -> RunContext<'a> {
        RunContext {
            recall_id: RecallId::new(SoundScope::Playback, 1),
            audio: AudioId::sentinel(),
            channel: None,
            samplerate: 48000,
            timing,
            buffer,
            upstream: None,
            inputs: &[],
        }
    }

    #[test]
    fn test_tone_writes_only_in_run_inter() {
        let t = timing(0);
        let mut buf = vec![0.0_f32; 64];
        let mut tone = Tone::new(1000.0, 0.5);
        tone.run(Stage::RunPre, &mut ctx(&t, Some(&mut buf))).unwrap();
        assert!(buf.iter().all(|&s| s == 0.0));
        tone.run(Stage::RunInter, &mut ctx(&t, Some(&mut buf))).unwrap();
        let peak = buf.iter().fold(0.0_f32, |a, s| a.max(s.abs()));
        assert!(peak > 0.4 && peak <= 0.5, "peak = {peak}");
    }

    #[test]
    fn test_volume_rejects_nan_gain() {
        let t = timing(0);
        let mut buf = vec![1.0_f32; 4];
        let mut volume = Volume::new(f32::NAN);
        let err = volume.run(Stage::RunInter, &mut ctx(&t, Some(&mut buf))).unwrap_err();
        assert!(matches!(err, RecallError::Failed { .. }));
    }

    #[test]
    fn test_mixdown_sums_inputs() {
        let t = timing(0);
        let mut buf = vec![0.0_f32; 3];
        let inputs: Vec<Frame> = vec![Arc::new(vec![1.0, 2.0, 3.0]), Arc::new(vec![0.5; 3])];
        let mut c = ctx(&t, Some(&mut buf));
        c.inputs = &inputs;
        Mixdown.run(Stage::RunInter, &mut c).unwrap();
        assert_eq!(buf, vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_copy_upstream_adds_linked_frame() {
        let t = timing(0);
        let mut buf = vec![0.5_f32; 3];
        let upstream = [1.0_f32, -1.0, 0.25];
        let mut c = ctx(&t, Some(&mut buf));
        c.upstream = Some(&upstream);
        CopyUpstream.run(Stage::RunInter, &mut c).unwrap();
        assert_eq!(buf, vec![1.5, -0.5, 0.75]);

        // Unlinked inputs are left alone.
        let mut buf = vec![0.5_f32; 3];
        CopyUpstream.run(Stage::RunInter, &mut ctx(&t, Some(&mut buf))).unwrap();
        assert_eq!(buf, vec![0.5; 3]);
    }

    #[test]
    fn test_peak_meter_take_resets() {
        let t = timing(0);
        let mut buf = vec![0.25, -0.75, 0.5];
        let mut meter = PeakMeter::new();
        let handle = meter.handle();
        meter.run(Stage::RunInter, &mut ctx(&t, Some(&mut buf))).unwrap();
        assert_eq!(handle.take(), 0.75);
        assert_eq!(handle.peek(), 0.0);
    }

    #[test]
    fn test_count_beats_finishes_unless_looping() {
        let t = timing(3);
        let mut once = CountBeats::new(5, false);
        assert_eq!(once.run(Stage::RunPost, &mut ctx(&t, None)).unwrap(), RunControl::Continue);
        assert_eq!(once.run(Stage::RunPost, &mut ctx(&t, None)).unwrap(), RunControl::Finish);

        let mut looping = CountBeats::new(5, true);
        for _ in 0..4 {
            assert_eq!(looping.run(Stage::RunPost, &mut ctx(&t, None)).unwrap(), RunControl::Continue);
        }
        assert_eq!(looping.counted(), 12);
    }

    #[test]
    fn test_box_clone_resets_run_state() {
        let mut beats = CountBeats::new(10, false);
        let t = timing(4);
        beats.run(Stage::RunPost, &mut ctx(&t, None)).unwrap();
        let clone = beats.box_clone();
        assert_eq!(clone.name(), "count-beats");
        assert_eq!(beats.counted(), 4);
    }
}
