//! Sample-domain ⇄ musical-domain conversion.
//!
//! The musical grid is made of *subdivisions*. With the default delay factor
//! of `1/4` one subdivision is a sixteenth note. Two quantities describe how
//! the grid maps onto ticks:
//!
//! - **delay**: buffers per subdivision,
//!   `60 · (samplerate / buffer_size) / bpm · (1/16) · (1/delay_factor)`
//! - **attack**: the frame inside the current buffer at which the next
//!   subdivision starts, if one starts in this buffer at all
//!
//! Subdivision lengths rarely divide the buffer size, so boundaries are
//! placed with an integer frame length plus a fractional carry: each
//! subdivision is `floor(frames)` long and takes one extra frame whenever the
//! accumulated fraction passes 1. Boundaries therefore never drift from the
//! exact grid by more than one frame, however long the engine runs.
//!
//! MIDI delta-times convert through the same bpm and delay factor. For any
//! division where one pulse spans at least one frame, a delta-time that was
//! converted to frames converts back to the identical delta-time.

use crate::error::TimingError;
use crate::presets::Presets;

/// Tempo used when none is configured.
pub const DEFAULT_BPM: f64 = 120.0;

/// Delay factor used when none is configured; makes one subdivision a sixteenth note.
pub const DEFAULT_DELAY_FACTOR: f64 = 0.25;

/// Buffers per subdivision for the given stream and tempo.
pub fn absolute_delay(samplerate: u32, buffer_size: u32, bpm: f64, delay_factor: f64) -> f64 {
    60.0 * ((f64::from(samplerate) / f64::from(buffer_size)) / bpm)
        * ((1.0 / 16.0) * (1.0 / delay_factor))
}

/// Musical position of one tick, published to every recall of that tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickTiming {
    /// Tick number, starting at 0.
    pub tick: u64,
    /// Absolute frame of the first sample in this buffer.
    pub sample_offset: u64,
    /// Frames in this buffer.
    pub buffer_size: u32,
    /// Frame in this buffer where the first subdivision starts, if any does.
    pub attack: Option<u32>,
    /// Number of subdivisions starting inside this buffer.
    pub subdivisions: u32,
    /// Loop-relative index of the first subdivision starting in this buffer.
    pub first_note: Option<u64>,
    /// Loop-relative index of the subdivision sounding at the end of the buffer.
    pub note_offset: u64,
    /// Absolute index of the subdivision sounding at the end of the buffer.
    pub note_offset_absolute: u64,
    /// Buffers per subdivision.
    pub delay: f64,
    /// Tempo in effect for this tick.
    pub bpm: f64,
}

/// Tick-over-tick musical clock.
#[derive(Debug, Clone)]
pub struct TimingConverter {
    samplerate: u32,
    buffer_size: u32,
    bpm: f64,
    delay_factor: f64,
    whole: u64,
    frac: f64,
    carry: f64,
    tick: u64,
    sample_counter: u64,
    next_boundary: u64,
    next_note: u64,
    note_offset: u64,
    notes_started: u64,
    loop_range: Option<(u64, u64)>,
}

impl TimingConverter {
    /// Creates a converter positioned at frame 0.
    pub fn new(samplerate: u32, buffer_size: u32, bpm: f64, delay_factor: f64) -> Result<Self, TimingError> {
        if samplerate == 0 || buffer_size == 0 {
            return Err(TimingError::InvalidPresets {
                samplerate,
                buffer_size,
            });
        }
        let mut converter = Self {
            samplerate,
            buffer_size,
            bpm: DEFAULT_BPM,
            delay_factor: DEFAULT_DELAY_FACTOR,
            whole: 0,
            frac: 0.0,
            carry: 0.0,
            tick: 0,
            sample_counter: 0,
            next_boundary: 0,
            next_note: 0,
            note_offset: 0,
            notes_started: 0,
            loop_range: None,
        };
        converter.retime(bpm, delay_factor)?;
        Ok(converter)
    }

    /// Creates a converter for the samplerate and buffer size of `presets`.
    pub fn from_presets(presets: &Presets, bpm: f64, delay_factor: f64) -> Result<Self, TimingError> {
        Self::new(presets.samplerate, presets.buffer_size, bpm, delay_factor)
    }

    /// Current tempo.
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Current delay factor.
    pub fn delay_factor(&self) -> f64 {
        self.delay_factor
    }

    /// Frames per second.
    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    /// Frames per tick.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Buffers per subdivision.
    pub fn delay(&self) -> f64 {
        absolute_delay(self.samplerate, self.buffer_size, self.bpm, self.delay_factor)
    }

    /// Frames per subdivision.
    pub fn frames_per_subdivision(&self) -> f64 {
        self.delay() * f64::from(self.buffer_size)
    }

    /// Ticks produced so far.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Frames consumed so far.
    pub fn sample_counter(&self) -> u64 {
        self.sample_counter
    }

    /// Loop-relative index of the sounding subdivision.
    pub fn note_offset(&self) -> u64 {
        self.note_offset
    }

    /// Active loop range, in subdivisions.
    pub fn loop_range(&self) -> Option<(u64, u64)> {
        self.loop_range
    }

    /// Changes the tempo. Already scheduled boundaries and the carry are kept.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<(), TimingError> {
        self.retime(bpm, self.delay_factor)
    }

    /// Changes the delay factor. Already scheduled boundaries and the carry are kept.
    pub fn set_delay_factor(&mut self, delay_factor: f64) -> Result<(), TimingError> {
        self.retime(self.bpm, delay_factor)
    }

    /// Loops subdivisions in `[left, right)`, or disables looping with `None`.
    pub fn set_loop(&mut self, range: Option<(u64, u64)>) -> Result<(), TimingError> {
        if let Some((left, right)) = range
            && left >= right
        {
            return Err(TimingError::InvalidLoop { left, right });
        }
        self.loop_range = range;
        if let Some((left, right)) = range
            && self.next_note >= right
        {
            self.next_note = left;
        }
        Ok(())
    }

    /// Moves the next subdivision to start to loop-relative index `note`.
    pub fn seek(&mut self, note: u64) {
        self.next_note = note;
    }

    /// Returns to frame 0 and note 0, keeping tempo and loop.
    pub fn reset(&mut self) {
        self.carry = 0.0;
        self.tick = 0;
        self.sample_counter = 0;
        self.next_boundary = 0;
        self.next_note = self.loop_range.map_or(0, |(left, _)| left);
        self.note_offset = self.next_note;
        self.notes_started = 0;
    }

    /// Advances one buffer and reports the subdivisions that start inside it.
    pub fn tick(&mut self) -> TickTiming {
        let start = self.sample_counter;
        let end = start + u64::from(self.buffer_size);
        let mut attack = None;
        let mut first_note = None;
        let mut subdivisions = 0_u32;

        while self.next_boundary < end {
            if attack.is_none() {
                attack = Some((self.next_boundary - start) as u32);
                first_note = Some(self.next_note);
            }
            subdivisions += 1;
            self.note_offset = self.next_note;
            self.notes_started += 1;
            self.next_note = self.wrap(self.next_note + 1);
            let len = self.next_subdivision_len();
            self.next_boundary += len;
        }

        let timing = TickTiming {
            tick: self.tick,
            sample_offset: start,
            buffer_size: self.buffer_size,
            attack,
            subdivisions,
            first_note,
            note_offset: self.note_offset,
            note_offset_absolute: self.notes_started.saturating_sub(1),
            delay: self.delay(),
            bpm: self.bpm,
        };
        self.sample_counter = end;
        self.tick += 1;
        timing
    }

    /// Frames per MIDI pulse at `division` pulses per quarter note.
    pub fn samples_per_pulse(&self, division: u32) -> Result<f64, TimingError> {
        if division == 0 {
            return Err(TimingError::InvalidDivision(division));
        }
        Ok(60.0 * f64::from(self.samplerate) / (self.bpm * f64::from(division)))
    }

    /// MIDI delta-time to a frame offset, rounded to the nearest frame.
    pub fn delta_time_to_samples(&self, delta_time: u64, division: u32) -> Result<u64, TimingError> {
        let spp = self.samples_per_pulse(division)?;
        Ok((delta_time as f64 * spp).round() as u64)
    }

    /// Frame offset to a MIDI delta-time, rounded to the nearest pulse.
    pub fn samples_to_delta_time(&self, samples: u64, division: u32) -> Result<u64, TimingError> {
        let spp = self.samples_per_pulse(division)?;
        Ok((samples as f64 / spp).round() as u64)
    }

    /// MIDI delta-time to a (fractional) subdivision offset.
    pub fn delta_time_to_note_offset(&self, delta_time: u64, division: u32) -> Result<f64, TimingError> {
        if division == 0 {
            return Err(TimingError::InvalidDivision(division));
        }
        Ok(delta_time as f64 * self.subdivisions_per_quarter() / f64::from(division))
    }

    /// Subdivision offset to a MIDI delta-time, rounded to the nearest pulse.
    pub fn note_offset_to_delta_time(&self, note_offset: f64, division: u32) -> Result<u64, TimingError> {
        if division == 0 {
            return Err(TimingError::InvalidDivision(division));
        }
        Ok((note_offset * f64::from(division) / self.subdivisions_per_quarter()).round() as u64)
    }

    /// First frame of absolute subdivision `note`.
    pub fn note_offset_to_samples(&self, note: u64) -> u64 {
        (note as f64 * self.frames_per_subdivision()).floor() as u64
    }

    /// Absolute (fractional) subdivision position of frame `samples`.
    pub fn samples_to_note_offset(&self, samples: u64) -> f64 {
        samples as f64 / self.frames_per_subdivision()
    }

    fn subdivisions_per_quarter(&self) -> f64 {
        16.0 * self.delay_factor
    }

    fn wrap(&self, note: u64) -> u64 {
        match self.loop_range {
            Some((left, right)) if note >= right => left,
            _ => note,
        }
    }

    fn next_subdivision_len(&mut self) -> u64 {
        self.carry += self.frac;
        let mut len = self.whole;
        if self.carry >= 1.0 {
            self.carry -= 1.0;
            len += 1;
        }
        len.max(1)
    }

    fn retime(&mut self, bpm: f64, delay_factor: f64) -> Result<(), TimingError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(TimingError::InvalidBpm(bpm));
        }
        if !delay_factor.is_finite() || delay_factor <= 0.0 {
            return Err(TimingError::InvalidDelayFactor(delay_factor));
        }
        let frames =
            absolute_delay(self.samplerate, self.buffer_size, bpm, delay_factor) * f64::from(self.buffer_size);
        if frames < 1.0 {
            return Err(TimingError::InvalidBpm(bpm));
        }
        self.bpm = bpm;
        self.delay_factor = delay_factor;
        self.whole = frames.floor() as u64;
        self.frac = frames - frames.floor();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "timing_retime: bpm={bpm} delay_factor={delay_factor} frames/subdivision={frames:.3}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_delay_matches_sixteenth_notes() {
        // 120 bpm at 48 kHz: a sixteenth is 6000 frames, 11.71875 buffers of 512.
        let delay = absolute_delay(48000, 512, 120.0, DEFAULT_DELAY_FACTOR);
        assert!((delay - 11.71875).abs() < 1e-12);
    }

    #[test]
    fn test_first_tick_starts_note_zero() {
        let mut t = TimingConverter::new(48000, 512, 120.0, 0.25).unwrap();
        let first = t.tick();
        assert_eq!(first.attack, Some(0));
        assert_eq!(first.first_note, Some(0));
        assert_eq!(first.subdivisions, 1);
        assert_eq!(first.note_offset, 0);
        let second = t.tick();
        assert_eq!(second.attack, None);
        assert_eq!(second.subdivisions, 0);
        assert_eq!(second.sample_offset, 512);
    }

    #[test]
    fn test_attack_with_carry_tracks_exact_grid() {
        // 44.1 kHz at 120 bpm: 5512.5 frames per subdivision.
        let mut t = TimingConverter::new(44100, 256, 120.0, 0.25).unwrap();
        let mut boundaries = Vec::new();
        for _ in 0..2000 {
            let timing = t.tick();
            if let Some(attack) = timing.attack {
                boundaries.push(timing.sample_offset + u64::from(attack));
            }
        }
        for (k, b) in boundaries.iter().enumerate() {
            let exact = (k as f64 * 5512.5).floor() as u64;
            assert_eq!(*b, exact, "boundary {k}");
        }
        assert!(boundaries.len() > 90);
    }

    #[test]
    fn test_loop_wraps_note_offset() {
        let mut t = TimingConverter::new(48000, 6000, 120.0, 0.25).unwrap();
        t.set_loop(Some((0, 4))).unwrap();
        let notes: Vec<u64> = (0..10).map(|_| t.tick().note_offset).collect();
        assert_eq!(notes, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
        let absolute = t.tick().note_offset_absolute;
        assert_eq!(absolute, 10);
    }

    #[test]
    fn test_invalid_loop_and_tempo() {
        let mut t = TimingConverter::new(48000, 512, 120.0, 0.25).unwrap();
        assert_eq!(
            t.set_loop(Some((8, 8))),
            Err(TimingError::InvalidLoop { left: 8, right: 8 })
        );
        assert_eq!(t.set_bpm(0.0), Err(TimingError::InvalidBpm(0.0)));
        assert!(t.set_delay_factor(f64::NAN).is_err());
        assert_eq!(t.bpm(), 120.0, "rejected changes leave tempo intact");
        assert!(TimingConverter::new(0, 512, 120.0, 0.25).is_err());
    }

    #[test]
    fn test_tempo_change_keeps_schedule() {
        let mut t = TimingConverter::new(48000, 1000, 120.0, 0.25).unwrap();
        t.tick(); // boundary at 0, next at 6000
        t.set_bpm(240.0).unwrap();
        let mut boundaries = Vec::new();
        // Covers frames 1000..13000.
        for _ in 0..12 {
            let timing = t.tick();
            if let Some(a) = timing.attack {
                boundaries.push(timing.sample_offset + u64::from(a));
            }
        }
        assert_eq!(boundaries, vec![6000, 9000, 12000]);
    }

    #[test]
    fn test_midi_round_trip() {
        let t = TimingConverter::new(44100, 512, 133.0, 0.25).unwrap();
        for delta in [0_u64, 1, 7, 96, 1000, 123_457] {
            let samples = t.delta_time_to_samples(delta, 96).unwrap();
            assert_eq!(t.samples_to_delta_time(samples, 96).unwrap(), delta);
        }
        assert!(t.samples_per_pulse(0).is_err());
    }

    #[test]
    fn test_note_offset_conversions() {
        let t = TimingConverter::new(48000, 512, 120.0, 0.25).unwrap();
        // one quarter note at 96 ppq is four sixteenths
        assert_eq!(t.delta_time_to_note_offset(96, 96).unwrap(), 4.0);
        assert_eq!(t.note_offset_to_delta_time(4.0, 96).unwrap(), 96);
        assert_eq!(t.note_offset_to_samples(3), 18000);
        assert!((t.samples_to_note_offset(9000) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_reset_returns_to_loop_start() {
        let mut t = TimingConverter::new(48000, 6000, 120.0, 0.25).unwrap();
        t.set_loop(Some((2, 6))).unwrap();
        for _ in 0..3 {
            t.tick();
        }
        t.reset();
        assert_eq!(t.sample_counter(), 0);
        assert_eq!(t.tick().first_note, Some(2));
    }
}
