//! Offline soundcard and WAV output.
//!
//! [`OfflineSoundcard`] has no clock: the engine is stepped by hand and every
//! buffer it writes is appended to a shared [`Recording`], which can then be
//! saved with hound.

use std::path::Path;
use std::sync::Arc;

use hound::{WavSpec, WavWriter};
use parking_lot::Mutex;
use tactus_core::{Presets, SampleFormat};

use crate::soundcard::{Soundcard, StreamHandle, TickCallback};
use crate::{Error, Result};

/// Interleaved samples written to an [`OfflineSoundcard`].
#[derive(Debug, Clone)]
pub struct Recording {
    presets: Presets,
    samples: Arc<Mutex<Vec<f32>>>,
}

impl Recording {
    /// Stream format of the recording.
    pub fn presets(&self) -> Presets {
        self.presets
    }

    /// Copy of the samples recorded so far.
    pub fn samples(&self) -> Vec<f32> {
        self.samples.lock().clone()
    }

    /// Recorded frames per channel.
    pub fn frames(&self) -> usize {
        let channels = usize::from(self.presets.pcm_channels.max(1));
        self.samples.lock().len() / channels
    }

    /// Absolute peak over the whole recording.
    pub fn peak(&self) -> f32 {
        self.samples.lock().iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }

    /// Writes the recording to a WAV file in the recording's sample format.
    ///
    /// `S64` has no WAV integer encoding and is written as 32-bit float, as
    /// is `Double`.
    pub fn write_wav<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (bits, float) = wav_encoding(self.presets.format);
        let spec = WavSpec {
            channels: self.presets.pcm_channels,
            sample_rate: self.presets.samplerate,
            bits_per_sample: bits,
            sample_format: if float {
                hound::SampleFormat::Float
            } else {
                hound::SampleFormat::Int
            },
        };
        let mut writer = WavWriter::create(path, spec)?;
        let samples = self.samples.lock();

        if float {
            for &sample in samples.iter() {
                writer.write_sample(sample)?;
            }
        } else if bits == 8 {
            for &sample in samples.iter() {
                writer.write_sample((sample * 128.0).clamp(-128.0, 127.0) as i8)?;
            }
        } else {
            let max_val = (1i64 << (bits - 1)) as f32;
            for &sample in samples.iter() {
                let int_sample = (sample * max_val).clamp(-max_val, max_val - 1.0) as i32;
                writer.write_sample(int_sample)?;
            }
        }

        writer.finalize()?;
        Ok(())
    }
}

fn wav_encoding(format: SampleFormat) -> (u16, bool) {
    match format {
        SampleFormat::S8 => (8, false),
        SampleFormat::S16 => (16, false),
        SampleFormat::S24 => (24, false),
        SampleFormat::S32 => (32, false),
        SampleFormat::S64 | SampleFormat::Float | SampleFormat::Double => (32, true),
    }
}

/// Soundcard that records instead of playing.
#[derive(Debug)]
pub struct OfflineSoundcard {
    recording: Recording,
}

impl OfflineSoundcard {
    /// Creates an empty recorder for `presets`.
    pub fn new(presets: Presets) -> Self {
        Self {
            recording: Recording {
                presets,
                samples: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    /// Handle to the recorded samples, valid after the soundcard moved into
    /// an engine.
    pub fn recording(&self) -> Recording {
        self.recording.clone()
    }
}

impl Soundcard for OfflineSoundcard {
    fn name(&self) -> &str {
        "offline"
    }

    fn presets(&self) -> Presets {
        self.recording.presets
    }

    fn start(&mut self, _on_tick: TickCallback) -> Result<StreamHandle> {
        Ok(StreamHandle::new(()))
    }

    fn write(&mut self, frames: &[f32]) -> Result<()> {
        let channels = usize::from(self.recording.presets.pcm_channels);
        if channels == 0 || frames.len() % channels != 0 {
            return Err(Error::Soundcard(format!(
                "buffer of {} samples does not divide into {} channels",
                frames.len(),
                channels
            )));
        }
        self.recording.samples.lock().extend_from_slice(frames);
        Ok(())
    }
}
