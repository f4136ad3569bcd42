//! Soundcards and the threaded engine for tactus.
//!
//! This crate provides:
//!
//! - **Soundcards**: the [`Soundcard`] trait, a wall-clock [`TimerSoundcard`]
//!   and an [`OfflineSoundcard`] that records to memory and WAV
//! - **Engine**: [`EngineContext`], which owns the graph, runs, task queue
//!   and collector and drives them from a `tactus-thread` tree
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tactus_core::graph::AudioDesc;
//! use tactus_core::recall::{RecallScope, RecallTemplate, SoundScope, Tone};
//! use tactus_core::task::{AddAudio, StartScope};
//! use tactus_core::Presets;
//! use tactus_io::{EngineContext, EngineSettings, OfflineSoundcard};
//!
//! let card = OfflineSoundcard::new(Presets::default());
//! let recording = card.recording();
//! let engine = EngineContext::init(EngineSettings::default(), card)?;
//!
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! engine.append(
//!     AddAudio::new(
//!         AudioDesc::new("osc")
//!             .with_pads(0, 1)
//!             .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(440.0, 0.2)).persistent()),
//!     )
//!     .with_reply(tx),
//! );
//! engine.step(Duration::from_secs(1))?;
//! let osc = rx.recv()??;
//! engine.append(StartScope::new(osc, SoundScope::Playback));
//! engine.run_ticks(100, Duration::from_secs(1))?;
//! engine.shutdown();
//!
//! recording.write_wav("osc.wav")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod engine;
mod offline;
mod soundcard;
mod timer;

pub use engine::{EngineContext, EngineSettings, ScopeNode};
pub use offline::{OfflineSoundcard, Recording};
pub use soundcard::{Soundcard, StreamHandle, TickCallback, frame_len};
pub use timer::{OutputMeter, TimerSoundcard};

use tactus_core::{SoundScope, TimingError};
use tactus_thread::ThreadError;

/// Error types for soundcards and the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Thread tree or worker pool failure.
    #[error(transparent)]
    Thread(#[from] ThreadError),

    /// The soundcard's presets or the tempo are unusable.
    #[error(transparent)]
    Timing(#[from] TimingError),

    /// Soundcard setup or runtime error.
    #[error("soundcard error: {0}")]
    Soundcard(String),

    /// Two scope threads were configured for one sound scope.
    #[error("sound scope '{0}' is assigned to more than one thread")]
    DuplicateScope(SoundScope),

    /// WAV file write error.
    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),

    /// Standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for soundcard and engine operations.
pub type Result<T> = std::result::Result<T, Error>;
