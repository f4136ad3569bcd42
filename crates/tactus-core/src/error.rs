//! Error taxonomy for the engine core.
//!
//! | error | raised by | handling |
//! |-------|-----------|----------|
//! | [`TaskError`] | a task's `launch()` | reported through the task's failure callback, the drain continues |
//! | [`RecallError`] | one recall instance | that instance is cancelled, siblings keep running |
//! | [`LinkError`] | a link request | the link is refused and the graph is left unchanged |
//! | [`GraphError`] | lookups against stale handles | surfaced as a task failure |
//! | [`TimingError`] | tempo or loop changes | surfaced as a task failure |
//!
//! Nothing is retried automatically. A caller that wants another attempt
//! appends a new task.

use std::any::Any;

use thiserror::Error;

use crate::graph::{AudioId, ChannelId, RecyclingId};
use crate::recall::RecallId;

/// Lookup and structural failures in the audio graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The audio handle is stale or was never issued.
    #[error("audio {0} not found")]
    AudioNotFound(AudioId),

    /// The channel handle is stale or was never issued.
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    /// A channel or pad count outside the accepted range.
    #[error("invalid {what} count: {value}")]
    InvalidCount {
        /// Which count was rejected.
        what: &'static str,
        /// The rejected value.
        value: u32,
    },

    /// A recycling was released twice.
    #[error("recycling {0} was already freed")]
    DoubleFree(RecyclingId),
}

/// Reasons a link between two channels is refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// One of the endpoints does not exist.
    #[error("link endpoint {0} not found")]
    NotFound(ChannelId),

    /// Links run from an output channel to an input channel.
    #[error("link must run from an output to an input ({src} -> {dst})")]
    Direction {
        /// Requested source.
        src: ChannelId,
        /// Requested destination.
        dst: ChannelId,
    },

    /// Both endpoints belong to the same audio.
    #[error("cannot link audio {0} to itself")]
    SameAudio(AudioId),

    /// The endpoints disagree on samplerate, buffer size or format.
    #[error(
        "incompatible buffer formats: {src_rate} Hz/{src_size}/{src_format} vs {dst_rate} Hz/{dst_size}/{dst_format}"
    )]
    Incompatible {
        /// Source samplerate.
        src_rate: u32,
        /// Source buffer size.
        src_size: u32,
        /// Source sample format.
        src_format: &'static str,
        /// Destination samplerate.
        dst_rate: u32,
        /// Destination buffer size.
        dst_size: u32,
        /// Destination sample format.
        dst_format: &'static str,
    },

    /// The link would close a loop through audio links.
    #[error("linking {src} -> {dst} would create a cycle")]
    Cycle {
        /// Requested source.
        src: ChannelId,
        /// Requested destination.
        dst: ChannelId,
    },
}

/// A failure inside a single recall instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecallError {
    /// The processor returned an error.
    #[error("recall '{recall}' failed: {message}")]
    Failed {
        /// Processor name.
        recall: String,
        /// Processor supplied reason.
        message: String,
    },

    /// The processor panicked and was caught at its stage boundary.
    #[error("recall '{recall}' panicked: {message}")]
    Panicked {
        /// Processor name.
        recall: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// No live chain carries this id.
    #[error("no active run for {0}")]
    UnknownRecallId(RecallId),

    /// The run could not be mapped onto the graph.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl RecallError {
    /// Convenience constructor for processor failures.
    pub fn failed(recall: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            recall: recall.into(),
            message: message.into(),
        }
    }
}

/// Rejected tempo, delay factor, loop or MIDI division values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimingError {
    /// Beats per minute must be finite and positive.
    #[error("invalid bpm: {0}")]
    InvalidBpm(f64),

    /// The delay factor must be finite and positive.
    #[error("invalid delay factor: {0}")]
    InvalidDelayFactor(f64),

    /// The loop must span at least one subdivision.
    #[error("invalid loop range [{left}, {right})")]
    InvalidLoop {
        /// Loop start, in subdivisions.
        left: u64,
        /// Loop end, in subdivisions.
        right: u64,
    },

    /// MIDI division (pulses per quarter note) must be non-zero.
    #[error("invalid MIDI division: {0}")]
    InvalidDivision(u32),

    /// Samplerate and buffer size must be non-zero.
    #[error("invalid presets: {samplerate} Hz, {buffer_size} frames")]
    InvalidPresets {
        /// Requested samplerate.
        samplerate: u32,
        /// Requested buffer size.
        buffer_size: u32,
    },
}

/// A failure reported by one task's `launch()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    /// The task targeted a missing or stale node.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The task requested a link that was refused.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The task touched a recall run that could not be honoured.
    #[error(transparent)]
    Recall(#[from] RecallError),

    /// The task changed timing to an invalid value.
    #[error(transparent)]
    Timing(#[from] TimingError),

    /// `launch()` panicked and was caught by the drain.
    #[error("task '{task}' panicked: {message}")]
    Panicked {
        /// Task name.
        task: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The task refused to run for a task-specific reason.
    #[error("{0}")]
    Rejected(String),
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
