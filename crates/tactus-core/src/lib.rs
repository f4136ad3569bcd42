//! Core engine for tactus.
//!
//! This crate holds the parts of the engine that are independent of threads
//! and hardware:
//!
//! - [`graph`]: audios, channels, recyclings and their per-run signals
//! - [`recall`]: effect units, their per-run state machine and the engine
//!   that advances runs per sound scope
//! - [`task`]: the serialized queue through which the graph is mutated
//! - [`gc`]: deferred reclamation of recyclings that left the graph
//! - [`timing`]: sample-domain ⇄ musical-domain conversion
//!
//! # Per-tick order
//!
//! ```text
//! TaskQueue::drain ─▶ TimingConverter::tick ─▶ RecallEngine::advance_scope (per scope)
//!                                                      │
//!                     RecallEngine::mix_into ◀─ RecyclingGc::collect
//! ```
//!
//! `tactus-io` wires these into a thread tree driven by a soundcard; the
//! types here can equally be stepped by hand, which is what the tests do.
//!
//! # Example
//!
//! ```
//! use tactus_core::graph::{AudioDesc, AudioGraph};
//! use tactus_core::recall::{RecallEngine, RecallScope, RecallTemplate, SoundScope, Tone};
//! use tactus_core::timing::TimingConverter;
//!
//! let mut graph = AudioGraph::default();
//! let synth = graph
//!     .add_audio(
//!         AudioDesc::new("synth")
//!             .with_pads(0, 1)
//!             .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(440.0, 0.25))),
//!     )
//!     .unwrap();
//!
//! let engine = RecallEngine::new();
//! let mut timing = TimingConverter::new(48000, 512, 120.0, 0.25).unwrap();
//! engine.start(&graph, synth, SoundScope::Playback).unwrap();
//! engine.advance_scope(SoundScope::Playback, &timing.tick());
//!
//! let mut out = vec![0.0_f32; 512 * 2];
//! engine.mix_into(SoundScope::Playback, &mut out, 2);
//! assert!(out.iter().any(|s| *s != 0.0));
//! ```

pub mod arena;
pub mod error;
pub mod gc;
pub mod graph;
pub mod presets;
pub mod recall;
pub mod task;
pub mod timing;

pub use error::{GraphError, LinkError, RecallError, TaskError, TimingError};
pub use gc::{GcReport, RecyclingGc};
pub use graph::{AudioDesc, AudioGraph, AudioId, ChannelId, Direction};
pub use presets::{Presets, SampleFormat};
pub use recall::{RecallEngine, RecallEvent, RecallId, SoundScope};
pub use task::{DrainReport, Task, TaskContext, TaskQueue};
pub use timing::{TickTiming, TimingConverter};
