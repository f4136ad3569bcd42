//! Recalls: effect units attached to audios, channels and recyclings.
//!
//! Audios hold recall *templates*. When a channel is created the matching
//! templates are cloned onto it as *instances* (template flag stripped).
//! Starting a run in a [`SoundScope`] hands out a [`RecallId`] and gives
//! every instance of the covered audios a fresh processor, private to that
//! run. See [`RecallEngine`] for how runs advance and end.

mod chain;
mod engine;
mod event;
mod id;
pub mod processor;
mod state;
mod template;

pub use engine::{ChainHandle, EVENT_CAPACITY, RecallEngine};
pub use event::RecallEvent;
pub use id::{RecallId, RecallIdAllocator, SoundScope};
pub use processor::{
    ChannelInfo, CopyUpstream, CountBeats, Mixdown, PeakHandle, PeakMeter, RecallProcessor, RunContext,
    RunControl, Tone, Volume,
};
pub use state::{RecallState, Stage};
pub use template::{Recall, RecallInstance, RecallScope, RecallTarget, RecallTemplate};
