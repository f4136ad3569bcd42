//! Audios: tracks or instruments owning input and output channel chains.

use super::{ChannelId, Direction};
use crate::presets::Presets;
use crate::recall::{Recall, RecallTemplate};

/// Construction parameters for an audio.
#[derive(Debug, Clone)]
pub struct AudioDesc {
    /// Display name.
    pub name: String,
    /// Sub-channels per pad.
    pub audio_channels: u32,
    /// Number of input pads.
    pub input_pads: u32,
    /// Number of output pads.
    pub output_pads: u32,
    /// Stream presets, used for link compatibility.
    pub presets: Presets,
    /// Audio-level recall templates.
    pub templates: Vec<RecallTemplate>,
}

impl AudioDesc {
    /// A stereo audio with one input pad and one output pad.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            audio_channels: 2,
            input_pads: 1,
            output_pads: 1,
            presets: Presets::default(),
            templates: Vec::new(),
        }
    }

    /// Sets the sub-channel count.
    pub fn with_audio_channels(mut self, audio_channels: u32) -> Self {
        self.audio_channels = audio_channels;
        self
    }

    /// Sets the pad counts.
    pub fn with_pads(mut self, input_pads: u32, output_pads: u32) -> Self {
        self.input_pads = input_pads;
        self.output_pads = output_pads;
        self
    }

    /// Sets the stream presets.
    pub fn with_presets(mut self, presets: Presets) -> Self {
        self.presets = presets;
        self
    }

    /// Adds a recall template.
    pub fn with_template(mut self, template: RecallTemplate) -> Self {
        self.templates.push(template);
        self
    }
}

/// A track or instrument in the graph.
#[derive(Debug)]
pub struct Audio {
    pub(crate) name: String,
    pub(crate) audio_channels: u32,
    pub(crate) input_pads: u32,
    pub(crate) output_pads: u32,
    pub(crate) presets: Presets,
    pub(crate) inputs: Vec<ChannelId>,
    pub(crate) outputs: Vec<ChannelId>,
    pub(crate) templates: Vec<Recall>,
    pub(crate) recalls: Vec<Recall>,
}

impl Audio {
    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sub-channels per pad.
    pub fn audio_channels(&self) -> u32 {
        self.audio_channels
    }

    /// Number of input pads.
    pub fn input_pads(&self) -> u32 {
        self.input_pads
    }

    /// Number of output pads.
    pub fn output_pads(&self) -> u32 {
        self.output_pads
    }

    /// Stream presets.
    pub fn presets(&self) -> &Presets {
        &self.presets
    }

    /// Channels of one side in line order.
    pub fn channels(&self, direction: Direction) -> &[ChannelId] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    /// Audio-level templates.
    pub fn templates(&self) -> &[Recall] {
        &self.templates
    }

    /// Audio-scoped instances.
    pub fn recalls(&self) -> &[Recall] {
        &self.recalls
    }

    pub(crate) fn pads(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Input => self.input_pads,
            Direction::Output => self.output_pads,
        }
    }

    pub(crate) fn set_pads(&mut self, direction: Direction, pads: u32) {
        match direction {
            Direction::Input => self.input_pads = pads,
            Direction::Output => self.output_pads = pads,
        }
    }

    pub(crate) fn channels_mut(&mut self, direction: Direction) -> &mut Vec<ChannelId> {
        match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        }
    }
}
