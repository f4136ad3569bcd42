//! Channels: one pad/sub-channel of an audio.

use std::sync::{Arc, Weak};

use super::recycling::Recycling;
use super::{AudioId, ChannelId};
use crate::recall::Recall;

/// Input or output side of an audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Receives signal, possibly from a linked output.
    Input,
    /// Produces signal, possibly into a linked input.
    Output,
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Connection between an output channel and an input channel of another audio.
///
/// Both ends store a `Link` pointing at each other. The recycling carried
/// across the link is owned by the output side; the link itself only holds a
/// weak reference, so dropping the owner invalidates every link view.
#[derive(Debug, Clone)]
pub struct Link {
    peer: ChannelId,
    shared: Weak<Recycling>,
}

impl Link {
    pub(crate) fn new(peer: ChannelId, shared: &Arc<Recycling>) -> Self {
        Self {
            peer,
            shared: Arc::downgrade(shared),
        }
    }

    /// The channel on the other end.
    pub fn peer(&self) -> ChannelId {
        self.peer
    }

    /// Weak handle to the recycling carried across the link.
    pub fn shared(&self) -> &Weak<Recycling> {
        &self.shared
    }
}

/// One pad/sub-channel of an audio.
///
/// `prev`/`next` walk all channels of the same side in line order;
/// `prev_pad`/`next_pad` walk the same sub-channel across pads.
#[derive(Debug)]
pub struct Channel {
    pub(crate) audio: AudioId,
    pub(crate) direction: Direction,
    pub(crate) pad: u32,
    pub(crate) audio_channel: u32,
    pub(crate) line: u32,
    pub(crate) prev: Option<ChannelId>,
    pub(crate) next: Option<ChannelId>,
    pub(crate) prev_pad: Option<ChannelId>,
    pub(crate) next_pad: Option<ChannelId>,
    pub(crate) link: Option<Link>,
    pub(crate) home: Arc<Recycling>,
    pub(crate) recalls: Vec<Recall>,
}

impl Channel {
    /// Audio this channel belongs to.
    pub fn audio(&self) -> AudioId {
        self.audio
    }

    /// Input or output.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Pad index.
    pub fn pad(&self) -> u32 {
        self.pad
    }

    /// Sub-channel index within the pad.
    pub fn audio_channel(&self) -> u32 {
        self.audio_channel
    }

    /// Flat line index, `pad * audio_channels + audio_channel`.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Previous channel on the same side, in line order.
    pub fn prev(&self) -> Option<ChannelId> {
        self.prev
    }

    /// Next channel on the same side, in line order.
    pub fn next(&self) -> Option<ChannelId> {
        self.next
    }

    /// Same sub-channel in the previous pad.
    pub fn prev_pad(&self) -> Option<ChannelId> {
        self.prev_pad
    }

    /// Same sub-channel in the next pad.
    pub fn next_pad(&self) -> Option<ChannelId> {
        self.next_pad
    }

    /// The link, if this channel is connected.
    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    /// Owning handle to the home recycling.
    pub fn recycling(&self) -> &Arc<Recycling> {
        &self.home
    }

    /// Recall instances cloned onto this channel.
    pub fn recalls(&self) -> &[Recall] {
        &self.recalls
    }

    /// For an input channel, the recycling it reads from across its link.
    pub fn upstream(&self) -> Option<Weak<Recycling>> {
        match (self.direction, &self.link) {
            (Direction::Input, Some(link)) => Some(link.shared.clone()),
            _ => None,
        }
    }
}
