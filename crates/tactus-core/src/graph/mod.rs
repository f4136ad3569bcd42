//! The audio graph: audios, channels, recyclings and their signals.
//!
//! # Architecture
//!
//! ```text
//! Audio ──owns──▶ inputs:  [Channel(pad 0, ch 0), Channel(pad 0, ch 1), …]
//!       ──owns──▶ outputs: [Channel(pad 0, ch 0), …]
//!
//! Channel ──Arc──▶ Recycling ──owns──▶ AudioSignal (one per RecallId)
//!    │
//!    └─ Link ──Weak──▶ peer's carried Recycling
//! ```
//!
//! Audios and channels live in generational arenas; sibling and pad-group
//! links are stored as [`ChannelId`]s, so relinking never invalidates a
//! handle held by a realtime reader (a stale handle simply stops resolving).
//!
//! Every structural change returns a [`Rewire`] describing which channels
//! got a new home recycling, which inputs changed upstream, and which
//! recyclings left the live set. The caller hands the retired recyclings to
//! the [`RecyclingGc`](crate::gc::RecyclingGc) instead of dropping them.

mod audio;
mod channel;
mod recycling;
mod signal;

use std::collections::HashSet;
use std::sync::Arc;

pub use audio::{Audio, AudioDesc};
pub use channel::{Channel, Direction, Link};
pub use recycling::{Recycling, RecyclingId};
pub use signal::{AudioSignal, DEFAULT_RING_LEN, Frame};

use crate::arena::{Arena, Index};
use crate::error::{GraphError, LinkError};
use crate::recall::{Recall, RecallScope, RecallTarget};

/// Largest accepted sub-channel count.
pub const MAX_AUDIO_CHANNELS: u32 = 256;

/// Largest accepted pad count per side.
pub const MAX_PADS: u32 = 4096;

/// Handle to an [`Audio`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AudioId(pub(crate) Index);

impl AudioId {
    /// Returns the arena handle.
    #[inline]
    pub fn index(self) -> Index {
        self.0
    }

    /// Returns a handle that never resolves.
    #[inline]
    pub fn sentinel() -> Self {
        Self(Index::sentinel())
    }
}

impl core::fmt::Display for AudioId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "audio#{}", self.0)
    }
}

/// Handle to a [`Channel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) Index);

impl ChannelId {
    /// Returns the arena handle.
    #[inline]
    pub fn index(self) -> Index {
        self.0
    }

    /// Returns a handle that never resolves.
    #[inline]
    pub fn sentinel() -> Self {
        Self(Index::sentinel())
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// Side effects of a structural change.
#[derive(Debug, Default)]
pub struct Rewire {
    /// Channels added by the change, in line order per side.
    pub added: Vec<ChannelId>,
    /// Channels removed by the change.
    pub removed: Vec<ChannelId>,
    /// Surviving channels whose home recycling was re-created.
    pub rebound: Vec<ChannelId>,
    /// Surviving input channels whose upstream recycling changed.
    pub refreshed: Vec<ChannelId>,
    /// Recyclings that left the live set and must go to the GC.
    pub retired: Vec<Arc<Recycling>>,
}

impl Rewire {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.rebound.is_empty()
            && self.refreshed.is_empty()
            && self.retired.is_empty()
    }

    fn absorb(&mut self, other: Rewire) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.rebound.extend(other.rebound);
        self.refreshed.extend(other.refreshed);
        self.retired.extend(other.retired);
    }
}

/// Arena-backed audio graph.
pub struct AudioGraph {
    audios: Arena<Audio>,
    channels: Arena<Channel>,
    next_recycling: u64,
    ring_len: usize,
}

impl Default for AudioGraph {
    fn default() -> Self {
        Self::new(DEFAULT_RING_LEN)
    }
}

impl AudioGraph {
    /// Creates an empty graph whose signals keep `ring_len` frames.
    pub fn new(ring_len: usize) -> Self {
        Self {
            audios: Arena::new(),
            channels: Arena::new(),
            next_recycling: 1,
            ring_len: ring_len.max(2),
        }
    }

    /// Number of live audios.
    pub fn audio_count(&self) -> usize {
        self.audios.len()
    }

    /// Number of live channels across all audios.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Looks up an audio.
    pub fn audio(&self, id: AudioId) -> Option<&Audio> {
        self.audios.get(id.0)
    }

    /// Looks up a channel.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    /// Iterates live audios.
    pub fn audios(&self) -> impl Iterator<Item = (AudioId, &Audio)> {
        self.audios.iter().map(|(index, audio)| (AudioId(index), audio))
    }

    /// Iterates the home recyclings of every live channel.
    pub fn recyclings(&self) -> impl Iterator<Item = &Arc<Recycling>> {
        self.channels.iter().map(|(_, channel)| &channel.home)
    }

    /// Channel at flat `line` on one side of `audio`.
    pub fn nth(&self, audio: AudioId, direction: Direction, line: u32) -> Option<ChannelId> {
        self.audio(audio)?
            .channels(direction)
            .get(line as usize)
            .copied()
    }

    /// Channel at (`pad`, `audio_channel`) on one side of `audio`.
    pub fn pad_nth(
        &self,
        audio: AudioId,
        direction: Direction,
        pad: u32,
        audio_channel: u32,
    ) -> Option<ChannelId> {
        let a = self.audio(audio)?;
        if audio_channel >= a.audio_channels {
            return None;
        }
        let line = pad.checked_mul(a.audio_channels)?.checked_add(audio_channel)?;
        self.nth(audio, direction, line)
    }

    /// First channel at or after `from`, following `next`, that carries a
    /// readable recycling: every output does, an input only once linked.
    pub fn first_with_recycling(&self, from: ChannelId) -> Option<ChannelId> {
        let mut current = Some(from);
        while let Some(id) = current {
            let channel = self.channel(id)?;
            if channel.direction == Direction::Output || channel.link.is_some() {
                return Some(id);
            }
            current = channel.next;
        }
        None
    }

    /// Channel whose home recycling is `id`.
    pub fn recycling_owner(&self, id: RecyclingId) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, channel)| channel.home.id() == id)
            .map(|(index, _)| ChannelId(index))
    }

    /// Adds an audio and builds its channels from `desc`.
    pub fn add_audio(&mut self, desc: AudioDesc) -> Result<AudioId, GraphError> {
        validate_count("audio channel", desc.audio_channels, MAX_AUDIO_CHANNELS)?;
        validate_count("input pad", desc.input_pads, MAX_PADS)?;
        validate_count("output pad", desc.output_pads, MAX_PADS)?;

        let AudioDesc {
            name,
            audio_channels,
            input_pads,
            output_pads,
            presets,
            templates,
        } = desc;
        let templates: Vec<Recall> = templates.into_iter().map(Recall::Template).collect();

        // Starts empty so both sides are built from scratch below.
        let id = AudioId(self.audios.insert(Audio {
            name,
            audio_channels: 0,
            input_pads: 0,
            output_pads: 0,
            presets,
            inputs: Vec::new(),
            outputs: Vec::new(),
            templates,
            recalls: Vec::new(),
        }));

        if let Some(audio) = self.audios.get_mut(id.0) {
            let recalls: Vec<Recall> = audio
                .templates
                .iter()
                .filter(|t| t.scope() == RecallScope::Audio)
                .filter_map(|t| t.instantiate(RecallTarget::Audio(id)))
                .collect();
            audio.recalls = recalls;
        }

        self.rebuild_side(id, Direction::Input, input_pads, audio_channels)?;
        self.rebuild_side(id, Direction::Output, output_pads, audio_channels)?;
        if let Some(audio) = self.audios.get_mut(id.0) {
            audio.audio_channels = audio_channels;
            audio.input_pads = input_pads;
            audio.output_pads = output_pads;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_add: {id} with {audio_channels} channels, {input_pads} in / {output_pads} out pads"
        );
        Ok(id)
    }

    /// Removes an audio, unlinking and retiring every channel it owns.
    pub fn remove_audio(&mut self, id: AudioId) -> Result<Rewire, GraphError> {
        self.audio(id).ok_or(GraphError::AudioNotFound(id))?;
        let mut rewire = self.rebuild_side(id, Direction::Input, 0, 0)?;
        rewire.absorb(self.rebuild_side(id, Direction::Output, 0, 0)?);
        self.audios.remove(id.0);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_remove: {id}, {} recyclings retired",
            rewire.retired.len()
        );
        Ok(rewire)
    }

    /// Changes the sub-channel count on both sides of `audio`.
    pub fn set_audio_channels(&mut self, id: AudioId, audio_channels: u32) -> Result<Rewire, GraphError> {
        validate_count("audio channel", audio_channels, MAX_AUDIO_CHANNELS)?;
        let audio = self.audio(id).ok_or(GraphError::AudioNotFound(id))?;
        let (input_pads, output_pads) = (audio.input_pads, audio.output_pads);

        let mut rewire = self.rebuild_side(id, Direction::Input, input_pads, audio_channels)?;
        rewire.absorb(self.rebuild_side(id, Direction::Output, output_pads, audio_channels)?);
        if let Some(audio) = self.audios.get_mut(id.0) {
            audio.audio_channels = audio_channels;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_resize: {id} audio_channels={audio_channels} (+{} / -{})",
            rewire.added.len(),
            rewire.removed.len()
        );
        Ok(rewire)
    }

    /// Changes the pad count on one side of `audio`.
    pub fn set_pads(&mut self, id: AudioId, direction: Direction, pads: u32) -> Result<Rewire, GraphError> {
        validate_count("pad", pads, MAX_PADS)?;
        let audio_channels = self
            .audio(id)
            .ok_or(GraphError::AudioNotFound(id))?
            .audio_channels;
        let rewire = self.rebuild_side(id, direction, pads, audio_channels)?;
        if let Some(audio) = self.audios.get_mut(id.0) {
            audio.set_pads(direction, pads);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "graph_resize: {id} {direction} pads={pads} (+{} / -{})",
            rewire.added.len(),
            rewire.removed.len()
        );
        Ok(rewire)
    }

    /// Links output `src` to input `dst`.
    ///
    /// Linking an already linked pair is a no-op. On success the source gets
    /// a fresh home recycling that the destination reads through a weak
    /// handle; any previous links of either end are dropped first.
    pub fn set_link(&mut self, src: ChannelId, dst: ChannelId) -> Result<Rewire, LinkError> {
        let s = self.channel(src).ok_or(LinkError::NotFound(src))?;
        let d = self.channel(dst).ok_or(LinkError::NotFound(dst))?;

        if s.link.as_ref().is_some_and(|l| l.peer() == dst) {
            return Ok(Rewire::default());
        }
        if s.direction != Direction::Output || d.direction != Direction::Input {
            return Err(LinkError::Direction { src, dst });
        }
        if s.audio == d.audio {
            return Err(LinkError::SameAudio(s.audio));
        }

        let (src_audio, dst_audio) = (s.audio, d.audio);
        let sp = *self
            .audio(src_audio)
            .ok_or(LinkError::NotFound(src))?
            .presets();
        let dp = *self
            .audio(dst_audio)
            .ok_or(LinkError::NotFound(dst))?
            .presets();
        if !sp.is_link_compatible(&dp) {
            return Err(LinkError::Incompatible {
                src_rate: sp.samplerate,
                src_size: sp.buffer_size,
                src_format: sp.format.as_str(),
                dst_rate: dp.samplerate,
                dst_size: dp.buffer_size,
                dst_format: dp.format.as_str(),
            });
        }

        // A cycle exists if the destination audio already feeds the source audio.
        if self.feeds(dst_audio, src_audio) {
            return Err(LinkError::Cycle { src, dst });
        }

        let mut rewire = Rewire::default();
        self.detach_link(src, None, &mut rewire);
        self.detach_link(dst, None, &mut rewire);
        if !rewire.rebound.contains(&src) {
            self.renew_home(src, &mut rewire);
        }

        let Some(shared) = self.channel(src).map(|c| Arc::clone(&c.home)) else {
            return Err(LinkError::NotFound(src));
        };
        if let Some(c) = self.channels.get_mut(src.0) {
            c.link = Some(Link::new(dst, &shared));
        }
        if let Some(c) = self.channels.get_mut(dst.0) {
            c.link = Some(Link::new(src, &shared));
        }
        if !rewire.refreshed.contains(&dst) {
            rewire.refreshed.push(dst);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("graph_link: {src} → {dst}");
        Ok(rewire)
    }

    /// Drops the link of `channel`, if any. Unlinking an unlinked channel is a no-op.
    pub fn unlink(&mut self, channel: ChannelId) -> Result<Rewire, LinkError> {
        self.channel(channel).ok_or(LinkError::NotFound(channel))?;
        let mut rewire = Rewire::default();
        self.detach_link(channel, None, &mut rewire);

        #[cfg(feature = "tracing")]
        if !rewire.is_empty() {
            tracing::debug!("graph_unlink: {channel}");
        }
        Ok(rewire)
    }

    /// Audios whose outputs feed `audio`, upstream first, ending with `audio`.
    pub fn upstream_order(&self, audio: AudioId) -> Result<Vec<AudioId>, GraphError> {
        self.audio(audio).ok_or(GraphError::AudioNotFound(audio))?;
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        self.visit_upstream(audio, &mut seen, &mut order);
        Ok(order)
    }

    fn visit_upstream(&self, audio: AudioId, seen: &mut HashSet<AudioId>, order: &mut Vec<AudioId>) {
        if !seen.insert(audio) {
            return;
        }
        if let Some(a) = self.audio(audio) {
            for input in &a.inputs {
                let peer_audio = self
                    .channel(*input)
                    .and_then(|c| c.link.as_ref())
                    .and_then(|l| self.channel(l.peer()))
                    .map(|peer| peer.audio);
                if let Some(peer_audio) = peer_audio {
                    self.visit_upstream(peer_audio, seen, order);
                }
            }
        }
        order.push(audio);
    }

    /// Returns `true` if `from` reaches `to` by following output links.
    fn feeds(&self, from: AudioId, to: AudioId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(audio) = self.audio(current) {
                for output in &audio.outputs {
                    let next = self
                        .channel(*output)
                        .and_then(|c| c.link.as_ref())
                        .and_then(|l| self.channel(l.peer()))
                        .map(|peer| peer.audio);
                    if let Some(next) = next {
                        stack.push(next);
                    }
                }
            }
        }
        false
    }

    /// Rebuilds one side of `audio` to `pads × audio_channels` channels.
    ///
    /// Existing channels inside the new shape keep their handles; channels
    /// outside it are unlinked, removed and their recyclings retired.
    fn rebuild_side(
        &mut self,
        id: AudioId,
        direction: Direction,
        pads: u32,
        audio_channels: u32,
    ) -> Result<Rewire, GraphError> {
        let (old, old_pads, old_channels, buffer_size) = {
            let audio = self.audio(id).ok_or(GraphError::AudioNotFound(id))?;
            (
                audio.channels(direction).to_vec(),
                audio.pads(direction),
                audio.audio_channels,
                audio.presets.buffer_size as usize,
            )
        };

        let mut rewire = Rewire::default();
        let mut keep = Vec::with_capacity((pads * audio_channels) as usize);
        for channel_id in old {
            let Some(channel) = self.channel(channel_id) else {
                continue;
            };
            if channel.pad < pads && channel.audio_channel < audio_channels {
                keep.push(channel_id);
            } else {
                self.detach_link(channel_id, Some(channel_id), &mut rewire);
                if let Some(removed) = self.channels.remove(channel_id.0) {
                    rewire.retired.push(removed.home);
                    rewire.removed.push(channel_id);
                }
            }
        }

        for pad in 0..pads {
            for audio_channel in 0..audio_channels {
                if pad < old_pads && audio_channel < old_channels {
                    continue;
                }
                let channel_id = self.create_channel(id, direction, pad, audio_channel, buffer_size);
                keep.push(channel_id);
                rewire.added.push(channel_id);
            }
        }

        keep.sort_by_key(|c| self.channel(*c).map(|ch| (ch.pad, ch.audio_channel)));
        self.relink_siblings(&keep, audio_channels);
        if let Some(audio) = self.audios.get_mut(id.0) {
            *audio.channels_mut(direction) = keep;
        }
        Ok(rewire)
    }

    fn create_channel(
        &mut self,
        audio: AudioId,
        direction: Direction,
        pad: u32,
        audio_channel: u32,
        buffer_size: usize,
    ) -> ChannelId {
        let recycling_id = self.next_recycling_id();
        let templates: Vec<&Recall> = self
            .audio(audio)
            .map(|a| {
                a.templates
                    .iter()
                    .filter(|t| match t {
                        Recall::Template(template) => template.applies_to(direction),
                        Recall::Instance(_) => false,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let placeholder = ChannelId::sentinel();
        let recalls: Vec<Recall> = templates
            .into_iter()
            .filter_map(|t| t.instantiate(RecallTarget::Channel(placeholder)))
            .collect();

        let home = Recycling::new(recycling_id, placeholder, buffer_size, self.ring_len);
        let id = ChannelId(self.channels.insert(Channel {
            audio,
            direction,
            pad,
            audio_channel,
            line: 0,
            prev: None,
            next: None,
            prev_pad: None,
            next_pad: None,
            link: None,
            home,
            recalls,
        }));

        // The id is only known after insertion; re-issue the home with the
        // real owner and point the instances at the real node.
        let home = Recycling::new(recycling_id, id, buffer_size, self.ring_len);
        if let Some(channel) = self.channels.get_mut(id.0) {
            channel.home = home;
            retarget_recalls(channel, id);
        }
        id
    }

    fn relink_siblings(&mut self, ordered: &[ChannelId], audio_channels: u32) {
        for (line, id) in ordered.iter().enumerate() {
            let prev = line.checked_sub(1).map(|i| ordered[i]);
            let next = ordered.get(line + 1).copied();
            let ac = audio_channels as usize;
            let prev_pad = line.checked_sub(ac).map(|i| ordered[i]);
            let next_pad = ordered.get(line + ac).copied();
            if let Some(channel) = self.channels.get_mut(id.0) {
                channel.line = line as u32;
                channel.prev = prev;
                channel.next = next;
                channel.prev_pad = prev_pad;
                channel.next_pad = next_pad;
            }
        }
    }

    /// Drops the link of `channel` on both ends.
    ///
    /// The surviving output side gets a fresh home recycling and the
    /// surviving input side is marked refreshed. `removing` names a channel
    /// that is about to be removed and therefore needs no renewal.
    fn detach_link(&mut self, channel: ChannelId, removing: Option<ChannelId>, rewire: &mut Rewire) {
        let Some(c) = self.channels.get_mut(channel.0) else {
            return;
        };
        let Some(link) = c.link.take() else {
            return;
        };
        let direction = c.direction;
        let peer = link.peer();
        if let Some(p) = self.channels.get_mut(peer.0) {
            p.link = None;
        }

        let (src, dst) = match direction {
            Direction::Output => (channel, peer),
            Direction::Input => (peer, channel),
        };
        if removing != Some(src) && self.channels.contains(src.0) {
            self.renew_home(src, rewire);
        }
        if removing != Some(dst) && self.channels.contains(dst.0) && !rewire.refreshed.contains(&dst) {
            rewire.refreshed.push(dst);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("graph_unlink: {src} ↛ {dst}");
    }

    fn renew_home(&mut self, channel: ChannelId, rewire: &mut Rewire) {
        let recycling_id = self.next_recycling_id();
        let ring_len = self.ring_len;
        let Some(c) = self.channels.get_mut(channel.0) else {
            return;
        };
        let fresh = Recycling::new(recycling_id, channel, c.home.buffer_size(), ring_len);
        let old = core::mem::replace(&mut c.home, fresh);
        retarget_recalls(c, channel);
        rewire.retired.push(old);
        if !rewire.rebound.contains(&channel) {
            rewire.rebound.push(channel);
        }
    }

    fn next_recycling_id(&mut self) -> RecyclingId {
        let id = RecyclingId(self.next_recycling);
        self.next_recycling += 1;
        id
    }
}

fn retarget_recalls(channel: &mut Channel, id: ChannelId) {
    let recycling = channel.home.id();
    for recall in &mut channel.recalls {
        if let Some(instance) = recall.as_instance_mut() {
            let target = match instance.scope() {
                RecallScope::Recycling => RecallTarget::Recycling {
                    channel: id,
                    recycling,
                },
                _ => RecallTarget::Channel(id),
            };
            instance.retarget(target);
        }
    }
}

fn validate_count(what: &'static str, value: u32, max: u32) -> Result<(), GraphError> {
    if value > max {
        return Err(GraphError::InvalidCount { what, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::{Presets, SampleFormat};
    use crate::recall::{RecallTemplate, processor::Volume};

    fn stereo(name: &str) -> AudioDesc {
        AudioDesc::new(name).with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(1.0)))
    }

    #[test]
    fn test_add_audio_builds_channels() {
        let mut graph = AudioGraph::default();
        let id = graph.add_audio(stereo("a").with_pads(2, 1)).unwrap();
        let audio = graph.audio(id).unwrap();
        assert_eq!(audio.channels(Direction::Input).len(), 4);
        assert_eq!(audio.channels(Direction::Output).len(), 2);
        assert_eq!(graph.channel_count(), 6);
        assert_eq!(graph.recyclings().count(), 6);
        assert_eq!(
            (audio.audio_channels(), audio.input_pads(), audio.output_pads()),
            (2, 2, 1)
        );

        let first = graph.nth(id, Direction::Input, 0).unwrap();
        let c = graph.channel(first).unwrap();
        assert_eq!(c.recalls().len(), 1);
        assert!(!c.recalls()[0].is_template());
        assert_eq!(c.recycling().owner(), first);
        assert_eq!(
            c.recalls()[0].as_instance().unwrap().target(),
            RecallTarget::Channel(first)
        );
    }

    #[test]
    fn test_sibling_and_pad_navigation() {
        let mut graph = AudioGraph::default();
        let id = graph.add_audio(stereo("a").with_pads(3, 0)).unwrap();
        let c01 = graph.pad_nth(id, Direction::Input, 0, 1).unwrap();
        let c11 = graph.pad_nth(id, Direction::Input, 1, 1).unwrap();
        let c10 = graph.pad_nth(id, Direction::Input, 1, 0).unwrap();
        let ch = graph.channel(c01).unwrap();
        assert_eq!(ch.line(), 1);
        assert_eq!(ch.next(), Some(c10));
        assert_eq!(ch.next_pad(), Some(c11));
        assert_eq!(graph.channel(c11).unwrap().prev_pad(), Some(c01));
        assert!(graph.pad_nth(id, Direction::Input, 0, 2).is_none());
        assert!(graph.pad_nth(id, Direction::Input, u32::MAX, 1).is_none());
    }

    #[test]
    fn test_add_then_grow_keeps_existing_channels() {
        let mut graph = AudioGraph::default();
        let id = graph.add_audio(stereo("a").with_pads(1, 1)).unwrap();
        let out0 = graph.nth(id, Direction::Output, 0).unwrap();
        let rewire = graph.set_audio_channels(id, 4).unwrap();
        assert_eq!(rewire.added.len(), 4);
        assert!(rewire.removed.is_empty());
        assert_eq!(graph.nth(id, Direction::Output, 0), Some(out0));
        assert_eq!(graph.audio(id).unwrap().channels(Direction::Output).len(), 4);
    }

    #[test]
    fn test_first_with_recycling_skips_unlinked_inputs() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let b = graph.add_audio(stereo("b")).unwrap();
        let first = graph.nth(b, Direction::Input, 0).unwrap();
        let second = graph.nth(b, Direction::Input, 1).unwrap();
        assert_eq!(graph.first_with_recycling(first), None);

        let out = graph.nth(a, Direction::Output, 1).unwrap();
        graph.set_link(out, second).unwrap();
        assert_eq!(graph.first_with_recycling(first), Some(second));
        let a_out = graph.nth(a, Direction::Output, 0).unwrap();
        assert_eq!(graph.first_with_recycling(a_out), Some(a_out));
    }

    #[test]
    fn test_grow_keeps_existing_handles() {
        let mut graph = AudioGraph::default();
        let id = graph.add_audio(stereo("a").with_pads(1, 0)).unwrap();
        let before: Vec<_> = graph.audio(id).unwrap().channels(Direction::Input).to_vec();
        let rewire = graph.set_audio_channels(id, 4).unwrap();
        assert_eq!(rewire.added.len(), 2);
        assert!(rewire.removed.is_empty());
        let after = graph.audio(id).unwrap().channels(Direction::Input);
        assert_eq!(&after[..2], &before[..]);
        assert_eq!(graph.audio(id).unwrap().audio_channels(), 4);
    }

    #[test]
    fn test_shrink_retires_recyclings() {
        let mut graph = AudioGraph::default();
        let id = graph.add_audio(stereo("a").with_pads(2, 0)).unwrap();
        let rewire = graph.set_pads(id, Direction::Input, 1).unwrap();
        assert_eq!(rewire.removed.len(), 2);
        assert_eq!(rewire.retired.len(), 2);
        for id in &rewire.removed {
            assert!(graph.channel(*id).is_none());
        }
    }

    #[test]
    fn test_link_creates_weak_upstream() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let b = graph.add_audio(stereo("b")).unwrap();
        let out = graph.nth(a, Direction::Output, 0).unwrap();
        let inp = graph.nth(b, Direction::Input, 0).unwrap();
        let old_home = Arc::clone(graph.channel(out).unwrap().recycling());

        let rewire = graph.set_link(out, inp).unwrap();
        assert_eq!(rewire.rebound, vec![out]);
        assert_eq!(rewire.refreshed, vec![inp]);
        assert!(Arc::ptr_eq(&rewire.retired[0], &old_home));

        let upstream = graph.channel(inp).unwrap().upstream().unwrap();
        let new_home = graph.channel(out).unwrap().recycling();
        assert!(Arc::ptr_eq(&upstream.upgrade().unwrap(), new_home));
        assert_eq!(Arc::strong_count(new_home), 1, "the link holds no strong reference");

        let again = graph.set_link(out, inp).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_link_refuses_cycles() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let b = graph.add_audio(stereo("b")).unwrap();
        let a_out = graph.nth(a, Direction::Output, 0).unwrap();
        let b_in = graph.nth(b, Direction::Input, 0).unwrap();
        let b_out = graph.nth(b, Direction::Output, 0).unwrap();
        let a_in = graph.nth(a, Direction::Input, 0).unwrap();
        graph.set_link(a_out, b_in).unwrap();

        let home_before = graph.channel(b_out).unwrap().recycling().id();
        let err = graph.set_link(b_out, a_in).unwrap_err();
        assert_eq!(err, LinkError::Cycle { src: b_out, dst: a_in });
        assert_eq!(graph.channel(b_out).unwrap().recycling().id(), home_before);
        assert!(graph.channel(a_in).unwrap().link().is_none());
    }

    #[test]
    fn test_link_refuses_incompatible_presets() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let presets = Presets {
            format: SampleFormat::Float,
            ..Presets::default()
        };
        let b = graph.add_audio(stereo("b").with_presets(presets)).unwrap();
        let out = graph.nth(a, Direction::Output, 0).unwrap();
        let inp = graph.nth(b, Direction::Input, 0).unwrap();
        assert!(matches!(
            graph.set_link(out, inp),
            Err(LinkError::Incompatible { .. })
        ));
        assert!(matches!(
            graph.set_link(inp, out),
            Err(LinkError::Direction { .. })
        ));
    }

    #[test]
    fn test_unlink_renews_source_home() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let b = graph.add_audio(stereo("b")).unwrap();
        let out = graph.nth(a, Direction::Output, 0).unwrap();
        let inp = graph.nth(b, Direction::Input, 0).unwrap();
        graph.set_link(out, inp).unwrap();
        let linked_home = Arc::clone(graph.channel(out).unwrap().recycling());

        let rewire = graph.unlink(inp).unwrap();
        assert_eq!(rewire.rebound, vec![out]);
        assert!(Arc::ptr_eq(&rewire.retired[0], &linked_home));
        assert!(graph.channel(out).unwrap().link().is_none());
        assert!(graph.channel(inp).unwrap().upstream().is_none());
        assert!(graph.unlink(inp).unwrap().is_empty());
    }

    #[test]
    fn test_remove_audio_unlinks_peers() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let b = graph.add_audio(stereo("b")).unwrap();
        let out = graph.nth(a, Direction::Output, 0).unwrap();
        let inp = graph.nth(b, Direction::Input, 0).unwrap();
        graph.set_link(out, inp).unwrap();

        let rewire = graph.remove_audio(b).unwrap();
        assert_eq!(rewire.removed.len(), 4);
        // four removed homes plus the renewed source home
        assert_eq!(rewire.retired.len(), 5);
        assert_eq!(rewire.rebound, vec![out]);
        assert!(graph.audio(b).is_none());
        assert!(graph.channel(out).unwrap().link().is_none());
        assert_eq!(graph.remove_audio(b).unwrap_err(), GraphError::AudioNotFound(b));
    }

    #[test]
    fn test_upstream_order() {
        let mut graph = AudioGraph::default();
        let a = graph.add_audio(stereo("a")).unwrap();
        let b = graph.add_audio(stereo("b")).unwrap();
        let c = graph.add_audio(stereo("c")).unwrap();
        graph
            .set_link(graph.nth(a, Direction::Output, 0).unwrap(), graph.nth(b, Direction::Input, 0).unwrap())
            .unwrap();
        graph
            .set_link(graph.nth(b, Direction::Output, 0).unwrap(), graph.nth(c, Direction::Input, 1).unwrap())
            .unwrap();
        assert_eq!(graph.upstream_order(c).unwrap(), vec![a, b, c]);
        assert_eq!(graph.upstream_order(a).unwrap(), vec![a]);
    }

    #[test]
    fn test_invalid_counts() {
        let mut graph = AudioGraph::default();
        let err = graph
            .add_audio(AudioDesc::new("x").with_audio_channels(MAX_AUDIO_CHANNELS + 1))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidCount { .. }));
    }
}
