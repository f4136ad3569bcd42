//! Recyclings: the leaf buffer containers of the audio graph.
//!
//! A recycling is owned by exactly one channel (its home) through an
//! `Arc<Recycling>`. A linked peer only keeps a `Weak<Recycling>`, so the
//! home channel's ownership decides when a recycling leaves the graph, and
//! the [`RecyclingGc`](crate::gc::RecyclingGc) decides when its streams are
//! actually destroyed.
//!
//! Two counters gate collection:
//!
//! - `attached`: recall instances bound to this recycling and not yet terminal
//! - `in_flight`: instances between their RUN_PRE and RUN_POST of this tick

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::ChannelId;
use super::signal::AudioSignal;
use crate::error::GraphError;
use crate::recall::{RecallId, SoundScope};

/// Process-unique recycling identifier. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecyclingId(pub(crate) u64);

impl RecyclingId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for RecyclingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "recycling#{}", self.0)
    }
}

/// Leaf buffer container holding one [`AudioSignal`] per active run.
pub struct Recycling {
    id: RecyclingId,
    owner: ChannelId,
    buffer_size: usize,
    ring_len: usize,
    signals: Mutex<Vec<Arc<AudioSignal>>>,
    attached: AtomicUsize,
    in_flight: AtomicUsize,
    freed: AtomicBool,
}

impl Recycling {
    pub(crate) fn new(id: RecyclingId, owner: ChannelId, buffer_size: usize, ring_len: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            buffer_size,
            ring_len,
            signals: Mutex::new(Vec::new()),
            attached: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            freed: AtomicBool::new(false),
        })
    }

    /// Identifier of this recycling.
    pub fn id(&self) -> RecyclingId {
        self.id
    }

    /// The channel that owns this recycling.
    pub fn owner(&self) -> ChannelId {
        self.owner
    }

    /// Samples per frame of every stream in this recycling.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns the stream for `recall_id`, creating it on first use.
    ///
    /// Returns `None` once the recycling has been freed.
    pub fn signal_or_insert(&self, recall_id: RecallId) -> Option<Arc<AudioSignal>> {
        if self.is_freed() {
            return None;
        }
        let mut signals = self.signals.lock();
        if let Some(existing) = signals.iter().find(|s| s.recall_id() == recall_id) {
            return Some(Arc::clone(existing));
        }
        let signal = Arc::new(AudioSignal::new(recall_id, self.buffer_size, self.ring_len));
        signals.push(Arc::clone(&signal));
        Some(signal)
    }

    /// Returns the stream written by `recall_id`, if any.
    pub fn signal(&self, recall_id: RecallId) -> Option<Arc<AudioSignal>> {
        self.signals
            .lock()
            .iter()
            .find(|s| s.recall_id() == recall_id)
            .cloned()
    }

    /// Returns the most recently created stream of `scope`, if any.
    pub fn signal_in_scope(&self, scope: SoundScope) -> Option<Arc<AudioSignal>> {
        self.signals
            .lock()
            .iter()
            .rev()
            .find(|s| s.recall_id().scope() == scope)
            .cloned()
    }

    /// Number of live streams.
    pub fn signal_count(&self) -> usize {
        self.signals.lock().len()
    }

    /// Destroys and removes the stream of `recall_id`.
    pub(crate) fn remove_signal(&self, recall_id: RecallId) {
        let mut signals = self.signals.lock();
        if let Some(pos) = signals.iter().position(|s| s.recall_id() == recall_id) {
            let signal = signals.swap_remove(pos);
            signal.destroy();
        }
    }

    /// Records one more bound recall instance.
    pub(crate) fn attach(&self) {
        self.attached.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one bound recall instance.
    pub(crate) fn detach(&self) {
        let _ = self
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Marks the start of a RUN_PRE..RUN_POST window.
    pub(crate) fn begin_read(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the end of a RUN_PRE..RUN_POST window.
    pub(crate) fn end_read(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Recall instances currently bound to this recycling.
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Recall instances currently between RUN_PRE and RUN_POST.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns `true` when no recall instance holds a live reference.
    pub fn is_unreferenced(&self) -> bool {
        self.attached() == 0 && self.in_flight() == 0
    }

    /// Returns `true` once the GC has released this recycling.
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Destroys every stream. A second call fails with [`GraphError::DoubleFree`].
    pub(crate) fn free(&self) -> Result<(), GraphError> {
        if self.freed.swap(true, Ordering::AcqRel) {
            return Err(GraphError::DoubleFree(self.id));
        }
        let signals = core::mem::take(&mut *self.signals.lock());
        for signal in signals {
            signal.destroy();
        }
        Ok(())
    }
}

impl core::fmt::Debug for Recycling {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Recycling")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("attached", &self.attached())
            .field("in_flight", &self.in_flight())
            .field("freed", &self.is_freed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recycling() -> Arc<Recycling> {
        Recycling::new(RecyclingId(1), ChannelId::sentinel(), 8, 4)
    }

    #[test]
    fn test_signal_per_recall_id() {
        let r = recycling();
        let a = RecallId::new(SoundScope::Playback, 1);
        let b = RecallId::new(SoundScope::Export, 2);
        let sa = r.signal_or_insert(a).unwrap();
        let again = r.signal_or_insert(a).unwrap();
        assert!(Arc::ptr_eq(&sa, &again));
        r.signal_or_insert(b).unwrap();
        assert_eq!(r.signal_count(), 2);
        assert_eq!(r.signal_in_scope(SoundScope::Export).unwrap().recall_id(), b);
    }

    #[test]
    fn test_counters_saturate_at_zero() {
        let r = recycling();
        r.detach();
        r.end_read();
        assert_eq!(r.attached(), 0);
        assert_eq!(r.in_flight(), 0);
        r.attach();
        r.begin_read();
        assert!(!r.is_unreferenced());
        r.end_read();
        r.detach();
        assert!(r.is_unreferenced());
    }

    #[test]
    fn test_free_destroys_streams_once() {
        let r = recycling();
        let signal = r.signal_or_insert(RecallId::new(SoundScope::Wave, 3)).unwrap();
        assert!(r.free().is_ok());
        assert!(signal.is_destroyed());
        assert_eq!(r.free(), Err(GraphError::DoubleFree(RecyclingId(1))));
        assert!(r.signal_or_insert(RecallId::new(SoundScope::Wave, 4)).is_none());
    }
}
