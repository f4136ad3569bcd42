//! Sample-buffer streams owned by recyclings.
//!
//! An [`AudioSignal`] is a small ring of frames, one frame per tick. Readers
//! take the ring lock only long enough to clone the `Arc` of a frame; the
//! samples themselves are read without holding any lock. The writer takes
//! the oldest slot out of the ring, fills it and puts it back. If a reader
//! still holds that frame, `Arc::make_mut` gives the writer a private copy so
//! the reader's view never changes underneath it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::recall::RecallId;

/// Frames kept per signal when no explicit ring length is configured.
pub const DEFAULT_RING_LEN: usize = 4;

/// Immutable snapshot of one published frame.
pub type Frame = Arc<Vec<f32>>;

struct Ring {
    frames: Vec<Frame>,
    /// Number of frames published so far.
    cursor: u64,
}

/// Per-run sample stream inside a recycling.
pub struct AudioSignal {
    recall_id: RecallId,
    buffer_size: usize,
    ring: Mutex<Ring>,
    silence: Frame,
    destroyed: AtomicBool,
}

impl AudioSignal {
    /// Creates a stream of `ring_len` silent frames of `buffer_size` samples.
    pub fn new(recall_id: RecallId, buffer_size: usize, ring_len: usize) -> Self {
        let ring_len = ring_len.max(2);
        let silence: Frame = Arc::new(vec![0.0; buffer_size]);
        Self {
            recall_id,
            buffer_size,
            ring: Mutex::new(Ring {
                frames: (0..ring_len).map(|_| Arc::new(vec![0.0; buffer_size])).collect(),
                cursor: 0,
            }),
            silence,
            destroyed: AtomicBool::new(false),
        }
    }

    /// The run this stream belongs to.
    pub fn recall_id(&self) -> RecallId {
        self.recall_id
    }

    /// Samples per frame.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of frames published so far.
    pub fn cursor(&self) -> u64 {
        self.ring.lock().cursor
    }

    /// Returns `true` once the stream has been torn down by the GC.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Snapshot of the most recently published frame.
    pub fn latest(&self) -> Option<Frame> {
        let ring = self.ring.lock();
        if ring.cursor == 0 || ring.frames.is_empty() {
            return None;
        }
        let slot = ((ring.cursor - 1) % ring.frames.len() as u64) as usize;
        Some(Arc::clone(&ring.frames[slot]))
    }

    /// Snapshot of the frame published at `cursor`, if it is still in the ring.
    pub fn frame_at(&self, cursor: u64) -> Option<Frame> {
        let ring = self.ring.lock();
        let len = ring.frames.len() as u64;
        if len == 0 || cursor >= ring.cursor || ring.cursor - cursor > len {
            return None;
        }
        Some(Arc::clone(&ring.frames[(cursor % len) as usize]))
    }

    /// Fills the next frame through `fill` and publishes it.
    ///
    /// The frame is zeroed before `fill` runs. Returns the cursor of the
    /// published frame, or `None` if the stream was destroyed.
    pub fn publish_with<R>(&self, fill: impl FnOnce(&mut [f32]) -> R) -> Option<(u64, R)> {
        if self.is_destroyed() {
            return None;
        }
        let (slot, mut frame) = {
            let mut ring = self.ring.lock();
            if ring.frames.is_empty() {
                return None;
            }
            let slot = (ring.cursor % ring.frames.len() as u64) as usize;
            let frame = core::mem::replace(&mut ring.frames[slot], Arc::clone(&self.silence));
            (slot, frame)
        };

        let samples = Arc::make_mut(&mut frame);
        samples.fill(0.0);
        let result = fill(samples);

        let mut ring = self.ring.lock();
        if ring.frames.is_empty() {
            // destroyed while we were writing
            return None;
        }
        ring.frames[slot] = frame;
        let cursor = ring.cursor;
        ring.cursor += 1;
        Some((cursor, result))
    }

    /// Drops every frame. Later publishes and reads see nothing.
    pub(crate) fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let mut ring = self.ring.lock();
        ring.frames.clear();
        ring.frames.shrink_to_fit();
    }
}

impl core::fmt::Debug for AudioSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AudioSignal")
            .field("recall_id", &self.recall_id)
            .field("buffer_size", &self.buffer_size)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::SoundScope;

    fn signal() -> AudioSignal {
        AudioSignal::new(RecallId::new(SoundScope::Playback, 1), 4, 3)
    }

    #[test]
    fn test_publish_and_latest() {
        let s = signal();
        assert!(s.latest().is_none());
        let (cursor, ()) = s.publish_with(|buf| buf.fill(0.5)).unwrap();
        assert_eq!(cursor, 0);
        assert_eq!(s.latest().unwrap().as_slice(), &[0.5; 4]);
    }

    #[test]
    fn test_reader_snapshot_survives_overwrite() {
        let s = signal();
        s.publish_with(|buf| buf.fill(1.0));
        let held = s.latest().unwrap();
        for _ in 0..5 {
            s.publish_with(|buf| buf.fill(-1.0));
        }
        assert_eq!(held.as_slice(), &[1.0; 4]);
        assert_eq!(s.latest().unwrap().as_slice(), &[-1.0; 4]);
    }

    #[test]
    fn test_frame_at_window() {
        let s = signal();
        for i in 0..5 {
            s.publish_with(|buf| buf.fill(i as f32));
        }
        assert!(s.frame_at(1).is_none(), "evicted by ring length 3");
        assert_eq!(s.frame_at(2).unwrap()[0], 2.0);
        assert_eq!(s.frame_at(4).unwrap()[0], 4.0);
        assert!(s.frame_at(5).is_none(), "not yet published");
    }

    #[test]
    fn test_publish_zeroes_reused_frame() {
        let s = signal();
        for _ in 0..3 {
            s.publish_with(|buf| buf.fill(9.0));
        }
        s.publish_with(|buf| buf[0] = 1.0);
        assert_eq!(s.latest().unwrap().as_slice(), &[1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_destroy_blocks_io() {
        let s = signal();
        s.publish_with(|buf| buf.fill(1.0));
        s.destroy();
        assert!(s.is_destroyed());
        assert!(s.latest().is_none());
        assert!(s.publish_with(|_| ()).is_none());
    }
}
