//! Soundcard abstraction.
//!
//! A [`Soundcard`] is the engine's clock and its sink. Once started it calls
//! the tick callback once per buffer; after every tick the engine hands it
//! one interleaved buffer of `buffer_size * pcm_channels` samples.
//!
//! ```text
//! Soundcard ──tick──▶ ThreadTree root ──▶ scope nodes
//!     ▲                                        │
//!     └────────────── write(mix) ◀─────────────┘
//! ```
//!
//! Callbacks are boxed so the trait stays object-safe and the engine can pick
//! a soundcard at runtime. [`StreamHandle`] erases the clock's concrete type;
//! dropping it stops the ticks.

use tactus_core::Presets;

use crate::Result;

/// Called once per buffer by a started soundcard.
pub type TickCallback = Box<dyn FnMut() + Send + 'static>;

/// Type-erased clock handle. Ticks stop when it is dropped.
pub struct StreamHandle {
    _inner: Box<dyn Send>,
}

impl StreamHandle {
    /// Wraps a soundcard-specific stream object.
    pub fn new<T: Send + 'static>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

/// A clocked PCM sink.
pub trait Soundcard: Send + 'static {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Stream format this soundcard runs at.
    fn presets(&self) -> Presets;

    /// Starts the clock. `on_tick` is called once per buffer until the
    /// returned handle is dropped.
    ///
    /// Soundcards without a clock of their own return a handle right away
    /// and never call `on_tick`; the engine is then stepped by hand.
    fn start(&mut self, on_tick: TickCallback) -> Result<StreamHandle>;

    /// Accepts one interleaved output buffer.
    fn write(&mut self, frames: &[f32]) -> Result<()>;

    /// Fills one interleaved input buffer. Output-only soundcards produce
    /// silence.
    fn read(&mut self, frames: &mut [f32]) -> Result<()> {
        frames.fill(0.0);
        Ok(())
    }
}

/// Length of one interleaved buffer for `presets`.
pub fn frame_len(presets: &Presets) -> usize {
    presets.buffer_size as usize * usize::from(presets.pcm_channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        let presets = Presets {
            buffer_size: 256,
            pcm_channels: 2,
            ..Presets::default()
        };
        assert_eq!(frame_len(&presets), 512);
    }

    #[test]
    fn test_stream_handle_drops_inner() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = StreamHandle::new(Flag(std::sync::Arc::clone(&dropped)));
        assert!(!dropped.load(std::sync::atomic::Ordering::SeqCst));
        drop(handle);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
