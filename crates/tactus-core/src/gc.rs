//! Deferred reclamation of recyclings.
//!
//! A structural task never frees a recycling directly: whatever it unlinks
//! or removes goes to the *stopped* set through [`RecyclingGc::stop`]. Once
//! per tick, after every scope has advanced, [`RecyclingGc::collect`] frees
//! the entries that no recall instance references any more:
//!
//! 1. `attached == 0`: no bound instance is still live
//! 2. `in_flight == 0`: no instance is between RUN_PRE and RUN_POST
//! 3. no run in any sound scope still maps a channel onto it
//!
//! Entries that are not collectible stay for a later tick. Nothing is ever
//! forced; an entry pending for more than `overdue_after_ticks` is reported
//! as overdue so a stuck run shows up in the logs instead of leaking silently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::graph::{Recycling, RecyclingId};
use crate::recall::RecallEngine;

/// Ticks an entry may stay pending before it is reported as overdue.
pub const DEFAULT_OVERDUE_AFTER_TICKS: u64 = 64;

/// Outcome of one [`RecyclingGc::collect`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Entries freed by this pass.
    pub freed: usize,
    /// Entries still waiting for their references to drain.
    pub pending: usize,
    /// Pending entries older than the overdue threshold.
    pub overdue: usize,
}

struct Stopped {
    recycling: Arc<Recycling>,
    since: u64,
    reported: bool,
}

/// The stopped set and its collector.
pub struct RecyclingGc {
    stopped: Mutex<Vec<Stopped>>,
    overdue_after_ticks: u64,
    freed_total: AtomicU64,
}

impl Default for RecyclingGc {
    fn default() -> Self {
        Self::new(DEFAULT_OVERDUE_AFTER_TICKS)
    }
}

impl RecyclingGc {
    /// Creates an empty collector.
    pub fn new(overdue_after_ticks: u64) -> Self {
        Self {
            stopped: Mutex::new(Vec::new()),
            overdue_after_ticks,
            freed_total: AtomicU64::new(0),
        }
    }

    /// Overdue threshold in ticks.
    pub fn overdue_after_ticks(&self) -> u64 {
        self.overdue_after_ticks
    }

    /// Moves a recycling that left the graph into the stopped set.
    ///
    /// Stopping the same recycling twice keeps the first entry.
    pub fn stop(&self, recycling: Arc<Recycling>, tick: u64) {
        let mut stopped = self.stopped.lock();
        if recycling.is_freed() || stopped.iter().any(|s| s.recycling.id() == recycling.id()) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("gc_stop: {} at tick {tick}", recycling.id());
        stopped.push(Stopped {
            recycling,
            since: tick,
            reported: false,
        });
    }

    /// Stops every recycling of `retired`.
    pub fn stop_all(&self, retired: impl IntoIterator<Item = Arc<Recycling>>, tick: u64) {
        for recycling in retired {
            self.stop(recycling, tick);
        }
    }

    /// Number of entries waiting in the stopped set.
    pub fn pending(&self) -> usize {
        self.stopped.lock().len()
    }

    /// Returns `true` if `id` is waiting in the stopped set.
    pub fn is_pending(&self, id: RecyclingId) -> bool {
        self.stopped.lock().iter().any(|s| s.recycling.id() == id)
    }

    /// Recyclings freed since creation.
    pub fn freed_total(&self) -> u64 {
        self.freed_total.load(Ordering::Relaxed)
    }

    /// Frees every collectible entry.
    pub fn collect(&self, recall: &RecallEngine, tick: u64) -> GcReport {
        let mut report = GcReport::default();
        let overdue_after = self.overdue_after_ticks;
        self.stopped.lock().retain_mut(|entry| {
            let recycling = &entry.recycling;
            if recycling.is_unreferenced() && !recall.scopes_recycling(recycling.id()) {
                match recycling.free() {
                    Ok(()) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(
                            "gc_free: {} after {} ticks",
                            recycling.id(),
                            tick.saturating_sub(entry.since)
                        );
                        report.freed += 1;
                    }
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("gc_free: {_err}");
                    }
                }
                return false;
            }

            report.pending += 1;
            if tick.saturating_sub(entry.since) > overdue_after {
                report.overdue += 1;
                if !entry.reported {
                    entry.reported = true;
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "gc_overdue: {} pending for {} ticks (attached={}, in_flight={})",
                        recycling.id(),
                        tick.saturating_sub(entry.since),
                        recycling.attached(),
                        recycling.in_flight()
                    );
                }
            }
            true
        });
        self.freed_total.fetch_add(report.freed as u64, Ordering::Relaxed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AudioDesc, AudioGraph, Direction};
    use crate::recall::{RecallScope, RecallTemplate, SoundScope, Volume};
    use crate::timing::TickTiming;

    #[test]
    fn test_unreferenced_entries_are_freed() {
        let mut graph = AudioGraph::default();
        let audio = graph.add_audio(AudioDesc::new("a")).unwrap();
        let rewire = graph.remove_audio(audio).unwrap();
        let gc = RecyclingGc::default();
        let retired: Vec<_> = rewire.retired.clone();
        gc.stop_all(rewire.retired, 0);
        assert_eq!(gc.pending(), 4);

        let report = gc.collect(&RecallEngine::new(), 1);
        assert_eq!(report, GcReport { freed: 4, pending: 0, overdue: 0 });
        assert!(retired.iter().all(|r| r.is_freed()));
        assert_eq!(gc.freed_total(), 4);
    }

    #[test]
    fn test_referenced_entries_wait_for_their_run() {
        let mut graph = AudioGraph::default();
        let audio = graph
            .add_audio(
                AudioDesc::new("a")
                    .with_pads(1, 0)
                    .with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(1.0)).persistent()),
            )
            .unwrap();
        let engine = RecallEngine::new();
        let id = engine.start(&graph, audio, SoundScope::Playback).unwrap();
        let timing = TickTiming::default();
        engine.advance_scope(SoundScope::Playback, &timing);

        let channel = graph.nth(audio, Direction::Input, 0).unwrap();
        let home = Arc::clone(graph.channel(channel).unwrap().recycling());
        engine.cancel_audio(audio);
        let rewire = graph.remove_audio(audio).unwrap();
        let gc = RecyclingGc::new(1);
        gc.stop_all(rewire.retired, 0);

        let before = gc.collect(&engine, 0);
        assert_eq!(before.freed, 0);
        assert_eq!(before.pending, 2);
        assert!(!home.is_freed());

        engine.advance_scope(SoundScope::Playback, &timing);
        assert!(!engine.is_active(id));
        let after = gc.collect(&engine, 1);
        assert_eq!(after.freed, 2);
        assert!(home.is_freed());
    }

    #[test]
    fn test_overdue_is_reported_not_forced() {
        let mut graph = AudioGraph::default();
        let audio = graph
            .add_audio(
                AudioDesc::new("a")
                    .with_pads(1, 0)
                    .with_audio_channels(1)
                    .with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(1.0)).persistent()),
            )
            .unwrap();
        let engine = RecallEngine::new();
        engine.start(&graph, audio, SoundScope::Playback).unwrap();
        let rewire = graph.remove_audio(audio).unwrap();
        let gc = RecyclingGc::new(2);
        gc.stop_all(rewire.retired, 0);

        assert_eq!(gc.collect(&engine, 2).overdue, 0);
        let report = gc.collect(&engine, 3);
        assert_eq!(report, GcReport { freed: 0, pending: 1, overdue: 1 });
        assert_eq!(gc.pending(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut graph = AudioGraph::default();
        let audio = graph.add_audio(AudioDesc::new("a").with_pads(1, 0)).unwrap();
        let channel = graph.nth(audio, Direction::Input, 0).unwrap();
        let home = Arc::clone(graph.channel(channel).unwrap().recycling());
        let gc = RecyclingGc::default();
        gc.stop(Arc::clone(&home), 0);
        gc.stop(Arc::clone(&home), 1);
        assert_eq!(gc.pending(), 1);
        assert!(gc.is_pending(home.id()));
    }
}
