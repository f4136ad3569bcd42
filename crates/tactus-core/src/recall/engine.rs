//! The recall engine: every live run, grouped by sound scope.
//!
//! Structural calls (`start`, the cancels, [`RecallEngine::apply_rewire`])
//! come from the thread draining the task queue. `advance_*` calls come from
//! whichever realtime thread owns a scope. Both sides meet only on the
//! per-run mutex, which an `advance` holds for exactly one tick of one run,
//! so a structural change lands between two ticks of that run, never inside
//! one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use super::chain::RunChain;
use super::event::RecallEvent;
use super::id::{RecallId, RecallIdAllocator, SoundScope};
use super::state::RecallState;
use crate::error::RecallError;
use crate::graph::{AudioGraph, AudioId, ChannelId, RecyclingId, Rewire};
use crate::timing::TickTiming;

/// Notifications buffered before further events are dropped.
pub const EVENT_CAPACITY: usize = 1024;

/// Handle to one live run.
pub struct ChainHandle {
    recall_id: RecallId,
    root: AudioId,
    cancel: AtomicBool,
    chain: Mutex<RunChain>,
}

impl ChainHandle {
    /// The run's id.
    pub fn recall_id(&self) -> RecallId {
        self.recall_id
    }

    /// Audio the run was started on.
    pub fn root(&self) -> AudioId {
        self.root
    }

    /// Returns `true` once a run-wide cancel was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Ticks processed so far.
    pub fn ticks(&self) -> u64 {
        self.chain.lock().ticks()
    }
}

impl core::fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChainHandle")
            .field("recall_id", &self.recall_id)
            .field("root", &self.root)
            .field("cancel", &self.is_cancel_requested())
            .finish_non_exhaustive()
    }
}

type Chains = Mutex<Vec<Arc<ChainHandle>>>;

/// Live runs of every sound scope.
pub struct RecallEngine {
    ids: RecallIdAllocator,
    scopes: [Chains; SoundScope::ALL.len()],
    events_tx: Sender<RecallEvent>,
    events_rx: Receiver<RecallEvent>,
}

impl Default for RecallEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecallEngine {
    /// Creates an engine with no runs.
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        Self {
            ids: RecallIdAllocator::new(),
            scopes: core::array::from_fn(|_| Mutex::new(Vec::new())),
            events_tx,
            events_rx,
        }
    }

    /// Receiver for lifecycle notifications. Every clone competes for the
    /// same events.
    pub fn subscribe(&self) -> Receiver<RecallEvent> {
        self.events_rx.clone()
    }

    /// Publishes a notification without blocking.
    pub fn notify(&self, event: RecallEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_event)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("recall_event_dropped: {_event:?}");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn notify_all(&self, events: Vec<RecallEvent>) {
        for event in events {
            self.notify(event);
        }
    }

    fn chains_of(&self, scope: SoundScope) -> &Chains {
        &self.scopes[scope.index()]
    }

    /// Starts a run on `audio` and every audio linked upstream of it.
    pub fn start(&self, graph: &AudioGraph, audio: AudioId, scope: SoundScope) -> Result<RecallId, RecallError> {
        let order = graph.upstream_order(audio)?;
        let recall_id = self.ids.allocate(scope);
        let chain = RunChain::build(graph, recall_id, audio, &order);
        self.chains_of(scope).lock().push(Arc::new(ChainHandle {
            recall_id,
            root: audio,
            cancel: AtomicBool::new(false),
            chain: Mutex::new(chain),
        }));
        self.notify(RecallEvent::Started { recall_id, audio });
        Ok(recall_id)
    }

    /// Snapshot of the live runs of `scope`.
    pub fn chains(&self, scope: SoundScope) -> Vec<Arc<ChainHandle>> {
        self.chains_of(scope).lock().clone()
    }

    /// Ids of the live runs of `scope`.
    pub fn active(&self, scope: SoundScope) -> Vec<RecallId> {
        self.chains_of(scope)
            .lock()
            .iter()
            .map(|h| h.recall_id)
            .collect()
    }

    /// Returns `true` while `recall_id` has not been reaped.
    pub fn is_active(&self, recall_id: RecallId) -> bool {
        self.handle(recall_id).is_some()
    }

    /// Number of live runs across all scopes.
    pub fn run_count(&self) -> usize {
        self.scopes.iter().map(|s| s.lock().len()).sum()
    }

    fn handle(&self, recall_id: RecallId) -> Option<Arc<ChainHandle>> {
        self.chains_of(recall_id.scope())
            .lock()
            .iter()
            .find(|h| h.recall_id == recall_id)
            .cloned()
    }

    fn for_each_chain(&self, mut f: impl FnMut(&ChainHandle)) {
        for scope in SoundScope::ALL {
            for handle in self.chains(scope) {
                f(&handle);
            }
        }
    }

    /// Name and state of every instance of `recall_id`.
    pub fn instance_states(&self, recall_id: RecallId) -> Option<Vec<(String, RecallState)>> {
        self.handle(recall_id).map(|h| h.chain.lock().states())
    }

    /// Requests a cooperative cancel of a whole run. The run observes it at
    /// its next RUN_PRE boundary.
    pub fn cancel(&self, recall_id: RecallId) -> Result<(), RecallError> {
        let handle = self
            .handle(recall_id)
            .ok_or(RecallError::UnknownRecallId(recall_id))?;
        handle.cancel.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::debug!("recall_cancel: {recall_id}");
        Ok(())
    }

    /// Cancels every run of `scope`. Returns how many were cancelled.
    pub fn cancel_scope(&self, scope: SoundScope) -> usize {
        let chains = self.chains(scope);
        for handle in &chains {
            handle.cancel.store(true, Ordering::Release);
        }
        chains.len()
    }

    /// Cancels everything running on `audio`: runs rooted there are
    /// cancelled whole, other runs lose the instances of that audio.
    pub fn cancel_audio(&self, audio: AudioId) -> usize {
        let mut hits = 0;
        self.for_each_chain(|handle| {
            if handle.root == audio {
                handle.cancel.store(true, Ordering::Release);
                hits += 1;
            } else if handle.chain.lock().cancel_audio(audio) {
                hits += 1;
            }
        });
        hits
    }

    /// Cancels the instances bound to `channel` in every run.
    pub fn cancel_channel(&self, channel: ChannelId) -> usize {
        let mut hits = 0;
        let mut events = Vec::new();
        self.for_each_chain(|handle| {
            let mut chain = handle.chain.lock();
            if chain.cancel_channel(channel) {
                hits += 1;
            }
            events.extend(chain.take_events());
        });
        self.notify_all(events);
        hits
    }

    /// Brings every run in line with a structural change of the graph.
    ///
    /// New channels join the runs of their audio; rebound channels move
    /// their instances to the new home recycling; refreshed inputs re-read
    /// their upstream. Removed channels are left to explicit cancels.
    pub fn apply_rewire(&self, graph: &AudioGraph, rewire: &Rewire) {
        let mut audios: Vec<AudioId> = rewire
            .added
            .iter()
            .filter_map(|c| graph.channel(*c).map(|ch| ch.audio()))
            .collect();
        audios.sort_unstable();
        audios.dedup();

        self.for_each_chain(|handle| {
            let mut chain = handle.chain.lock();
            for audio in &audios {
                chain.extend(graph, *audio, &rewire.added);
            }
            for channel in &rewire.rebound {
                chain.rebind(graph, *channel);
            }
            for channel in &rewire.refreshed {
                chain.refresh_upstream(graph, *channel);
            }
        });
    }

    /// Runs one tick of one run and publishes its events.
    pub fn advance_chain(&self, handle: &ChainHandle, timing: &TickTiming) {
        let events = handle
            .chain
            .lock()
            .advance(timing, handle.cancel.load(Ordering::Acquire));
        self.notify_all(events);
    }

    /// Runs one tick of every run of `scope`, then reaps finished runs.
    pub fn advance_scope(&self, scope: SoundScope, timing: &TickTiming) -> usize {
        for handle in self.chains(scope) {
            self.advance_chain(&handle, timing);
        }
        self.reap(scope)
    }

    /// Removes runs whose instances are all terminal, releasing their streams
    /// and emitting `Done`. Returns how many were reaped.
    pub fn reap(&self, scope: SoundScope) -> usize {
        let finished: Vec<Arc<ChainHandle>> = {
            let mut chains = self.chains_of(scope).lock();
            let (done, live): (Vec<_>, Vec<_>) = chains
                .drain(..)
                .partition(|h| h.chain.lock().is_complete());
            *chains = live;
            done
        };
        for handle in &finished {
            let mut chain = handle.chain.lock();
            chain.release();

            #[cfg(feature = "tracing")]
            tracing::debug!("recall_done: {} after {} ticks", chain.recall_id(), chain.ticks());
            self.notify(RecallEvent::Done {
                recall_id: chain.recall_id(),
                audio: chain.root(),
            });
        }
        finished.len()
    }

    /// Returns `true` if any run in any scope still references recycling `id`.
    pub fn scopes_recycling(&self, id: RecyclingId) -> bool {
        SoundScope::ALL.into_iter().any(|scope| {
            self.chains_of(scope)
                .lock()
                .iter()
                .any(|h| h.chain.lock().scopes(id))
        })
    }

    /// Sums the latest output frames of every run of `scope` into the
    /// interleaved `out` buffer. Sub-channels wrap onto `pcm_channels`.
    pub fn mix_into(&self, scope: SoundScope, out: &mut [f32], pcm_channels: usize) {
        if pcm_channels == 0 {
            return;
        }
        for handle in self.chains(scope) {
            for (audio_channel, frame) in handle.chain.lock().output_frames() {
                let lane = audio_channel as usize % pcm_channels;
                for (i, sample) in frame.iter().enumerate() {
                    if let Some(slot) = out.get_mut(i * pcm_channels + lane) {
                        *slot += *sample;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AudioDesc, Direction};
    use crate::recall::processor::{CountBeats, Tone};
    use crate::recall::{RecallScope, RecallTemplate};

    fn tone_audio(graph: &mut AudioGraph) -> AudioId {
        graph
            .add_audio(
                AudioDesc::new("tone")
                    .with_pads(0, 1)
                    .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(220.0, 0.5)).persistent()),
            )
            .unwrap()
    }

    #[test]
    fn test_start_emits_started() {
        let mut graph = AudioGraph::default();
        let audio = tone_audio(&mut graph);
        let engine = RecallEngine::new();
        let events = engine.subscribe();
        let id = engine.start(&graph, audio, SoundScope::Playback).unwrap();
        assert_eq!(events.try_recv().unwrap(), RecallEvent::Started { recall_id: id, audio });
        assert_eq!(engine.active(SoundScope::Playback), vec![id]);
        assert!(engine.active(SoundScope::Export).is_empty());
    }

    #[test]
    fn test_cancel_unknown_id() {
        let engine = RecallEngine::new();
        let id = RecallId::new(SoundScope::Wave, 99);
        assert_eq!(engine.cancel(id), Err(RecallError::UnknownRecallId(id)));
    }

    #[test]
    fn test_cancel_then_reap_emits_done() {
        let mut graph = AudioGraph::default();
        let audio = tone_audio(&mut graph);
        let engine = RecallEngine::new();
        let events = engine.subscribe();
        let id = engine.start(&graph, audio, SoundScope::Playback).unwrap();
        let timing = TickTiming::default();
        assert_eq!(engine.advance_scope(SoundScope::Playback, &timing), 0);

        engine.cancel(id).unwrap();
        assert_eq!(engine.advance_scope(SoundScope::Playback, &timing), 1);
        assert!(!engine.is_active(id));
        let received: Vec<_> = events.try_iter().collect();
        assert!(matches!(received[1], RecallEvent::Cancel { error: None, .. }));
        assert_eq!(received[2], RecallEvent::Done { recall_id: id, audio });

        let out = graph.nth(audio, Direction::Output, 0).unwrap();
        let recycling = graph.channel(out).unwrap().recycling();
        assert_eq!(recycling.signal_count(), 0, "per-run streams are released");
        assert!(!engine.scopes_recycling(recycling.id()));
    }

    #[test]
    fn test_count_beats_completes_run() {
        let mut graph = AudioGraph::default();
        let audio = graph
            .add_audio(
                AudioDesc::new("counter")
                    .with_template(RecallTemplate::new(RecallScope::Audio, CountBeats::new(3, false))),
            )
            .unwrap();
        let engine = RecallEngine::new();
        engine.start(&graph, audio, SoundScope::Sequencer).unwrap();
        let timing = TickTiming {
            subdivisions: 1,
            ..TickTiming::default()
        };
        let reaped: Vec<usize> = (0..3)
            .map(|_| engine.advance_scope(SoundScope::Sequencer, &timing))
            .collect();
        assert_eq!(reaped, vec![0, 0, 1]);
    }

    #[test]
    fn test_mix_into_interleaves_sub_channels() {
        let mut graph = AudioGraph::default();
        let audio = tone_audio(&mut graph);
        let engine = RecallEngine::new();
        engine.start(&graph, audio, SoundScope::Playback).unwrap();
        engine.advance_scope(SoundScope::Playback, &TickTiming::default());

        let mut out = vec![0.0_f32; 512 * 2];
        engine.mix_into(SoundScope::Playback, &mut out, 2);
        assert!(out.iter().any(|s| *s != 0.0));
        // both sub-channels carry the same tone
        assert_eq!(out[20], out[21]);
    }

    #[test]
    fn test_upstream_audio_joins_run() {
        let mut graph = AudioGraph::default();
        let src = tone_audio(&mut graph);
        let dst = graph.add_audio(AudioDesc::new("dst")).unwrap();
        let rewire = graph
            .set_link(
                graph.nth(src, Direction::Output, 0).unwrap(),
                graph.nth(dst, Direction::Input, 0).unwrap(),
            )
            .unwrap();
        let engine = RecallEngine::new();
        engine.apply_rewire(&graph, &rewire);
        let id = engine.start(&graph, dst, SoundScope::Playback).unwrap();
        assert_eq!(engine.instance_states(id).unwrap().len(), 2);
    }
}
