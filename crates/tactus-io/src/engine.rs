//! The threaded engine.
//!
//! [`EngineContext`] owns one instance of everything in `tactus-core` and
//! drives it from a [`ThreadTree`]:
//!
//! ```text
//! soundcard clock ─▶ tactus-root   run:      drain queue, advance timing,
//!                         │                   advance unassigned scopes
//!                         ├─▶ tactus-playback  advance_scope(Playback)
//!                         ├─▶ tactus-export    advance_scope(Export)
//!                         │   ...
//!                    tactus-root   post_run: collect, mix, write
//! ```
//!
//! The graph and the timing converter sit behind one mutex that only the
//! root's `run` and [`EngineContext::with_graph`] take. Scope nodes read the
//! tick's [`TickTiming`] from an [`ArcSwap`] the root publishes before they
//! are woken, so the realtime path never waits on the graph lock.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tactus_core::gc::DEFAULT_OVERDUE_AFTER_TICKS;
use tactus_core::graph::DEFAULT_RING_LEN;
use tactus_core::timing::{DEFAULT_BPM, DEFAULT_DELAY_FACTOR};
use tactus_core::{
    AudioGraph, DrainReport, GcReport, Presets, RecallEngine, RecallEvent, RecyclingGc, SoundScope, Task,
    TaskContext, TaskQueue, TickTiming, TimingConverter,
};
use tactus_thread::{NodeContext, NodeId, NodeWork, ReturnablePool, SyncMode, ThreadTree, TreeConfig, TreeEvent, Watchdog};

use crate::soundcard::{Soundcard, StreamHandle, frame_len};
use crate::{Error, Result};

/// A sound scope and the thread that advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeNode {
    /// The scope.
    pub scope: SoundScope,
    /// How its thread follows the root.
    pub mode: SyncMode,
}

impl ScopeNode {
    /// A scope advanced in lockstep with the root.
    pub fn synced(scope: SoundScope) -> Self {
        Self {
            scope,
            mode: SyncMode::Synced,
        }
    }
}

/// Construction parameters for [`EngineContext`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Initial tempo.
    pub bpm: f64,
    /// Subdivision length relative to a sixteenth.
    pub delay_factor: f64,
    /// Loop range in subdivisions.
    pub loop_range: Option<(u64, u64)>,
    /// Scopes with a thread of their own. Every other scope is advanced by
    /// the root.
    pub scopes: Vec<ScopeNode>,
    /// Scope whose runs are mixed into the soundcard.
    pub output: SoundScope,
    /// Worker threads for fanning a scope's runs out. `0` disables the pool.
    pub workers: usize,
    /// Thread tree settings.
    pub tree: TreeConfig,
    /// Watchdog period; `None` disables background hang checks.
    pub watchdog_interval: Option<Duration>,
    /// Ticks a stopped recycling may stay pending before it is reported.
    pub overdue_after_ticks: u64,
    /// Frames kept per signal.
    pub ring_len: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            delay_factor: DEFAULT_DELAY_FACTOR,
            loop_range: None,
            scopes: vec![ScopeNode::synced(SoundScope::Playback), ScopeNode::synced(SoundScope::Export)],
            output: SoundScope::Playback,
            workers: 0,
            tree: TreeConfig::default(),
            watchdog_interval: Some(Duration::from_millis(50)),
            overdue_after_ticks: DEFAULT_OVERDUE_AFTER_TICKS,
            ring_len: DEFAULT_RING_LEN,
        }
    }
}

struct EngineCore {
    graph: AudioGraph,
    timing: TimingConverter,
    tick: u64,
}

struct Shared {
    core: Mutex<EngineCore>,
    queue: TaskQueue,
    recall: RecallEngine,
    gc: RecyclingGc,
    timing: ArcSwap<TickTiming>,
    soundcard: Mutex<Box<dyn Soundcard>>,
    presets: Presets,
    output: SoundScope,
    inline_scopes: Vec<SoundScope>,
    mix: Mutex<Vec<f32>>,
    last_drain: Mutex<DrainReport>,
    last_gc: Mutex<GcReport>,
}

struct RootWork {
    shared: Arc<Shared>,
}

impl NodeWork for RootWork {
    fn run(&mut self, ctx: &NodeContext<'_>) {
        let shared = &*self.shared;
        if ctx.coalesced > 0 {
            tracing::warn!("root: {} ticks coalesced into tick {}", ctx.coalesced, ctx.tick);
        }

        let timing = {
            let mut core = shared.core.lock();
            let EngineCore { graph, timing, tick } = &mut *core;
            let mut task_ctx = TaskContext {
                graph: &mut *graph,
                recall: &shared.recall,
                gc: &shared.gc,
                timing: &mut *timing,
                queue: &shared.queue,
                tick: *tick,
            };
            let report = shared.queue.drain(&mut task_ctx);
            if report.failed > 0 {
                tracing::debug!("root: {} tasks failed on tick {}", report.failed, tick);
            }
            *shared.last_drain.lock() = report;
            timing.tick()
        };

        for scope in &shared.inline_scopes {
            shared.recall.advance_scope(*scope, &timing);
        }
        shared.timing.store(Arc::new(timing));
    }

    fn post_run(&mut self, _ctx: &NodeContext<'_>) {
        let shared = &*self.shared;
        let tick = shared.core.lock().tick;
        let report = shared.gc.collect(&shared.recall, tick);
        *shared.last_gc.lock() = report;

        let mut mix = shared.mix.lock();
        mix.fill(0.0);
        shared
            .recall
            .mix_into(shared.output, &mut mix, usize::from(shared.presets.pcm_channels));
        if let Err(err) = shared.soundcard.lock().write(&mix) {
            tracing::warn!("root: soundcard write failed: {err}");
        }
        drop(mix);

        shared.core.lock().tick += 1;
    }

    fn on_stop(&mut self, ctx: &NodeContext<'_>) {
        tracing::debug!("root: stopped after {} ticks", ctx.tick);
    }
}

struct ScopeWork {
    shared: Arc<Shared>,
    scope: SoundScope,
    pool: Option<Arc<ReturnablePool>>,
}

impl NodeWork for ScopeWork {
    fn run(&mut self, _ctx: &NodeContext<'_>) {
        let timing = self.shared.timing.load_full();
        let recall = &self.shared.recall;

        if let Some(pool) = &self.pool {
            let chains = recall.chains(self.scope);
            if chains.len() > 1 {
                let shared = Arc::clone(&self.shared);
                let fanned = pool.fan_out(chains, move |handle| {
                    shared.recall.advance_chain(&handle, &timing);
                });
                if let Err(err) = fanned {
                    tracing::error!("{}: pooled advance failed: {err}", self.scope);
                }
                recall.reap(self.scope);
                return;
            }
        }
        recall.advance_scope(self.scope, &timing);
    }
}

/// A running engine: core state, thread tree and soundcard.
///
/// # Teardown
///
/// [`shutdown`](Self::shutdown) (or drop) tears down in this order:
///
/// 1. the soundcard stream is dropped, so no further ticks are requested
/// 2. the watchdog stops
/// 3. the thread tree stops and joins; every node finishes its current tick
/// 4. every run still live is cancelled and advanced once more, so it ends
///    with a `Done` event and releases its signals
/// 5. a last GC pass frees whatever that released
pub struct EngineContext {
    shared: Arc<Shared>,
    tree: ThreadTree,
    scope_nodes: Vec<(SoundScope, NodeId)>,
    pool: Option<Arc<ReturnablePool>>,
    watchdog: Option<Watchdog>,
    stream: Option<StreamHandle>,
    torn_down: bool,
}

impl EngineContext {
    /// Builds the engine, starts its threads and then the soundcard.
    pub fn init(settings: EngineSettings, soundcard: impl Soundcard) -> Result<Self> {
        let mut assigned = Vec::with_capacity(settings.scopes.len());
        for node in &settings.scopes {
            if assigned.contains(&node.scope) {
                return Err(Error::DuplicateScope(node.scope));
            }
            assigned.push(node.scope);
        }

        let presets = soundcard.presets();
        let mut timing = TimingConverter::from_presets(&presets, settings.bpm, settings.delay_factor)?;
        timing.set_loop(settings.loop_range)?;

        let pool = match settings.workers {
            0 => None,
            n => Some(Arc::new(ReturnablePool::new(n)?)),
        };

        let shared = Arc::new(Shared {
            core: Mutex::new(EngineCore {
                graph: AudioGraph::new(settings.ring_len),
                timing,
                tick: 0,
            }),
            queue: TaskQueue::new(),
            recall: RecallEngine::new(),
            gc: RecyclingGc::new(settings.overdue_after_ticks),
            timing: ArcSwap::from_pointee(TickTiming::default()),
            presets,
            output: settings.output,
            inline_scopes: SoundScope::ALL
                .into_iter()
                .filter(|scope| !assigned.contains(scope))
                .collect(),
            mix: Mutex::new(vec![0.0; frame_len(&presets)]),
            last_drain: Mutex::new(DrainReport::default()),
            last_gc: Mutex::new(GcReport::default()),
            soundcard: Mutex::new(Box::new(soundcard)),
        });

        let tree = ThreadTree::new(
            "tactus-root",
            RootWork {
                shared: Arc::clone(&shared),
            },
            settings.tree,
        );
        let mut scope_nodes = Vec::with_capacity(settings.scopes.len());
        for node in &settings.scopes {
            let id = tree.add_child(
                tree.root(),
                format!("tactus-{}", node.scope),
                node.mode,
                ScopeWork {
                    shared: Arc::clone(&shared),
                    scope: node.scope,
                    pool: pool.clone(),
                },
            )?;
            scope_nodes.push((node.scope, id));
        }

        let mut ctx = Self {
            shared,
            tree,
            scope_nodes,
            pool,
            watchdog: None,
            stream: None,
            torn_down: false,
        };

        ctx.tree.start(ctx.tree.root())?;
        ctx.watchdog = settings
            .watchdog_interval
            .map(|interval| Watchdog::spawn(ctx.tree.clone(), interval))
            .transpose()?;

        let clock = ctx.tree.clone();
        let mut soundcard = ctx.shared.soundcard.lock();
        let stream = soundcard.start(Box::new(move || {
            clock.tick();
        }))?;
        tracing::info!(
            "engine: started on '{}' ({} Hz, {} frames, {} scope threads)",
            soundcard.name(),
            presets.samplerate,
            presets.buffer_size,
            ctx.scope_nodes.len()
        );
        drop(soundcard);
        ctx.stream = Some(stream);
        Ok(ctx)
    }

    /// Stream format of the soundcard.
    pub fn presets(&self) -> Presets {
        self.shared.presets
    }

    /// Queues a task for the next tick.
    pub fn append(&self, task: impl Task + 'static) {
        self.shared.queue.append(task);
    }

    /// The task queue, for cyclic tasks and direct inspection.
    pub fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }

    /// Live runs.
    pub fn recall(&self) -> &RecallEngine {
        &self.shared.recall
    }

    /// The recycling collector.
    pub fn gc(&self) -> &RecyclingGc {
        &self.shared.gc
    }

    /// The thread tree driving the engine.
    pub fn tree(&self) -> &ThreadTree {
        &self.tree
    }

    /// Thread node assigned to `scope`, if any.
    pub fn scope_node(&self, scope: SoundScope) -> Option<NodeId> {
        self.scope_nodes
            .iter()
            .find(|(s, _)| *s == scope)
            .map(|(_, id)| *id)
    }

    /// Subscribes to run lifecycle events.
    pub fn subscribe(&self) -> Receiver<RecallEvent> {
        self.shared.recall.subscribe()
    }

    /// Subscribes to thread lifecycle events.
    pub fn tree_events(&self) -> Receiver<TreeEvent> {
        self.tree.subscribe()
    }

    /// Timing of the most recent tick.
    pub fn timing(&self) -> Arc<TickTiming> {
        self.shared.timing.load_full()
    }

    /// Ticks fully processed so far.
    pub fn tick_count(&self) -> u64 {
        self.shared.core.lock().tick
    }

    /// Outcome of the most recent queue drain.
    pub fn last_drain(&self) -> DrainReport {
        *self.shared.last_drain.lock()
    }

    /// Outcome of the most recent GC pass.
    pub fn last_gc(&self) -> GcReport {
        *self.shared.last_gc.lock()
    }

    /// Runs `f` against the graph. The root's next tick waits until `f`
    /// returns, so keep it short; mutations go through tasks.
    pub fn with_graph<R>(&self, f: impl FnOnce(&AudioGraph) -> R) -> R {
        f(&self.shared.core.lock().graph)
    }

    /// Requests one tick and waits for it to close. Meant for soundcards
    /// without a clock of their own.
    pub fn step(&self, timeout: Duration) -> Result<u64> {
        Ok(self.tree.tick_and_wait(timeout)?)
    }

    /// Steps `n` ticks, each with its own `timeout`.
    pub fn run_ticks(&self, n: u64, timeout: Duration) -> Result<()> {
        for _ in 0..n {
            self.step(timeout)?;
        }
        Ok(())
    }

    /// Tears the engine down. See the type docs for the order.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        drop(self.stream.take());
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        self.tree.shutdown();

        let shared = &*self.shared;
        let timing = shared.timing.load_full();
        let mut cancelled = 0;
        for scope in SoundScope::ALL {
            let n = shared.recall.cancel_scope(scope);
            if n > 0 {
                shared.recall.advance_scope(scope, &timing);
                cancelled += n;
            }
        }
        let tick = shared.core.lock().tick;
        let report = shared.gc.collect(&shared.recall, tick);
        self.pool = None;

        tracing::info!(
            "engine: shut down after {} ticks ({} runs cancelled, {} recyclings freed, {} pending)",
            tick,
            cancelled,
            report.freed,
            report.pending
        );
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OfflineSoundcard;

    fn settings() -> EngineSettings {
        EngineSettings {
            watchdog_interval: None,
            ..EngineSettings::default()
        }
    }

    #[test]
    fn test_duplicate_scope_is_rejected() {
        let mut s = settings();
        s.scopes.push(ScopeNode::synced(SoundScope::Playback));
        let err = EngineContext::init(s, OfflineSoundcard::new(Presets::default())).err();
        assert!(matches!(err, Some(Error::DuplicateScope(SoundScope::Playback))));
    }

    #[test]
    fn test_scope_nodes_are_named_children_of_root() {
        let engine = EngineContext::init(settings(), OfflineSoundcard::new(Presets::default())).unwrap();
        let tree = engine.tree();
        let playback = engine.scope_node(SoundScope::Playback).unwrap();
        assert_eq!(tree.parent(playback).unwrap(), Some(tree.root()));
        assert_eq!(tree.name(playback).unwrap(), "tactus-playback");
        assert!(engine.scope_node(SoundScope::Midi).is_none());
        engine.shutdown();
    }

    #[test]
    fn test_step_advances_tick_and_timing() {
        let engine = EngineContext::init(settings(), OfflineSoundcard::new(Presets::default())).unwrap();
        engine.run_ticks(3, Duration::from_secs(5)).unwrap();
        assert_eq!(engine.tick_count(), 3);
        assert_eq!(engine.timing().tick, 2);
        assert_eq!(engine.timing().sample_offset, 2 * 512);
        engine.shutdown();
    }

    #[test]
    fn test_invalid_tempo_is_rejected() {
        let s = EngineSettings {
            bpm: 0.0,
            ..settings()
        };
        let err = EngineContext::init(s, OfflineSoundcard::new(Presets::default())).err();
        assert!(matches!(err, Some(Error::Timing(_))));
    }
}
