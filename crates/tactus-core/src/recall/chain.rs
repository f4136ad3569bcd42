//! Per-run instance chains.
//!
//! A [`RunChain`] is the private state of one [`RecallId`]: a fresh processor
//! for every recall instance of the audios it covers, the recycling each of
//! them is bound to, and the stream it writes. Two runs on the same audio
//! share nothing but the recyclings themselves, and inside a recycling each
//! run owns its own [`AudioSignal`], so cancelling one run can never disturb
//! another run's frames.
//!
//! Per tick the chain runs stage-major: every instance goes through RUN_PRE
//! before any instance starts RUN_INTER. Within a stage, upstream audios run
//! before the audios they feed, and inputs before outputs, so an output
//! mixing its inputs (or an input reading its linked peer) always sees the
//! frame published earlier in the same tick.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use super::RecallId;
use super::event::RecallEvent;
use super::processor::{ChannelInfo, RecallProcessor, RunContext, RunControl};
use super::state::{RecallState, Stage};
use super::template::{Recall, RecallScope};
use crate::error::{RecallError, panic_message};
use crate::graph::{
    AudioGraph, AudioId, AudioSignal, Channel, ChannelId, Direction, Frame, Recycling, RecyclingId,
};
use crate::timing::TickTiming;

/// Read-only context shared by every hook call of one stage.
struct Base<'a> {
    recall_id: RecallId,
    audio: AudioId,
    samplerate: u32,
    timing: &'a TickTiming,
}

impl<'a> Base<'a> {
    fn context<'b>(
        &self,
        channel: Option<ChannelInfo>,
        buffer: Option<&'b mut [f32]>,
        upstream: Option<&'b [f32]>,
        inputs: &'b [Frame],
    ) -> RunContext<'b>
    where
        'a: 'b,
    {
        RunContext {
            recall_id: self.recall_id,
            audio: self.audio,
            channel,
            samplerate: self.samplerate,
            timing: self.timing,
            buffer,
            upstream,
            inputs,
        }
    }
}

/// Side effects collected while stepping instances.
struct Effects<'a> {
    recall_id: RecallId,
    events: &'a mut Vec<RecallEvent>,
    finishing: &'a mut bool,
}

fn guarded<T>(recall: &str, hook: impl FnOnce() -> Result<T, RecallError>) -> Result<T, RecallError> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => Err(RecallError::Panicked {
            recall: recall.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// One recall instance inside a run.
struct RunInstance {
    name: String,
    scope: RecallScope,
    state: RecallState,
    persistent: bool,
    processor: Box<dyn RecallProcessor>,
    bound: Option<Arc<Recycling>>,
    reading: bool,
    cancel: bool,
    done: bool,
}

impl RunInstance {
    /// Spawns a run instance from a graph instance, attaching to `bound`.
    fn new(recall: &Recall, bound: Option<&Arc<Recycling>>) -> Option<Self> {
        let instance = recall.as_instance()?;
        if let Some(recycling) = bound {
            recycling.attach();
        }
        Some(Self {
            name: instance.name().to_string(),
            scope: instance.scope(),
            state: RecallState::Instantiated,
            persistent: instance.is_persistent(),
            processor: instance.spawn_processor(),
            bound: bound.cloned(),
            reading: false,
            cancel: false,
            done: false,
        })
    }

    fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    fn release(&mut self) {
        if let Some(recycling) = self.bound.take() {
            if self.reading {
                recycling.end_read();
            }
            recycling.detach();
        }
        self.reading = false;
    }

    fn terminate(&mut self, state: RecallState) {
        self.release();
        self.state = state;
    }

    fn rebind(&mut self, recycling: &Arc<Recycling>) {
        if !self.is_live() {
            return;
        }
        if let Some(old) = self.bound.replace(Arc::clone(recycling)) {
            old.detach();
        }
        recycling.attach();
    }

    fn fail(&mut self, error: RecallError, channel: Option<ChannelId>, fx: &mut Effects<'_>) {
        #[cfg(feature = "tracing")]
        tracing::warn!("recall_failed: '{}' in {}: {error}", self.name, fx.recall_id);
        self.terminate(RecallState::Cancelled);
        fx.events.push(RecallEvent::Cancel {
            recall_id: fx.recall_id,
            channel,
            recall: Some(self.name.clone()),
            error: Some(error),
        });
    }

    fn init(&mut self, stage: Stage, ctx: &mut RunContext<'_>, fx: &mut Effects<'_>) {
        let expected = match stage {
            Stage::InitPre => RecallState::Instantiated,
            Stage::InitInter => RecallState::InitPre,
            Stage::InitPost => RecallState::InitInter,
            _ => return,
        };
        if self.state != expected {
            return;
        }
        if self.cancel {
            self.terminate(RecallState::Done);
            return;
        }
        self.state = stage.state();
        let processor = &mut self.processor;
        if let Err(error) = guarded(&self.name, || processor.init(stage, ctx)) {
            self.fail(error, ctx.channel.map(|c| c.id), fx);
        }
    }

    fn step(&mut self, stage: Stage, ctx: &mut RunContext<'_>, fx: &mut Effects<'_>) {
        if !self.is_live() {
            return;
        }
        match stage {
            Stage::RunPre => {
                if self.state != RecallState::InitPost && self.state != RecallState::RunPost {
                    return;
                }
                if self.cancel {
                    self.terminate(RecallState::Done);
                    return;
                }
                self.state = RecallState::RunPre;
                if let Some(recycling) = &self.bound {
                    recycling.begin_read();
                }
                self.reading = true;
            }
            Stage::RunInter | Stage::RunPost => {
                if !self.reading {
                    return;
                }
                self.state = stage.state();
            }
            Stage::InitPre | Stage::InitInter | Stage::InitPost => {
                self.init(stage, ctx, fx);
                return;
            }
        }

        let channel = ctx.channel.map(|c| c.id);
        if !self.cancel {
            let processor = &mut self.processor;
            match guarded(&self.name, || processor.run(stage, ctx)) {
                Ok(RunControl::Continue) => {}
                Ok(RunControl::Done) => self.done = true,
                Ok(RunControl::Finish) => *fx.finishing = true,
                Err(error) => {
                    self.fail(error, channel, fx);
                    return;
                }
            }
        }

        if stage == Stage::RunPost {
            if let Some(recycling) = &self.bound {
                recycling.end_read();
            }
            self.reading = false;
            if self.cancel || (self.done && !self.persistent) {
                self.terminate(RecallState::Done);
            }
            self.done = false;
        }
    }
}

impl Drop for RunInstance {
    fn drop(&mut self) {
        self.release();
    }
}

fn channel_info(id: ChannelId, channel: &Channel) -> ChannelInfo {
    ChannelInfo {
        id,
        direction: channel.direction(),
        pad: channel.pad(),
        audio_channel: channel.audio_channel(),
        line: channel.line(),
    }
}

fn run_inter(
    instances: &mut [RunInstance],
    mut buffer: Option<&mut [f32]>,
    base: &Base<'_>,
    channel: ChannelInfo,
    upstream: Option<&[f32]>,
    inputs: &[Frame],
    fx: &mut Effects<'_>,
) {
    for instance in instances.iter_mut() {
        let mut ctx = base.context(Some(channel), buffer.as_deref_mut(), upstream, inputs);
        instance.step(Stage::RunInter, &mut ctx, fx);
    }
}

/// The instances of one run bound to one channel's recycling.
struct ChannelRun {
    info: ChannelInfo,
    recycling: Arc<Recycling>,
    signal: Option<Arc<AudioSignal>>,
    upstream: Option<Weak<Recycling>>,
    instances: Vec<RunInstance>,
    retiring: bool,
}

impl ChannelRun {
    fn from_graph(graph: &AudioGraph, id: ChannelId, recall_id: RecallId) -> Option<Self> {
        let channel = graph.channel(id)?;
        let recycling = Arc::clone(channel.recycling());
        let instances = channel
            .recalls()
            .iter()
            .filter_map(|r| RunInstance::new(r, Some(&recycling)))
            .collect();
        Some(Self {
            info: channel_info(id, channel),
            signal: recycling.signal_or_insert(recall_id),
            recycling,
            upstream: channel.upstream(),
            instances,
            retiring: false,
        })
    }

    fn has_live(&self) -> bool {
        self.instances.iter().any(RunInstance::is_live)
    }

    fn latest(&self) -> Option<Frame> {
        self.signal.as_ref().and_then(|s| s.latest())
    }

    fn cancel(&mut self) {
        self.retiring = true;
        for instance in &mut self.instances {
            instance.cancel = true;
        }
    }

    fn init_stage(&mut self, stage: Stage, base: &Base<'_>, fx: &mut Effects<'_>) {
        for instance in &mut self.instances {
            let mut ctx = base.context(Some(self.info), None, None, &[]);
            instance.init(stage, &mut ctx, fx);
        }
    }

    fn run_stage(&mut self, stage: Stage, base: &Base<'_>, inputs: &[Frame], fx: &mut Effects<'_>) {
        let Self {
            info,
            signal,
            upstream,
            instances,
            ..
        } = self;

        if stage != Stage::RunInter {
            for instance in instances.iter_mut() {
                let mut ctx = base.context(Some(*info), None, None, inputs);
                instance.step(stage, &mut ctx, fx);
            }
            return;
        }
        if !instances.iter().any(|i| i.reading) {
            return;
        }

        let upstream_frame = upstream
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|r| r.signal(base.recall_id))
            .and_then(|s| s.latest());
        let upstream_samples = upstream_frame.as_deref().map(Vec::as_slice);

        let mut ran = false;
        if let Some(signal) = signal {
            signal.publish_with(|buffer| {
                ran = true;
                run_inter(instances, Some(buffer), base, *info, upstream_samples, inputs, fx);
            });
        }
        if !ran {
            run_inter(instances, None, base, *info, upstream_samples, inputs, fx);
        }
    }
}

/// The instances of one run on one audio.
struct AudioRun {
    audio: AudioId,
    instances: Vec<RunInstance>,
    inputs: Vec<ChannelRun>,
    outputs: Vec<ChannelRun>,
    scratch: Vec<Frame>,
    removed: bool,
}

impl AudioRun {
    fn from_graph(graph: &AudioGraph, audio: AudioId, recall_id: RecallId) -> Option<Self> {
        let a = graph.audio(audio)?;
        let side = |direction| {
            a.channels(direction)
                .iter()
                .filter_map(|id| ChannelRun::from_graph(graph, *id, recall_id))
                .collect::<Vec<_>>()
        };
        Some(Self {
            audio,
            instances: a
                .recalls()
                .iter()
                .filter_map(|r| RunInstance::new(r, None))
                .collect(),
            inputs: side(Direction::Input),
            outputs: side(Direction::Output),
            scratch: Vec::new(),
            removed: false,
        })
    }

    fn side_mut(&mut self, direction: Direction) -> &mut Vec<ChannelRun> {
        match direction {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        }
    }

    fn channel_runs(&self) -> impl Iterator<Item = &ChannelRun> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    fn instances(&self) -> impl Iterator<Item = &RunInstance> {
        self.instances
            .iter()
            .chain(self.channel_runs().flat_map(|c| c.instances.iter()))
    }

    fn has_live(&self) -> bool {
        self.instances().any(RunInstance::is_live)
    }

    fn for_each_instance(&mut self, mut f: impl FnMut(&mut RunInstance)) {
        self.instances.iter_mut().for_each(&mut f);
        for run in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            run.instances.iter_mut().for_each(&mut f);
        }
    }

    fn init_stage(&mut self, stage: Stage, base: &Base<'_>, fx: &mut Effects<'_>) {
        for instance in &mut self.instances {
            let mut ctx = base.context(None, None, None, &[]);
            instance.init(stage, &mut ctx, fx);
        }
        for run in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            run.init_stage(stage, base, fx);
        }
    }

    fn run_stage(&mut self, stage: Stage, base: &Base<'_>, fx: &mut Effects<'_>) {
        for instance in &mut self.instances {
            let mut ctx = base.context(None, None, None, &[]);
            instance.step(stage, &mut ctx, fx);
        }
        for input in &mut self.inputs {
            input.run_stage(stage, base, &[], fx);
        }
        for output in &mut self.outputs {
            self.scratch.clear();
            if stage == Stage::RunInter {
                self.scratch.extend(
                    self.inputs
                        .iter()
                        .filter(|i| !i.retiring && i.info.audio_channel == output.info.audio_channel)
                        .filter_map(ChannelRun::latest),
                );
            }
            output.run_stage(stage, base, &self.scratch, fx);
        }
        self.scratch.clear();
    }

    /// Drops retiring channel runs without live instances, removing their streams.
    fn sweep(&mut self, recall_id: RecallId) {
        let keep = |run: &mut ChannelRun| {
            if run.retiring && !run.has_live() {
                run.recycling.remove_signal(recall_id);
                return false;
            }
            true
        };
        self.inputs.retain_mut(keep);
        self.outputs.retain_mut(keep);
    }
}

/// Private state of one run.
pub(crate) struct RunChain {
    recall_id: RecallId,
    root: AudioId,
    samplerate: u32,
    audios: Vec<AudioRun>,
    events: Vec<RecallEvent>,
    cancelled: bool,
    finishing: bool,
    ticks: u64,
}

impl RunChain {
    /// Maps a run onto `order` (upstream first, ending with `root`).
    pub(crate) fn build(graph: &AudioGraph, recall_id: RecallId, root: AudioId, order: &[AudioId]) -> Self {
        let samplerate = graph
            .audio(root)
            .map_or(0, |a| a.presets().samplerate);
        let audios: Vec<AudioRun> = order
            .iter()
            .filter_map(|audio| AudioRun::from_graph(graph, *audio, recall_id))
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "recall_start: {recall_id} on {root}, {} audios, {} instances",
            audios.len(),
            audios.iter().map(|a| a.instances().count()).sum::<usize>()
        );
        Self {
            recall_id,
            root,
            samplerate,
            audios,
            events: Vec::new(),
            cancelled: false,
            finishing: false,
            ticks: 0,
        }
    }

    pub(crate) fn recall_id(&self) -> RecallId {
        self.recall_id
    }

    pub(crate) fn root(&self) -> AudioId {
        self.root
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Runs one tick. `cancel_all` is the run-wide cooperative cancel flag.
    pub(crate) fn advance(&mut self, timing: &TickTiming, cancel_all: bool) -> Vec<RecallEvent> {
        if cancel_all && !self.cancelled {
            self.cancelled = true;
            self.events.push(RecallEvent::Cancel {
                recall_id: self.recall_id,
                channel: None,
                recall: None,
                error: None,
            });
            for audio in &mut self.audios {
                audio.for_each_instance(|i| i.cancel = true);
            }
        }

        let Self {
            recall_id,
            samplerate,
            audios,
            events,
            finishing,
            ..
        } = self;
        let mut fx = Effects {
            recall_id: *recall_id,
            events,
            finishing,
        };

        for stage in Stage::INIT {
            for audio in audios.iter_mut() {
                let base = Base {
                    recall_id: *recall_id,
                    audio: audio.audio,
                    samplerate: *samplerate,
                    timing,
                };
                audio.init_stage(stage, &base, &mut fx);
            }
        }
        for stage in Stage::RUN {
            for audio in audios.iter_mut() {
                let base = Base {
                    recall_id: *recall_id,
                    audio: audio.audio,
                    samplerate: *samplerate,
                    timing,
                };
                audio.run_stage(stage, &base, &mut fx);
            }
        }

        if self.finishing {
            for audio in &mut self.audios {
                audio.for_each_instance(|i| {
                    if i.is_live() {
                        i.terminate(RecallState::Done);
                    }
                });
            }
        }
        self.sweep();
        self.ticks += 1;
        core::mem::take(&mut self.events)
    }

    /// Events raised outside of `advance`, such as channel cancels.
    pub(crate) fn take_events(&mut self) -> Vec<RecallEvent> {
        core::mem::take(&mut self.events)
    }

    fn sweep(&mut self) {
        let recall_id = self.recall_id;
        for audio in &mut self.audios {
            audio.sweep(recall_id);
        }
        self.audios.retain(|a| {
            !(a.removed && !a.has_live() && a.inputs.is_empty() && a.outputs.is_empty())
        });
    }

    /// Returns `true` once every instance is terminal.
    pub(crate) fn is_complete(&self) -> bool {
        !self.audios.iter().any(AudioRun::has_live)
    }

    /// Drops every instance and removes the run's streams from all recyclings.
    pub(crate) fn release(&mut self) {
        for audio in self.audios.drain(..) {
            for run in audio.channel_runs() {
                run.recycling.remove_signal(self.recall_id);
            }
        }
    }

    /// Returns `true` if any channel run still references recycling `id`.
    pub(crate) fn scopes(&self, id: RecyclingId) -> bool {
        self.audios
            .iter()
            .flat_map(AudioRun::channel_runs)
            .any(|run| run.recycling.id() == id)
    }

    /// Cancels every instance on `audio`. The root audio cancels the whole run.
    pub(crate) fn cancel_audio(&mut self, audio: AudioId) -> bool {
        let Some(run) = self.audios.iter_mut().find(|a| a.audio == audio) else {
            return false;
        };
        run.removed = true;
        run.for_each_instance(|i| i.cancel = true);
        for channel in run.inputs.iter_mut().chain(run.outputs.iter_mut()) {
            channel.retiring = true;
        }
        true
    }

    /// Cancels the instances bound to `channel`.
    pub(crate) fn cancel_channel(&mut self, channel: ChannelId) -> bool {
        let mut hit = false;
        for audio in &mut self.audios {
            for run in audio.inputs.iter_mut().chain(audio.outputs.iter_mut()) {
                if run.info.id == channel && !run.retiring {
                    run.cancel();
                    hit = true;
                }
            }
        }
        if hit {
            self.events.push(RecallEvent::Cancel {
                recall_id: self.recall_id,
                channel: Some(channel),
                recall: None,
                error: None,
            });
        }
        hit
    }

    /// Adds runs for freshly created channels of `audio` and refreshes the
    /// layout of the surviving ones.
    pub(crate) fn extend(&mut self, graph: &AudioGraph, audio: AudioId, added: &[ChannelId]) {
        let recall_id = self.recall_id;
        let Some(run) = self.audios.iter_mut().find(|a| a.audio == audio && !a.removed) else {
            return;
        };
        for id in added {
            let Some(channel) = graph.channel(*id) else {
                continue;
            };
            if channel.audio() != audio {
                continue;
            }
            if let Some(fresh) = ChannelRun::from_graph(graph, *id, recall_id) {
                run.side_mut(channel.direction()).push(fresh);
            }
        }
        for side in [&mut run.inputs, &mut run.outputs] {
            for channel_run in side.iter_mut() {
                if let Some(channel) = graph.channel(channel_run.info.id) {
                    channel_run.info = channel_info(channel_run.info.id, channel);
                }
            }
            side.sort_by_key(|r| (r.retiring, r.info.line));
        }
    }

    /// Follows a channel whose home recycling was re-created.
    ///
    /// Channel-scoped instances move to the new recycling. Live
    /// recycling-scoped instances stay with the old one and are cancelled;
    /// fresh instances take their place on the new recycling. Finished ones
    /// are not replaced.
    pub(crate) fn rebind(&mut self, graph: &AudioGraph, id: ChannelId) {
        let recall_id = self.recall_id;
        let Some(channel) = graph.channel(id) else {
            return;
        };
        let Some(audio) = self
            .audios
            .iter_mut()
            .find(|a| a.audio == channel.audio() && !a.removed)
        else {
            return;
        };
        let runs = audio.side_mut(channel.direction());
        let Some(old) = runs.iter_mut().find(|r| r.info.id == id && !r.retiring) else {
            return;
        };
        if Arc::ptr_eq(&old.recycling, channel.recycling()) {
            return;
        }

        let recycling = Arc::clone(channel.recycling());
        let mut fresh = ChannelRun {
            info: channel_info(id, channel),
            signal: recycling.signal_or_insert(recall_id),
            recycling,
            upstream: channel.upstream(),
            instances: Vec::new(),
            retiring: false,
        };
        let mut kept = Vec::new();
        for (mut instance, recall) in core::mem::take(&mut old.instances)
            .into_iter()
            .zip(channel.recalls())
        {
            match instance.scope {
                // Terminal instances stay terminal; only live ones are replaced.
                RecallScope::Recycling if !instance.is_live() => kept.push(instance),
                RecallScope::Recycling => {
                    instance.cancel = true;
                    kept.push(instance);
                    if let Some(replacement) = RunInstance::new(recall, Some(&fresh.recycling)) {
                        fresh.instances.push(replacement);
                    }
                }
                RecallScope::Channel | RecallScope::Audio => {
                    instance.rebind(&fresh.recycling);
                    fresh.instances.push(instance);
                }
            }
        }
        old.instances = kept;
        old.retiring = true;
        runs.push(fresh);
        runs.sort_by_key(|r| (r.retiring, r.info.line));
        audio.sweep(recall_id);

        #[cfg(feature = "tracing")]
        tracing::debug!("recall_rebind: {recall_id} follows {id}");
    }

    /// Re-reads the upstream handle of an input channel.
    pub(crate) fn refresh_upstream(&mut self, graph: &AudioGraph, id: ChannelId) {
        let Some(channel) = graph.channel(id) else {
            return;
        };
        for audio in &mut self.audios {
            for run in &mut audio.inputs {
                if run.info.id == id && !run.retiring {
                    run.upstream = channel.upstream();
                }
            }
        }
    }

    /// Latest frames of the root audio's outputs, keyed by sub-channel.
    pub(crate) fn output_frames(&self) -> Vec<(u32, Frame)> {
        self.audios
            .iter()
            .filter(|a| a.audio == self.root)
            .flat_map(|a| a.outputs.iter())
            .filter(|r| !r.retiring)
            .filter_map(|r| r.latest().map(|f| (r.info.audio_channel, f)))
            .collect()
    }

    /// Name and state of every instance, for diagnostics.
    pub(crate) fn states(&self) -> Vec<(String, RecallState)> {
        self.audios
            .iter()
            .flat_map(AudioRun::instances)
            .map(|i| (i.name.clone(), i.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AudioDesc;
    use crate::recall::processor::{CountBeats, Tone, Volume};
    use crate::recall::{RecallTemplate, SoundScope};

    #[derive(Clone)]
    struct Explode;

    impl RecallProcessor for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn run(&mut self, stage: Stage, _ctx: &mut RunContext<'_>) -> Result<RunControl, RecallError> {
            if stage == Stage::RunInter {
                panic!("boom");
            }
            Ok(RunControl::Continue)
        }

        fn box_clone(&self) -> Box<dyn RecallProcessor> {
            Box::new(self.clone())
        }
    }

    fn id() -> RecallId {
        RecallId::new(SoundScope::Playback, 1)
    }

    fn graph_with(desc: AudioDesc) -> (AudioGraph, AudioId) {
        let mut graph = AudioGraph::default();
        let audio = graph.add_audio(desc).unwrap();
        (graph, audio)
    }

    #[test]
    fn test_build_attaches_instances() {
        let (graph, audio) = graph_with(
            AudioDesc::new("a")
                .with_pads(0, 1)
                .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(440.0, 0.5))),
        );
        let chain = RunChain::build(&graph, id(), audio, &[audio]);
        assert_eq!(chain.states().len(), 2);
        for channel in graph.audio(audio).unwrap().channels(Direction::Output) {
            let recycling = graph.channel(*channel).unwrap().recycling();
            assert_eq!(recycling.attached(), 1);
            assert!(chain.scopes(recycling.id()));
        }
    }

    #[test]
    fn test_advance_publishes_and_walks_states() {
        let (graph, audio) = graph_with(
            AudioDesc::new("a")
                .with_pads(0, 1)
                .with_template(RecallTemplate::new(RecallScope::Channel, Tone::new(440.0, 0.5))),
        );
        let mut chain = RunChain::build(&graph, id(), audio, &[audio]);
        let timing = TickTiming::default();
        assert!(chain.advance(&timing, false).is_empty());
        assert!(chain.states().iter().all(|(_, s)| *s == RecallState::RunPost));

        let out = graph.nth(audio, Direction::Output, 0).unwrap();
        let signal = graph.channel(out).unwrap().recycling().signal(id()).unwrap();
        assert_eq!(signal.cursor(), 1);
        assert!(signal.latest().unwrap().iter().any(|s| *s != 0.0));
        assert_eq!(graph.channel(out).unwrap().recycling().in_flight(), 0);
    }

    #[test]
    fn test_panic_cancels_only_that_instance() {
        let (graph, audio) = graph_with(
            AudioDesc::new("a")
                .with_pads(0, 1)
                .with_template(RecallTemplate::new(RecallScope::Channel, Explode))
                .with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(1.0))),
        );
        let mut chain = RunChain::build(&graph, id(), audio, &[audio]);
        let events = chain.advance(&TickTiming::default(), false);
        assert_eq!(events.len(), 2, "one cancel per channel");
        assert!(matches!(
            &events[0],
            RecallEvent::Cancel { error: Some(RecallError::Panicked { .. }), .. }
        ));

        let states = chain.states();
        let cancelled = states.iter().filter(|(_, s)| *s == RecallState::Cancelled).count();
        let running = states.iter().filter(|(_, s)| *s == RecallState::RunPost).count();
        assert_eq!((cancelled, running), (2, 2));
        let out = graph.nth(audio, Direction::Output, 0).unwrap();
        let recycling = graph.channel(out).unwrap().recycling();
        assert_eq!(recycling.in_flight(), 0);
        assert_eq!(recycling.attached(), 1, "only the volume instance stays attached");
    }

    #[test]
    fn test_cancel_is_observed_at_next_run_pre() {
        let (graph, audio) = graph_with(
            AudioDesc::new("a")
                .with_pads(1, 1)
                .with_template(RecallTemplate::new(RecallScope::Recycling, Volume::new(0.5)).persistent()),
        );
        let mut chain = RunChain::build(&graph, id(), audio, &[audio]);
        let timing = TickTiming::default();
        chain.advance(&timing, false);
        assert!(!chain.is_complete());

        let events = chain.advance(&timing, true);
        assert!(matches!(events[0], RecallEvent::Cancel { error: None, .. }));
        assert!(chain.is_complete());
        assert!(chain.states().iter().all(|(_, s)| *s == RecallState::Done));
        for recycling in graph.recyclings() {
            assert!(recycling.is_unreferenced());
        }
    }

    #[test]
    fn test_finish_completes_whole_run() {
        let (graph, audio) = graph_with(
            AudioDesc::new("a")
                .with_template(RecallTemplate::new(RecallScope::Audio, CountBeats::new(2, false)))
                .with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(1.0)).persistent()),
        );
        let mut chain = RunChain::build(&graph, id(), audio, &[audio]);
        let one = TickTiming {
            subdivisions: 1,
            ..TickTiming::default()
        };
        chain.advance(&one, false);
        assert!(!chain.is_complete());
        chain.advance(&one, false);
        assert!(chain.is_complete(), "persistent instances end with the run");
    }

    #[test]
    fn test_cancel_channel_retires_its_run() {
        let (graph, audio) = graph_with(
            AudioDesc::new("a")
                .with_pads(2, 0)
                .with_template(RecallTemplate::new(RecallScope::Channel, Volume::new(1.0)).persistent()),
        );
        let mut chain = RunChain::build(&graph, id(), audio, &[audio]);
        let target = graph.nth(audio, Direction::Input, 3).unwrap();
        let home = Arc::clone(graph.channel(target).unwrap().recycling());
        assert!(chain.cancel_channel(target));
        assert_eq!(chain.take_events().len(), 1);

        chain.advance(&TickTiming::default(), false);
        assert!(!chain.scopes(home.id()));
        assert_eq!(home.signal_count(), 0);
        assert!(home.is_unreferenced());
        assert!(!chain.is_complete());
    }

    #[test]
    fn test_relink_does_not_revive_cancelled_instances() {
        let (mut graph, a) = graph_with(
            AudioDesc::new("a")
                .with_pads(0, 1)
                .with_template(RecallTemplate::new(RecallScope::Recycling, Explode)),
        );
        let b = graph.add_audio(AudioDesc::new("b").with_pads(1, 0)).unwrap();
        let mut chain = RunChain::build(&graph, id(), a, &[a]);
        chain.advance(&TickTiming::default(), false);
        assert!(chain.states().iter().all(|(_, s)| *s == RecallState::Cancelled));
        assert!(chain.is_complete());

        let out = graph.nth(a, Direction::Output, 0).unwrap();
        let input = graph.nth(b, Direction::Input, 0).unwrap();
        graph.set_link(out, input).unwrap();
        chain.rebind(&graph, out);

        let states = chain.states();
        assert!(!states.is_empty());
        assert!(states.iter().all(|(_, s)| *s == RecallState::Cancelled), "{states:?}");
        assert!(chain.is_complete());
        assert_eq!(graph.channel(out).unwrap().recycling().attached(), 0);
    }
}
