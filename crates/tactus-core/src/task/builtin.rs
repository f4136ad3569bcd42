//! Built-in tasks for the structural and timing changes the engine supports.
//!
//! Tasks that produce a value answer through an optional [`Reply`] sender,
//! with `Ok` from `launch` and `Err` from `failure`. Replies use `try_send`,
//! so a full or dropped receiver never stalls the draining thread.

use crossbeam_channel::Sender;

use super::{Task, TaskContext};
use crate::error::{GraphError, TaskError};
use crate::graph::{AudioDesc, AudioGraph, AudioId, ChannelId, Direction};
use crate::recall::{RecallEvent, RecallId, SoundScope};

/// Where a task sends its outcome.
pub type Reply<T> = Sender<Result<T, TaskError>>;

fn answer<T>(reply: &Option<Reply<T>>, value: Result<T, TaskError>) {
    if let Some(tx) = reply {
        let _ = tx.try_send(value);
    }
}

fn log_failure(_name: &str, _error: &TaskError) {
    #[cfg(feature = "tracing")]
    tracing::warn!("task_failed: '{_name}': {_error}");
}

fn notify_resize(ctx: &TaskContext<'_>, audio: AudioId) {
    if let Some(a) = ctx.graph.audio(audio) {
        ctx.recall.notify(RecallEvent::Resize {
            audio,
            audio_channels: a.audio_channels(),
            input_pads: a.input_pads(),
            output_pads: a.output_pads(),
        });
    }
}

fn layout(graph: &AudioGraph, audio: AudioId) -> Vec<(ChannelId, Direction, u32)> {
    let Some(a) = graph.audio(audio) else {
        return Vec::new();
    };
    [Direction::Input, Direction::Output]
        .into_iter()
        .flat_map(|direction| a.channels(direction).iter().map(move |id| (*id, direction)))
        .filter_map(|(id, direction)| graph.channel(id).map(|c| (id, direction, c.pad())))
        .collect()
}

/// Appends one [`CancelPad`] per pad that lost channels.
fn cancel_removed_pads(ctx: &TaskContext<'_>, before: &[(ChannelId, Direction, u32)], removed: &[ChannelId]) {
    let mut groups: Vec<((Direction, u32), Vec<ChannelId>)> = Vec::new();
    for (id, direction, pad) in before {
        if !removed.contains(id) {
            continue;
        }
        match groups.iter_mut().find(|(key, _)| *key == (*direction, *pad)) {
            Some((_, channels)) => channels.push(*id),
            None => groups.push(((*direction, *pad), vec![*id])),
        }
    }
    for (_, channels) in groups {
        ctx.queue.append(CancelPad::new(channels));
    }
}

/// Adds an audio.
pub struct AddAudio {
    desc: Option<AudioDesc>,
    reply: Option<Reply<AudioId>>,
}

impl AddAudio {
    /// Adds an audio built from `desc`.
    pub fn new(desc: AudioDesc) -> Self {
        Self {
            desc: Some(desc),
            reply: None,
        }
    }

    /// Sends the new handle to `reply`.
    pub fn with_reply(mut self, reply: Reply<AudioId>) -> Self {
        self.reply = Some(reply);
        self
    }
}

impl Task for AddAudio {
    fn name(&self) -> &str {
        "add-audio"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        let desc = self
            .desc
            .take()
            .ok_or_else(|| TaskError::Rejected("add-audio launched twice".into()))?;
        let id = ctx.graph.add_audio(desc)?;
        notify_resize(ctx, id);
        answer(&self.reply, Ok(id));
        Ok(())
    }

    fn failure(&mut self, error: &TaskError) {
        log_failure(self.name(), error);
        answer(&self.reply, Err(error.clone()));
    }
}

/// Cancels everything running on an audio and removes it.
pub struct RemoveAudio {
    audio: AudioId,
    reply: Option<Reply<usize>>,
}

impl RemoveAudio {
    /// Removes `audio`.
    pub fn new(audio: AudioId) -> Self {
        Self { audio, reply: None }
    }

    /// Sends the number of retired recyclings to `reply`.
    pub fn with_reply(mut self, reply: Reply<usize>) -> Self {
        self.reply = Some(reply);
        self
    }
}

impl Task for RemoveAudio {
    fn name(&self) -> &str {
        "remove-audio"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        ctx.graph
            .audio(self.audio)
            .ok_or(GraphError::AudioNotFound(self.audio))?;
        ctx.recall.cancel_audio(self.audio);
        let rewire = ctx.graph.remove_audio(self.audio)?;
        let retired = rewire.retired.len();
        ctx.settle(rewire);
        answer(&self.reply, Ok(retired));
        Ok(())
    }

    fn failure(&mut self, error: &TaskError) {
        log_failure(self.name(), error);
        answer(&self.reply, Err(error.clone()));
    }
}

/// Changes an audio's sub-channel count.
///
/// Growing clones the audio's templates onto the new channels and lets
/// live runs pick them up. Shrinking queues one [`CancelPad`] per pad that
/// lost channels.
pub struct SetAudioChannels {
    audio: AudioId,
    audio_channels: u32,
}

impl SetAudioChannels {
    /// Resizes `audio` to `audio_channels` sub-channels.
    pub fn new(audio: AudioId, audio_channels: u32) -> Self {
        Self { audio, audio_channels }
    }
}

impl Task for SetAudioChannels {
    fn name(&self) -> &str {
        "set-audio-channels"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        let before = layout(ctx.graph, self.audio);
        let rewire = ctx.graph.set_audio_channels(self.audio, self.audio_channels)?;
        cancel_removed_pads(ctx, &before, &rewire.removed);
        ctx.settle(rewire);
        notify_resize(ctx, self.audio);
        Ok(())
    }
}

/// Changes the pad count on one side of an audio.
pub struct SetPads {
    audio: AudioId,
    direction: Direction,
    pads: u32,
}

impl SetPads {
    /// Resizes one side of `audio` to `pads` pads.
    pub fn new(audio: AudioId, direction: Direction, pads: u32) -> Self {
        Self { audio, direction, pads }
    }
}

impl Task for SetPads {
    fn name(&self) -> &str {
        "set-pads"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        let before = layout(ctx.graph, self.audio);
        let rewire = ctx.graph.set_pads(self.audio, self.direction, self.pads)?;
        cancel_removed_pads(ctx, &before, &rewire.removed);
        ctx.settle(rewire);
        notify_resize(ctx, self.audio);
        Ok(())
    }
}

/// Links an output channel to an input channel.
pub struct Link {
    src: ChannelId,
    dst: ChannelId,
    reply: Option<Reply<()>>,
}

impl Link {
    /// Links output `src` to input `dst`.
    pub fn new(src: ChannelId, dst: ChannelId) -> Self {
        Self { src, dst, reply: None }
    }

    /// Reports acceptance or the refusal reason to `reply`.
    pub fn with_reply(mut self, reply: Reply<()>) -> Self {
        self.reply = Some(reply);
        self
    }
}

impl Task for Link {
    fn name(&self) -> &str {
        "link"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        let rewire = ctx.graph.set_link(self.src, self.dst)?;
        ctx.settle(rewire);
        answer(&self.reply, Ok(()));
        Ok(())
    }

    fn failure(&mut self, error: &TaskError) {
        log_failure(self.name(), error);
        answer(&self.reply, Err(error.clone()));
    }
}

/// Drops a channel's link.
pub struct Unlink {
    channel: ChannelId,
}

impl Unlink {
    /// Unlinks `channel` from its peer.
    pub fn new(channel: ChannelId) -> Self {
        Self { channel }
    }
}

impl Task for Unlink {
    fn name(&self) -> &str {
        "unlink"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        let rewire = ctx.graph.unlink(self.channel)?;
        ctx.settle(rewire);
        Ok(())
    }
}

/// Starts a run on an audio and its upstream audios.
pub struct StartScope {
    audio: AudioId,
    scope: SoundScope,
    reply: Option<Reply<RecallId>>,
}

impl StartScope {
    /// Starts `scope` on `audio`.
    pub fn new(audio: AudioId, scope: SoundScope) -> Self {
        Self {
            audio,
            scope,
            reply: None,
        }
    }

    /// Sends the new run id to `reply`.
    pub fn with_reply(mut self, reply: Reply<RecallId>) -> Self {
        self.reply = Some(reply);
        self
    }
}

impl Task for StartScope {
    fn name(&self) -> &str {
        "start-scope"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        let id = ctx.recall.start(ctx.graph, self.audio, self.scope)?;
        answer(&self.reply, Ok(id));
        Ok(())
    }

    fn failure(&mut self, error: &TaskError) {
        log_failure(self.name(), error);
        answer(&self.reply, Err(error.clone()));
    }
}

/// Cooperatively cancels one run.
pub struct CancelRecall {
    recall_id: RecallId,
}

impl CancelRecall {
    /// Cancels `recall_id`.
    pub fn new(recall_id: RecallId) -> Self {
        Self { recall_id }
    }
}

impl Task for CancelRecall {
    fn name(&self) -> &str {
        "cancel-recall"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        ctx.recall.cancel(self.recall_id)?;
        Ok(())
    }
}

/// Cancels every run of one sound scope.
pub struct CancelScope {
    scope: SoundScope,
}

impl CancelScope {
    /// Cancels all runs of `scope`.
    pub fn new(scope: SoundScope) -> Self {
        Self { scope }
    }
}

impl Task for CancelScope {
    fn name(&self) -> &str {
        "cancel-scope"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        ctx.recall.cancel_scope(self.scope);
        Ok(())
    }
}

/// Cancels the instances of one removed pad in every run.
pub struct CancelPad {
    channels: Vec<ChannelId>,
}

impl CancelPad {
    /// Cancels the instances bound to `channels`.
    pub fn new(channels: Vec<ChannelId>) -> Self {
        Self { channels }
    }

    /// Channels this task cancels.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }
}

impl Task for CancelPad {
    fn name(&self) -> &str {
        "cancel-pad"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        for channel in &self.channels {
            ctx.recall.cancel_channel(*channel);
        }
        Ok(())
    }
}

/// Changes the tempo.
pub struct SetTempo {
    bpm: f64,
}

impl SetTempo {
    /// Sets the tempo to `bpm`.
    pub fn new(bpm: f64) -> Self {
        Self { bpm }
    }
}

impl Task for SetTempo {
    fn name(&self) -> &str {
        "set-tempo"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        ctx.timing.set_bpm(self.bpm)?;
        Ok(())
    }
}

/// Changes the delay factor.
pub struct SetDelayFactor {
    delay_factor: f64,
}

impl SetDelayFactor {
    /// Sets the delay factor.
    pub fn new(delay_factor: f64) -> Self {
        Self { delay_factor }
    }
}

impl Task for SetDelayFactor {
    fn name(&self) -> &str {
        "set-delay-factor"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        ctx.timing.set_delay_factor(self.delay_factor)?;
        Ok(())
    }
}

/// Sets or clears the loop range.
pub struct SetLoop {
    range: Option<(u64, u64)>,
}

impl SetLoop {
    /// Loops `[left, right)` subdivisions, or stops looping with `None`.
    pub fn new(range: Option<(u64, u64)>) -> Self {
        Self { range }
    }
}

impl Task for SetLoop {
    fn name(&self) -> &str {
        "set-loop"
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        ctx.timing.set_loop(self.range)?;
        Ok(())
    }
}

type LaunchFn = Box<dyn FnMut(&mut TaskContext<'_>) -> Result<(), TaskError> + Send>;
type FailureFn = Box<dyn FnMut(&TaskError) + Send>;

/// Task built from a closure.
pub struct FnTask {
    name: String,
    locked: bool,
    launch: LaunchFn,
    on_failure: Option<FailureFn>,
}

impl FnTask {
    /// Wraps `launch` under `name`.
    pub fn new<F>(name: impl Into<String>, launch: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_>) -> Result<(), TaskError> + Send + 'static,
    {
        Self {
            name: name.into(),
            locked: false,
            launch: Box::new(launch),
            on_failure: None,
        }
    }

    /// Defers the rest of the batch after this task runs.
    pub fn locking(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Replaces the default failure logging.
    pub fn on_failure(mut self, f: impl FnMut(&TaskError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }
}

impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn locked(&self) -> bool {
        self.locked
    }

    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError> {
        (self.launch)(ctx)
    }

    fn failure(&mut self, error: &TaskError) {
        match self.on_failure.as_mut() {
            Some(f) => f(error),
            None => log_failure(&self.name, error),
        }
    }
}
