//! The task queue: the only sanctioned way to mutate the live graph.
//!
//! Any thread may [`append`](TaskQueue::append) a task; the call takes one
//! short lock and returns. Once per tick the thread owning the graph calls
//! [`drain`](TaskQueue::drain), which launches a snapshot of everything
//! appended so far in FIFO order:
//!
//! - a failing or panicking task is reported through its own
//!   [`failure`](Task::failure) callback and the drain moves on
//! - after a *locked* task has run, the rest of the batch is deferred to the
//!   next tick and runs there before anything appended later
//! - tasks appended while the drain is running belong to the next tick
//!
//! Cyclic tasks are launched every tick after the one-shot batch until they
//! are removed or fail.

mod builtin;

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{TaskError, panic_message};
use crate::gc::RecyclingGc;
use crate::graph::{AudioGraph, Rewire};
use crate::recall::RecallEngine;
use crate::timing::TimingConverter;

pub use builtin::{
    AddAudio, CancelPad, CancelRecall, CancelScope, FnTask, Link, RemoveAudio, Reply, SetAudioChannels,
    SetDelayFactor, SetLoop, SetPads, SetTempo, StartScope, Unlink,
};

/// One-shot mutation request.
pub trait Task: Send {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// When `true`, no later task of the same batch runs in this tick.
    fn locked(&self) -> bool {
        false
    }

    /// Applies the mutation.
    fn launch(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), TaskError>;

    /// Called once when `launch` failed or panicked.
    fn failure(&mut self, error: &TaskError) {
        #[cfg(feature = "tracing")]
        tracing::warn!("task_failed: '{}': {error}", self.name());
        #[cfg(not(feature = "tracing"))]
        let _ = error;
    }
}

/// Everything a task may touch while it runs.
pub struct TaskContext<'a> {
    /// The live graph.
    pub graph: &'a mut AudioGraph,
    /// Live runs.
    pub recall: &'a RecallEngine,
    /// Stopped recyclings.
    pub gc: &'a RecyclingGc,
    /// Musical clock.
    pub timing: &'a mut TimingConverter,
    /// The queue being drained, for follow-up tasks.
    pub queue: &'a TaskQueue,
    /// Tick being processed.
    pub tick: u64,
}

impl TaskContext<'_> {
    /// Hands retired recyclings to the GC and brings live runs in line with
    /// the change.
    pub fn settle(&mut self, rewire: Rewire) {
        self.recall.apply_rewire(self.graph, &rewire);
        self.gc.stop_all(rewire.retired, self.tick);
    }
}

/// Handle to a cyclic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CyclicHandle(u64);

/// Outcome of one [`TaskQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// One-shot tasks launched successfully.
    pub launched: usize,
    /// Tasks (one-shot or cyclic) whose launch failed or panicked.
    pub failed: usize,
    /// Tasks pushed to the next tick by a locked task.
    pub deferred: usize,
    /// Cyclic tasks launched.
    pub cyclic: usize,
}

type Cyclic = (CyclicHandle, Box<dyn Task>);

/// FIFO of pending mutations.
pub struct TaskQueue {
    pending: Mutex<VecDeque<Box<dyn Task>>>,
    deferred: Mutex<VecDeque<Box<dyn Task>>>,
    cyclic: Mutex<Vec<Cyclic>>,
    removed: Mutex<Vec<CyclicHandle>>,
    next_cyclic: AtomicU64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(VecDeque::new()),
            cyclic: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            next_cyclic: AtomicU64::new(1),
        }
    }

    /// Appends a task. Callable from any thread.
    pub fn append(&self, task: impl Task + 'static) {
        self.append_boxed(Box::new(task));
    }

    /// Appends an already boxed task.
    pub fn append_boxed(&self, task: Box<dyn Task>) {
        self.pending.lock().push_back(task);
    }

    /// Registers a task to launch every tick.
    pub fn append_cyclic(&self, task: impl Task + 'static) -> CyclicHandle {
        let handle = CyclicHandle(self.next_cyclic.fetch_add(1, Ordering::Relaxed));
        self.cyclic.lock().push((handle, Box::new(task)));
        handle
    }

    /// Unregisters a cyclic task. Takes effect before its next launch.
    pub fn remove_cyclic(&self, handle: CyclicHandle) {
        let mut cyclic = self.cyclic.lock();
        let before = cyclic.len();
        cyclic.retain(|(h, _)| *h != handle);
        if cyclic.len() == before {
            // currently running inside a drain
            self.removed.lock().push(handle);
        }
    }

    /// One-shot tasks waiting, including deferred ones.
    pub fn len(&self) -> usize {
        self.pending.lock().len() + self.deferred.lock().len()
    }

    /// Returns `true` if no one-shot task is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of registered cyclic tasks.
    pub fn cyclic_len(&self) -> usize {
        self.cyclic.lock().len()
    }

    /// Launches the deferred remainder of the previous tick, then a snapshot
    /// of everything appended so far, then the cyclic tasks.
    pub fn drain(&self, ctx: &mut TaskContext<'_>) -> DrainReport {
        let mut report = DrainReport::default();
        let mut batch = core::mem::take(&mut *self.deferred.lock());
        batch.append(&mut *self.pending.lock());

        while let Some(mut task) = batch.pop_front() {
            let locked = task.locked();
            if launch(task.as_mut(), ctx) {
                report.launched += 1;
            } else {
                report.failed += 1;
            }
            if locked && !batch.is_empty() {
                report.deferred = batch.len();

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "task_locked: '{}' defers {} tasks to the next tick",
                    task.name(),
                    batch.len()
                );
                let mut deferred = self.deferred.lock();
                batch.append(&mut *deferred);
                *deferred = core::mem::take(&mut batch);
                break;
            }
        }

        report.cyclic = self.drain_cyclic(ctx, &mut report.failed);
        report
    }

    fn drain_cyclic(&self, ctx: &mut TaskContext<'_>, failed: &mut usize) -> usize {
        let running = core::mem::take(&mut *self.cyclic.lock());
        let mut launched = 0;
        let mut kept = Vec::with_capacity(running.len());
        for (handle, mut task) in running {
            if self.removed.lock().contains(&handle) {
                continue;
            }
            launched += 1;
            if launch(task.as_mut(), ctx) {
                kept.push((handle, task));
            } else {
                *failed += 1;
            }
        }

        let removed = core::mem::take(&mut *self.removed.lock());
        kept.retain(|(h, _)| !removed.contains(h));
        let mut cyclic = self.cyclic.lock();
        kept.append(&mut *cyclic);
        *cyclic = kept;
        launched
    }
}

/// Launches one task with panic isolation. Returns `true` on success.
fn launch(task: &mut dyn Task, ctx: &mut TaskContext<'_>) -> bool {
    let result = match catch_unwind(AssertUnwindSafe(|| task.launch(ctx))) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked {
            task: task.name().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    };
    match result {
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::trace!("task_launched: '{}'", task.name());
            true
        }
        Err(error) => {
            task.failure(&error);
            false
        }
    }
}
