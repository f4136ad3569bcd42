//! Thread tree nodes and the per-tick handshake.
//!
//! Every node owns two locks:
//!
//! - a recursive lock over its flags, children and join handle. It is only
//!   held long enough to read or write those fields.
//! - the tick mutex paired with the node's condition variable. Parents bump
//!   `requested` and wake the node; the node bumps `completed` and wakes
//!   whoever waits on it.
//!
//! The two are never held at the same time.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, ReentrantMutex};

/// Stable index of a node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in creation order; the root is 0.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// How a node is driven relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Runs once per parent tick. The parent waits for it before closing its tick.
    #[default]
    Synced,
    /// Woken every `every` parent ticks. The parent does not wait for it.
    FreeRunning {
        /// Parent ticks per run.
        every: u32,
    },
    /// Ignores ticks and runs on the wall clock.
    TimeLocked {
        /// Interval between runs.
        period: Duration,
    },
}

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Created, thread not yet spawned.
    Initialized,
    /// Thread is up and taking ticks.
    Running,
    /// Stop requested; the thread exits after its current tick.
    Stopping,
    /// Thread has exited.
    Stopped,
    /// Flagged by the watchdog.
    Hung,
    /// The node's work panicked.
    Failed,
}

impl NodeStatus {
    /// Returns `true` for states a node never leaves.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Stopped | Self::Hung | Self::Failed)
    }
}

/// Per-run view handed to [`NodeWork`].
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    /// The running node.
    pub node: NodeId,
    /// Its name.
    pub name: &'a str,
    /// The node's own tick number, starting at 1.
    pub tick: u64,
    /// Requests merged into this run because the node was still busy.
    pub coalesced: u64,
}

/// Work a node performs on each tick.
///
/// `run` happens before the node's synced children are woken, `post_run`
/// after all of them have finished the same tick.
pub trait NodeWork: Send + 'static {
    /// Called once on the node's thread before the first tick.
    fn on_start(&mut self, _ctx: &NodeContext<'_>) {}

    /// Per-tick work.
    fn run(&mut self, ctx: &NodeContext<'_>);

    /// Called after the synced children closed the tick.
    fn post_run(&mut self, _ctx: &NodeContext<'_>) {}

    /// Called once on the node's thread before it exits.
    fn on_stop(&mut self, _ctx: &NodeContext<'_>) {}
}

impl<F> NodeWork for F
where
    F: FnMut(&NodeContext<'_>) + Send + 'static,
{
    fn run(&mut self, ctx: &NodeContext<'_>) {
        self(ctx);
    }
}

/// Point-in-time counters of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    /// Lifecycle state.
    pub status: NodeStatus,
    /// Sync mode.
    pub mode: SyncMode,
    /// Ticks completed.
    pub ticks: u64,
    /// Requests that arrived while an earlier one was still waiting.
    pub overruns: u64,
}

pub(crate) struct NodeInner {
    pub(crate) status: NodeStatus,
    pub(crate) children: Vec<NodeId>,
    pub(crate) work: Option<Box<dyn NodeWork>>,
    pub(crate) thread: Option<JoinHandle<()>>,
}

pub(crate) struct TickState {
    pub(crate) requested: u64,
    pub(crate) taken: u64,
    pub(crate) completed: u64,
    /// Root tick at which the current backlog started.
    pub(crate) pending_since: u64,
    pub(crate) last_progress: Instant,
    pub(crate) stop: bool,
}

pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) mode: SyncMode,
    pub(crate) parent: Option<NodeId>,
    pub(crate) inner: ReentrantMutex<RefCell<NodeInner>>,
    pub(crate) tick: Mutex<TickState>,
    pub(crate) cond: Condvar,
    ticks: AtomicU64,
    overruns: AtomicU64,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        mode: SyncMode,
        parent: Option<NodeId>,
        work: Box<dyn NodeWork>,
    ) -> Self {
        Self {
            id,
            name,
            mode,
            parent,
            inner: ReentrantMutex::new(RefCell::new(NodeInner {
                status: NodeStatus::Initialized,
                children: Vec::new(),
                work: Some(work),
                thread: None,
            })),
            tick: Mutex::new(TickState {
                requested: 0,
                taken: 0,
                completed: 0,
                pending_since: 0,
                last_progress: Instant::now(),
                stop: false,
            }),
            cond: Condvar::new(),
            ticks: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    pub(crate) fn status(&self) -> NodeStatus {
        self.inner.lock().borrow().status
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        self.inner.lock().borrow_mut().status = status;
    }

    /// Snapshot of the children list.
    pub(crate) fn children(&self) -> Vec<NodeId> {
        self.inner.lock().borrow().children.clone()
    }

    pub(crate) fn stats(&self) -> NodeStats {
        NodeStats {
            status: self.status(),
            mode: self.mode,
            ticks: self.ticks.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }

    /// Asks for one more tick and returns its number.
    ///
    /// A request arriving while the previous one has not been picked up is
    /// merged into it and counted as an overrun.
    pub(crate) fn request(&self, root_tick: u64) -> u64 {
        let mut state = self.tick.lock();
        if state.requested == state.completed {
            state.pending_since = root_tick;
        }
        if state.requested > state.taken {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        state.requested += 1;
        let n = state.requested;
        drop(state);
        self.cond.notify_all();
        n
    }

    /// Blocks until a tick is requested. Returns `(tick, coalesced)`, or
    /// `None` once a stop was requested.
    pub(crate) fn wait_request(&self) -> Option<(u64, u64)> {
        let mut state = self.tick.lock();
        while !state.stop && state.requested <= state.taken {
            self.cond.wait(&mut state);
        }
        if state.stop {
            return None;
        }
        let coalesced = state.requested - state.taken - 1;
        state.taken = state.requested;
        Some((state.taken, coalesced))
    }

    /// Sleeps one period. Returns `false` if woken by a stop request.
    pub(crate) fn sleep(&self, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        let mut state = self.tick.lock();
        while !state.stop {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !state.stop
    }

    pub(crate) fn complete(&self, tick: u64, root_tick: u64) {
        let mut state = self.tick.lock();
        state.completed = tick;
        state.last_progress = Instant::now();
        if state.requested > state.completed {
            state.pending_since = root_tick;
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.cond.notify_all();
    }

    /// Blocks until `tick` completed, the node is told to stop, or `give_up`
    /// returns `true`. `give_up` is polled every `poll` with no lock held.
    pub(crate) fn wait_completed(&self, tick: u64, poll: Duration, give_up: impl Fn() -> bool) -> bool {
        loop {
            {
                let mut state = self.tick.lock();
                if state.completed >= tick {
                    return true;
                }
                if state.stop {
                    return false;
                }
                self.cond.wait_for(&mut state, poll);
                if state.completed >= tick {
                    return true;
                }
            }
            if give_up() {
                return false;
            }
        }
    }

    pub(crate) fn request_stop(&self) {
        self.tick.lock().stop = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.tick.lock().stop
    }

    /// Ticks behind, as seen by the watchdog.
    pub(crate) fn missed(&self, root_tick: u64) -> u64 {
        let state = self.tick.lock();
        match self.mode {
            SyncMode::TimeLocked { period } => {
                let elapsed = state.last_progress.elapsed().as_nanos();
                (elapsed / period.as_nanos().max(1)) as u64
            }
            SyncMode::Synced | SyncMode::FreeRunning { .. } => {
                if state.requested > state.completed {
                    root_tick.saturating_sub(state.pending_since)
                } else {
                    0
                }
            }
        }
    }

    pub(crate) fn mark_progress(&self) {
        self.tick.lock().last_progress = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::new(NodeId(0), "n".into(), SyncMode::Synced, None, Box::new(|_: &NodeContext<'_>| {}))
    }

    #[test]
    fn test_request_and_take() {
        let n = node();
        assert_eq!(n.request(1), 1);
        assert_eq!(n.wait_request(), Some((1, 0)));
        n.complete(1, 1);
        assert_eq!(n.stats().ticks, 1);
        assert_eq!(n.missed(5), 0);
    }

    #[test]
    fn test_requests_coalesce_while_waiting() {
        let n = node();
        n.request(1);
        n.request(2);
        n.request(3);
        assert_eq!(n.stats().overruns, 2);
        assert_eq!(n.wait_request(), Some((3, 2)));
    }

    #[test]
    fn test_missed_counts_root_ticks_since_backlog() {
        let n = node();
        n.request(4);
        assert_eq!(n.missed(4), 0);
        assert_eq!(n.missed(10), 6);
        let _ = n.wait_request();
        n.complete(1, 10);
        assert_eq!(n.missed(12), 0);
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let n = std::sync::Arc::new(node());
        let waiter = {
            let n = std::sync::Arc::clone(&n);
            std::thread::spawn(move || n.wait_request())
        };
        n.request_stop();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(n.is_stop_requested());
    }

    #[test]
    fn test_reentrant_status_update() {
        let n = node();
        let guard = n.inner.lock();
        assert_eq!(guard.borrow().status, NodeStatus::Initialized);
        n.set_status(NodeStatus::Running);
        assert_eq!(n.status(), NodeStatus::Running);
        drop(guard);
    }
}
