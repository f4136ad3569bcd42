//! The thread tree.
//!
//! ```text
//!            soundcard tick
//!                  │ ThreadTree::tick
//!                  ▼
//!               ┌──────┐ run ─▶ wake synced children ─▶ wait ─▶ post_run
//!               │ root │
//!               └──┬───┘
//!        ┌─────────┼──────────────┐
//!        ▼         ▼              ▼
//!    [synced]  [free-running]  [time-locked]
//!    awaited   woken, not      own wall-clock
//!              awaited         loop
//! ```
//!
//! Siblings run concurrently. A parent never closes a tick before its synced
//! children closed theirs; children never wait on parents.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use crate::error::{Result, ThreadError, ThreadHang, panic_message};
use crate::node::{Node, NodeContext, NodeId, NodeStats, NodeStatus, NodeWork, SyncMode};

/// Capacity of the tree event channel. Events past it are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// What a detected hang stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HangPolicy {
    /// Stop the hung node and its descendants.
    #[default]
    Subtree,
    /// Stop the whole tree.
    Tree,
}

/// Tree-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Ticks a node may fall behind before the watchdog flags it.
    pub hang_after_ticks: u64,
    /// What a hang stops.
    pub hang_policy: HangPolicy,
    /// How often a parent re-checks a child it waits on.
    pub poll_interval: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            hang_after_ticks: 16,
            hang_policy: HangPolicy::Subtree,
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// A node's thread came up.
    Started {
        /// The node.
        node: NodeId,
        /// Its name.
        name: String,
    },
    /// A node's thread exited.
    Stopped {
        /// The node.
        node: NodeId,
    },
    /// The watchdog flagged a node.
    Hang(ThreadHang),
    /// A node's work panicked; its subtree was stopped.
    Panicked {
        /// The node.
        node: NodeId,
        /// Panic payload.
        message: String,
    },
}

pub(crate) struct TreeShared {
    nodes: RwLock<Vec<Arc<Node>>>,
    root_tick: AtomicU64,
    config: TreeConfig,
    events_tx: Sender<TreeEvent>,
    events_rx: Receiver<TreeEvent>,
}

/// A tree of OS threads woken once per tick from the root.
///
/// The handle is cheap to clone; every clone drives the same tree. Threads
/// keep the tree alive until [`ThreadTree::shutdown`] joins them.
#[derive(Clone)]
pub struct ThreadTree {
    shared: Arc<TreeShared>,
}

impl ThreadTree {
    /// Creates a tree whose root runs `work`. Nothing is spawned until
    /// [`start`](Self::start).
    pub fn new(root_name: impl Into<String>, work: impl NodeWork, config: TreeConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let root = Node::new(NodeId(0), root_name.into(), SyncMode::Synced, None, Box::new(work));
        Self {
            shared: Arc::new(TreeShared {
                nodes: RwLock::new(vec![Arc::new(root)]),
                root_tick: AtomicU64::new(0),
                config,
                events_tx,
                events_rx,
            }),
        }
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Tree-wide settings.
    pub fn config(&self) -> &TreeConfig {
        &self.shared.config
    }

    /// Adds a child under `parent`. The child starts with its parent's next
    /// [`start`](Self::start), or by starting it directly.
    pub fn add_child(
        &self,
        parent: NodeId,
        name: impl Into<String>,
        mode: SyncMode,
        work: impl NodeWork,
    ) -> Result<NodeId> {
        if let SyncMode::FreeRunning { every: 0 } = mode {
            return Err(ThreadError::InvalidConfig("free-running interval must be at least 1".into()));
        }
        if let SyncMode::TimeLocked { period } = mode
            && period.is_zero()
        {
            return Err(ThreadError::InvalidConfig("time-locked period must be non-zero".into()));
        }

        let parent_node = self.shared.node(parent)?;
        let guard = parent_node.inner.lock();
        if guard.borrow().status.is_finished() {
            return Err(ThreadError::Finished { node: parent });
        }

        let mut nodes = self.shared.nodes.write();
        let id = NodeId(nodes.len());
        let name = name.into();
        tracing::debug!("thread_add: '{name}' ({id}) under {parent}, {mode:?}");
        nodes.push(Arc::new(Node::new(id, name, mode, Some(parent), Box::new(work))));
        drop(nodes);
        guard.borrow_mut().children.push(id);
        Ok(id)
    }

    /// Moves `node` and its initialized descendants to RUNNING, spawning
    /// their threads. Nodes already running are left alone.
    pub fn start(&self, node: NodeId) -> Result<()> {
        let n = self.shared.node(node)?;
        if n.status().is_finished() {
            return Err(ThreadError::Finished { node });
        }
        TreeShared::start_subtree(&self.shared, &n)
    }

    /// Asks `node` and its descendants to stop.
    ///
    /// Returns immediately. Each thread leaves after finishing the tick it
    /// is in; a blocked wait is woken.
    pub fn stop(&self, node: NodeId) -> Result<()> {
        let n = self.shared.node(node)?;
        self.shared.stop_subtree(&n);
        Ok(())
    }

    /// Waits for the threads of `node` and its descendants to exit.
    ///
    /// Call after [`stop`](Self::stop). A node's own thread is skipped.
    pub fn join(&self, node: NodeId) -> Result<()> {
        let n = self.shared.node(node)?;
        self.shared.join_subtree(&n);
        Ok(())
    }

    /// Stops and joins the whole tree.
    pub fn shutdown(&self) {
        let root = self.shared.root();
        self.shared.stop_subtree(&root);
        self.shared.join_subtree(&root);
    }

    /// Requests the next root tick and returns its number.
    ///
    /// Called from the soundcard callback. Never blocks on the tree: if the
    /// root is still busy the request merges with the pending one.
    pub fn tick(&self) -> u64 {
        let root_tick = self.shared.root_tick.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.root().request(root_tick)
    }

    /// Root ticks requested so far.
    pub fn tick_count(&self) -> u64 {
        self.shared.root_tick.load(Ordering::Acquire)
    }

    /// Blocks until the root closed tick `tick`.
    pub fn wait_tick(&self, tick: u64, timeout: Duration) -> Result<()> {
        let root = self.shared.root();
        let deadline = Instant::now() + timeout;
        let done = root.wait_completed(tick, self.shared.config.poll_interval, || {
            Instant::now() >= deadline || root.status().is_finished()
        });
        if done {
            Ok(())
        } else {
            Err(ThreadError::Timeout { tick, waited: timeout })
        }
    }

    /// Requests one tick and waits for it to close.
    pub fn tick_and_wait(&self, timeout: Duration) -> Result<u64> {
        let tick = self.tick();
        self.wait_tick(tick, timeout)?;
        Ok(tick)
    }

    /// Counters of `node`.
    pub fn stats(&self, node: NodeId) -> Result<NodeStats> {
        Ok(self.shared.node(node)?.stats())
    }

    /// Lifecycle state of `node`.
    pub fn status(&self, node: NodeId) -> Result<NodeStatus> {
        Ok(self.shared.node(node)?.status())
    }

    /// Name of `node`.
    pub fn name(&self, node: NodeId) -> Result<String> {
        Ok(self.shared.node(node)?.name.clone())
    }

    /// Parent of `node`; `None` for the root.
    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>> {
        Ok(self.shared.node(node)?.parent)
    }

    /// Children of `node`, in creation order.
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        Ok(self.shared.node(node)?.children())
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.shared.nodes.read().len()
    }

    /// Always `false`: a tree has at least its root.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Receiver of tree notifications.
    pub fn subscribe(&self) -> Receiver<TreeEvent> {
        self.shared.events_rx.clone()
    }

    /// Flags every running node that fell more than
    /// [`TreeConfig::hang_after_ticks`] behind, and stops what the hang
    /// policy says. Returns the hangs found by this pass.
    ///
    /// A parent blocked on a hung child falls behind as well; only the
    /// deepest node is blamed.
    pub fn check_hangs(&self) -> Vec<ThreadHang> {
        let root_tick = self.tick_count();
        let nodes = self.shared.nodes.read().clone();
        let mut blocked = HashSet::new();
        for node in &nodes {
            if node.status() == NodeStatus::Hung {
                self.shared.ancestors(node, &mut blocked);
            }
        }

        let mut hangs = Vec::new();
        // Children are always created after their parents.
        for node in nodes.iter().rev() {
            if blocked.contains(&node.id) || node.status() != NodeStatus::Running {
                continue;
            }
            let missed = node.missed(root_tick);
            if missed > self.shared.config.hang_after_ticks {
                hangs.push(self.shared.declare_hang(node, missed));
                self.shared.ancestors(node, &mut blocked);
            }
        }
        hangs
    }
}

impl TreeShared {
    fn root(&self) -> Arc<Node> {
        Arc::clone(&self.nodes.read()[0])
    }

    fn node(&self, id: NodeId) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .get(id.0)
            .cloned()
            .ok_or(ThreadError::NodeNotFound(id))
    }

    fn emit(&self, event: TreeEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn ancestors(&self, node: &Node, out: &mut HashSet<NodeId>) {
        let mut next = node.parent;
        while let Some(id) = next {
            out.insert(id);
            next = self.node(id).ok().and_then(|n| n.parent);
        }
    }

    fn subtree(&self, node: &Arc<Node>) -> Vec<Arc<Node>> {
        let mut out = vec![Arc::clone(node)];
        let mut i = 0;
        while i < out.len() {
            for child in out[i].children() {
                if let Ok(c) = self.node(child) {
                    out.push(c);
                }
            }
            i += 1;
        }
        out
    }

    fn start_subtree(shared: &Arc<Self>, node: &Arc<Node>) -> Result<()> {
        {
            let guard = node.inner.lock();
            if guard.borrow().status == NodeStatus::Initialized {
                let work = guard.borrow_mut().work.take();
                if let Some(work) = work {
                    node.set_status(NodeStatus::Running);
                    node.mark_progress();
                    let tree = Arc::clone(shared);
                    let me = Arc::clone(node);
                    let spawned = thread::Builder::new()
                        .name(node.name.clone())
                        .spawn(move || tree.run_node(&me, work));
                    match spawned {
                        Ok(handle) => guard.borrow_mut().thread = Some(handle),
                        Err(source) => {
                            node.set_status(NodeStatus::Failed);
                            return Err(ThreadError::Spawn {
                                name: node.name.clone(),
                                source,
                            });
                        }
                    }
                }
            }
        }
        for child in node.children() {
            let child = shared.node(child)?;
            if child.status() == NodeStatus::Initialized {
                Self::start_subtree(shared, &child)?;
            }
        }
        Ok(())
    }

    fn stop_subtree(&self, node: &Arc<Node>) {
        for n in self.subtree(node) {
            {
                let guard = n.inner.lock();
                let status = guard.borrow().status;
                match status {
                    NodeStatus::Initialized => guard.borrow_mut().status = NodeStatus::Stopped,
                    NodeStatus::Running => guard.borrow_mut().status = NodeStatus::Stopping,
                    _ => {}
                }
            }
            n.request_stop();
        }
    }

    fn join_subtree(&self, node: &Arc<Node>) {
        let me = thread::current().id();
        for n in self.subtree(node) {
            let handle = n.inner.lock().borrow_mut().thread.take();
            let Some(handle) = handle else { continue };
            if handle.thread().id() == me {
                n.inner.lock().borrow_mut().thread = Some(handle);
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("thread_join: '{}' exited by panic", n.name);
            }
        }
    }

    fn declare_hang(&self, node: &Arc<Node>, missed: u64) -> ThreadHang {
        let escalated = self.config.hang_policy == HangPolicy::Tree;
        let hang = ThreadHang {
            node: node.id,
            name: node.name.clone(),
            missed,
            escalated,
        };
        tracing::warn!("thread_hang: {hang}{}", if escalated { ", stopping tree" } else { "" });

        if escalated {
            self.stop_subtree(&self.root());
        } else {
            self.stop_subtree(node);
        }
        node.set_status(NodeStatus::Hung);
        self.emit(TreeEvent::Hang(hang.clone()));
        hang
    }

    fn fail(&self, node: &Arc<Node>, message: String) {
        tracing::warn!("thread_panic: '{}' ({}): {message}", node.name, node.id);
        self.stop_subtree(node);
        node.set_status(NodeStatus::Failed);
        self.emit(TreeEvent::Panicked { node: node.id, message });
    }

    /// Wakes the children that follow this tick and waits for the synced ones.
    fn drive_children(&self, parent: &Node, tick: u64) {
        let root_tick = self.root_tick.load(Ordering::Acquire);
        let mut awaited = Vec::new();
        for id in parent.children() {
            let Ok(child) = self.node(id) else { continue };
            if child.status() != NodeStatus::Running {
                continue;
            }
            match child.mode {
                SyncMode::Synced => {
                    let n = child.request(root_tick);
                    awaited.push((child, n));
                }
                SyncMode::FreeRunning { every } => {
                    if tick % u64::from(every.max(1)) == 0 {
                        child.request(root_tick);
                    }
                }
                SyncMode::TimeLocked { .. } => {}
            }
        }
        for (child, n) in awaited {
            child.wait_completed(n, self.config.poll_interval, || {
                let status = child.status();
                status.is_finished() || (parent.is_stop_requested() && status != NodeStatus::Running)
            });
        }
    }

    fn run_node(&self, node: &Arc<Node>, mut work: Box<dyn NodeWork>) {
        let mut ctx = NodeContext {
            node: node.id,
            name: &node.name,
            tick: 0,
            coalesced: 0,
        };
        tracing::debug!("thread_start: '{}' ({})", node.name, node.id);
        self.emit(TreeEvent::Started {
            node: node.id,
            name: node.name.clone(),
        });

        let mut own_tick = 0;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            work.on_start(&ctx);
            loop {
                let (tick, coalesced) = match node.mode {
                    SyncMode::TimeLocked { period } => {
                        if !node.sleep(period) {
                            break;
                        }
                        own_tick += 1;
                        (own_tick, 0)
                    }
                    SyncMode::Synced | SyncMode::FreeRunning { .. } => match node.wait_request() {
                        Some(request) => request,
                        None => break,
                    },
                };
                ctx.tick = tick;
                ctx.coalesced = coalesced;
                work.run(&ctx);
                self.drive_children(node, tick);
                work.post_run(&ctx);
                node.complete(tick, self.root_tick.load(Ordering::Acquire));
            }
            work.on_stop(&ctx);
        }));

        if let Err(payload) = outcome {
            self.fail(node, panic_message(payload.as_ref()));
        } else {
            let guard = node.inner.lock();
            let status = guard.borrow().status;
            if matches!(status, NodeStatus::Running | NodeStatus::Stopping) {
                guard.borrow_mut().status = NodeStatus::Stopped;
            }
        }
        tracing::debug!("thread_stop: '{}' ({})", node.name, node.id);
        self.emit(TreeEvent::Stopped { node: node.id });
    }
}
