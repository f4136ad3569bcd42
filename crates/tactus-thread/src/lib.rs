//! Tick-driven thread tree for the tactus engine.
//!
//! A [`ThreadTree`] is a fixed tree of OS threads. The soundcard calls
//! [`ThreadTree::tick`] once per buffer; the root wakes, runs its
//! [`NodeWork`], wakes its children and closes the tick once its synced
//! children closed theirs. Children follow their parent in one of three
//! [`SyncMode`]s.
//!
//! A [`Watchdog`] flags nodes that stop keeping up and stops their subtree
//! (or the whole tree, per [`HangPolicy`]). [`ReturnablePool`] provides
//! worker threads for bounded fan-out inside a tick.
//!
//! ```
//! use std::time::Duration;
//! use tactus_thread::{NodeContext, SyncMode, ThreadTree, TreeConfig};
//!
//! let tree = ThreadTree::new("root", |_: &NodeContext<'_>| {}, TreeConfig::default());
//! tree.add_child(tree.root(), "scope", SyncMode::Synced, |_: &NodeContext<'_>| {})
//!     .unwrap();
//! tree.start(tree.root()).unwrap();
//! tree.tick_and_wait(Duration::from_secs(1)).unwrap();
//! tree.shutdown();
//! ```

mod error;
mod node;
mod pool;
mod tree;
mod watchdog;

pub use error::{Result, ThreadError, ThreadHang};
pub use node::{NodeContext, NodeId, NodeStats, NodeStatus, NodeWork, SyncMode};
pub use pool::{Returnable, ReturnablePool};
pub use tree::{EVENT_CAPACITY, HangPolicy, ThreadTree, TreeConfig, TreeEvent};
pub use watchdog::Watchdog;
