//! Error types for the thread tree and the worker pool.

use std::time::Duration;

use crate::node::NodeId;

/// A node that stopped keeping up with its ticks.
///
/// Raised by the watchdog. A hang is fatal to the node's subtree; the tree
/// never restarts a hung node on its own.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("thread '{name}' ({node}) missed {missed} ticks")]
pub struct ThreadHang {
    /// The hung node.
    pub node: NodeId,
    /// Its name.
    pub name: String,
    /// Ticks elapsed since its oldest pending tick was requested.
    pub missed: u64,
    /// `true` if the hang stopped the whole tree rather than the subtree.
    pub escalated: bool,
}

/// Errors from [`ThreadTree`](crate::ThreadTree) and
/// [`ReturnablePool`](crate::ReturnablePool).
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// No node with this id exists in the tree.
    #[error("no such node: {0}")]
    NodeNotFound(NodeId),

    /// The node was stopped, hung or failed and cannot run again.
    #[error("node {node} has finished and cannot be restarted")]
    Finished {
        /// The finished node.
        node: NodeId,
    },

    /// The OS refused to spawn a thread.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A tick did not close within the allowed time.
    #[error("tick {tick} did not complete within {waited:?}")]
    Timeout {
        /// The awaited tick.
        tick: u64,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Watchdog-detected hang.
    #[error(transparent)]
    Hang(#[from] ThreadHang),

    /// A pooled job panicked.
    #[error("pooled job panicked: {0}")]
    JobPanicked(String),

    /// The pool shut down before the job could run.
    #[error("worker pool is closed")]
    PoolClosed,

    /// Invalid construction parameter.
    #[error("invalid thread configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result type for thread operations.
pub type Result<T> = std::result::Result<T, ThreadError>;

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
