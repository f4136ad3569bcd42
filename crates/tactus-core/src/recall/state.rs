//! Recall run state machine.
//!
//! ```text
//! TEMPLATE ──▶ INSTANTIATED ──▶ INIT_PRE ─▶ INIT_INTER ─▶ INIT_POST
//!                                                            │
//!                    ┌───────────────────────────────────────┘
//!                    ▼
//!                RUN_PRE ─▶ RUN_INTER ─▶ RUN_POST ──┐   (once per tick)
//!                    ▲                               │
//!                    └───────────────────────────────┘
//!
//! any live state ──▶ DONE | CANCELLED
//! ```

/// Lifecycle state of a recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecallState {
    /// Unattached prototype. Never processes buffers.
    Template,
    /// Cloned onto an audio, channel or recycling, not yet part of a run.
    Instantiated,
    /// First init stage.
    InitPre,
    /// Second init stage.
    InitInter,
    /// Last init stage.
    InitPost,
    /// Per-tick stage before buffers are touched.
    RunPre,
    /// Per-tick stage that reads and writes buffers.
    RunInter,
    /// Per-tick stage after buffers are touched.
    RunPost,
    /// Finished normally or after a cooperative cancel.
    Done,
    /// Stopped by a failure.
    Cancelled,
}

impl RecallState {
    /// Returns `true` for `Done` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Returns `true` once the one-time init stages have completed.
    pub fn is_running(self) -> bool {
        matches!(self, Self::RunPre | Self::RunInter | Self::RunPost)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition(self, next: RecallState) -> bool {
        use RecallState::{
            Cancelled, Done, InitInter, InitPost, InitPre, Instantiated, RunInter, RunPost, RunPre,
            Template,
        };
        match (self, next) {
            (Template, Instantiated) => true,
            (Template, _) => false,
            (from, Done | Cancelled) => !from.is_terminal(),
            (Instantiated, InitPre)
            | (InitPre, InitInter)
            | (InitInter, InitPost)
            | (InitPost, RunPre)
            | (RunPre, RunInter)
            | (RunInter, RunPost)
            | (RunPost, RunPre) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for RecallState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Template => "TEMPLATE",
            Self::Instantiated => "INSTANTIATED",
            Self::InitPre => "INIT_PRE",
            Self::InitInter => "INIT_INTER",
            Self::InitPost => "INIT_POST",
            Self::RunPre => "RUN_PRE",
            Self::RunInter => "RUN_INTER",
            Self::RunPost => "RUN_POST",
            Self::Done => "DONE",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// The stage a processor hook is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// One-time, before any buffer exists for the run.
    InitPre,
    /// One-time, buffers are bound.
    InitInter,
    /// One-time, after every instance of the run has bound.
    InitPost,
    /// Per tick, before buffers.
    RunPre,
    /// Per tick, buffers are readable and writable.
    RunInter,
    /// Per tick, after buffers.
    RunPost,
}

impl Stage {
    /// The three init stages in order.
    pub const INIT: [Stage; 3] = [Stage::InitPre, Stage::InitInter, Stage::InitPost];

    /// The three run stages in order.
    pub const RUN: [Stage; 3] = [Stage::RunPre, Stage::RunInter, Stage::RunPost];

    /// State an instance is in while this stage runs.
    pub fn state(self) -> RecallState {
        match self {
            Self::InitPre => RecallState::InitPre,
            Self::InitInter => RecallState::InitInter,
            Self::InitPost => RecallState::InitPost,
            Self::RunPre => RecallState::RunPre,
            Self::RunInter => RecallState::RunInter,
            Self::RunPost => RecallState::RunPost,
        }
    }
}
