//! Sound scopes and run identifiers.

use std::sync::atomic::{AtomicU64, Ordering};

/// An independent, concurrent use of the same audio graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SoundScope {
    /// Live playback of the arrangement.
    Playback,
    /// Pattern sequencer runs.
    Sequencer,
    /// Notation (piano-roll) runs.
    Notation,
    /// Wave (sample region) runs.
    Wave,
    /// Offline export.
    Export,
    /// MIDI-driven runs.
    Midi,
}

impl SoundScope {
    /// Every scope, in index order.
    pub const ALL: [SoundScope; 6] = [
        SoundScope::Playback,
        SoundScope::Sequencer,
        SoundScope::Notation,
        SoundScope::Wave,
        SoundScope::Export,
        SoundScope::Midi,
    ];

    /// Dense index for per-scope tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name, as used for thread names and configuration keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playback => "playback",
            Self::Sequencer => "sequencer",
            Self::Notation => "notation",
            Self::Wave => "wave",
            Self::Export => "export",
            Self::Midi => "midi",
        }
    }
}

impl core::fmt::Display for SoundScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SoundScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sound scope '{s}'"))
    }
}

/// Generation token for one playback invocation within one sound scope.
///
/// Created when a start task runs and retired when the run is done or
/// cancelled. Generations are never reused within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecallId {
    scope: SoundScope,
    generation: u64,
}

impl RecallId {
    /// Builds an id from its parts.
    pub fn new(scope: SoundScope, generation: u64) -> Self {
        Self { scope, generation }
    }

    /// Scope of the run.
    pub fn scope(self) -> SoundScope {
        self.scope
    }

    /// Generation number of the run.
    pub fn generation(self) -> u64 {
        self.generation
    }
}

impl core::fmt::Display for RecallId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.scope, self.generation)
    }
}

/// Hands out monotonically increasing generations.
#[derive(Debug, Default)]
pub struct RecallIdAllocator {
    next: AtomicU64,
}

impl RecallIdAllocator {
    /// Creates an allocator starting at generation 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Issues a fresh id in `scope`.
    pub fn allocate(&self, scope: SoundScope) -> RecallId {
        let generation = self.next.fetch_add(1, Ordering::Relaxed).max(1);
        RecallId::new(scope, generation)
    }
}
