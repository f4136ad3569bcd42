//! Notifications published by the recall engine.

use super::RecallId;
use crate::error::RecallError;
use crate::graph::{AudioId, ChannelId};

/// Lifecycle notification for observers such as a UI.
///
/// Delivered through a bounded channel; when no one drains it, further
/// events are dropped instead of blocking the realtime path.
#[derive(Debug, Clone, PartialEq)]
pub enum RecallEvent {
    /// A run was started on `audio` and its upstream audios.
    Started {
        /// The new run.
        recall_id: RecallId,
        /// Audio the run was started on.
        audio: AudioId,
    },
    /// A run or part of it was cancelled.
    ///
    /// `error` is `None` for a cooperative cancel and `Some` when a single
    /// instance failed. `channel` and `recall` narrow the event down when it
    /// concerns one instance or one channel rather than the whole run.
    Cancel {
        /// The affected run.
        recall_id: RecallId,
        /// Channel of the affected instances, if any.
        channel: Option<ChannelId>,
        /// Name of the affected instance, if one.
        recall: Option<String>,
        /// Failure that caused the cancel, if any.
        error: Option<RecallError>,
    },
    /// Every instance of the run reached a terminal state and its per-run
    /// state was released.
    Done {
        /// The finished run.
        recall_id: RecallId,
        /// Audio the run was started on.
        audio: AudioId,
    },
    /// An audio's channel layout changed.
    Resize {
        /// The resized audio.
        audio: AudioId,
        /// Sub-channels per pad.
        audio_channels: u32,
        /// Input pads.
        input_pads: u32,
        /// Output pads.
        output_pads: u32,
    },
}

impl RecallEvent {
    /// The run the event is about, if any.
    pub fn recall_id(&self) -> Option<RecallId> {
        match self {
            Self::Started { recall_id, .. }
            | Self::Cancel { recall_id, .. }
            | Self::Done { recall_id, .. } => Some(*recall_id),
            Self::Resize { .. } => None,
        }
    }
}
