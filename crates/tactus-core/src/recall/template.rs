//! Recall templates and their per-node instances.

use super::processor::RecallProcessor;
use super::state::RecallState;
use crate::graph::{AudioId, ChannelId, Direction, RecyclingId};

/// Which graph node a recall attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecallScope {
    /// One instance per audio, no buffers.
    Audio,
    /// One instance per channel. Follows the channel across relinks.
    Channel,
    /// One instance per recycling. Rebuilt when the channel's recycling changes.
    Recycling,
}

/// The node an instantiated recall is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallTarget {
    /// Audio-scoped.
    Audio(AudioId),
    /// Channel-scoped.
    Channel(ChannelId),
    /// Recycling-scoped.
    Recycling {
        /// Channel owning the recycling.
        channel: ChannelId,
        /// The recycling itself.
        recycling: RecyclingId,
    },
}

/// Unattached prototype held by an audio.
pub struct RecallTemplate {
    name: String,
    scope: RecallScope,
    direction: Option<Direction>,
    persistent: bool,
    processor: Box<dyn RecallProcessor>,
}

impl RecallTemplate {
    /// Creates a template from a processor. The name defaults to the processor's.
    pub fn new(scope: RecallScope, processor: impl RecallProcessor + 'static) -> Self {
        Self::from_boxed(scope, Box::new(processor))
    }

    /// Creates a template from an already boxed processor.
    pub fn from_boxed(scope: RecallScope, processor: Box<dyn RecallProcessor>) -> Self {
        Self {
            name: processor.name().to_string(),
            scope,
            direction: None,
            persistent: false,
            processor,
        }
    }

    /// Restricts a channel or recycling template to one side of the audio.
    pub fn on(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Marks instances as persistent: natural completion is ignored and only
    /// cancellation ends them.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Overrides the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Name used in logs and notifications.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attachment scope.
    pub fn scope(&self) -> RecallScope {
        self.scope
    }

    /// Side restriction, if any.
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    /// Returns `true` if instances ignore natural completion.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Returns `true` if this template should be cloned onto a channel of `direction`.
    pub fn applies_to(&self, direction: Direction) -> bool {
        self.scope != RecallScope::Audio && self.direction.is_none_or(|d| d == direction)
    }
}

impl Clone for RecallTemplate {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            scope: self.scope,
            direction: self.direction,
            persistent: self.persistent,
            processor: self.processor.box_clone(),
        }
    }
}

impl core::fmt::Debug for RecallTemplate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecallTemplate")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("direction", &self.direction)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// A template cloned onto a specific node, ready to join runs.
pub struct RecallInstance {
    name: String,
    scope: RecallScope,
    target: RecallTarget,
    persistent: bool,
    processor: Box<dyn RecallProcessor>,
}

impl RecallInstance {
    /// Name inherited from the template.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attachment scope.
    pub fn scope(&self) -> RecallScope {
        self.scope
    }

    /// Node this instance is bound to.
    pub fn target(&self) -> RecallTarget {
        self.target
    }

    /// Returns `true` if natural completion is ignored.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn retarget(&mut self, target: RecallTarget) {
        self.target = target;
    }

    /// Fresh processor for one run.
    pub(crate) fn spawn_processor(&self) -> Box<dyn RecallProcessor> {
        self.processor.box_clone()
    }
}

impl core::fmt::Debug for RecallInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecallInstance")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A recall, polymorphic over template and per-node instance.
#[derive(Debug)]
pub enum Recall {
    /// Prototype stored on an audio.
    Template(RecallTemplate),
    /// Clone bound to an audio, channel or recycling.
    Instance(RecallInstance),
}

impl Recall {
    /// Lifecycle state outside of any run.
    pub fn state(&self) -> RecallState {
        match self {
            Self::Template(_) => RecallState::Template,
            Self::Instance(_) => RecallState::Instantiated,
        }
    }

    /// Returns `true` for templates.
    pub fn is_template(&self) -> bool {
        matches!(self, Self::Template(_))
    }

    /// Display name.
    pub fn name(&self) -> &str {
        match self {
            Self::Template(t) => t.name(),
            Self::Instance(i) => i.name(),
        }
    }

    /// Attachment scope.
    pub fn scope(&self) -> RecallScope {
        match self {
            Self::Template(t) => t.scope(),
            Self::Instance(i) => i.scope(),
        }
    }

    /// The instance, if this is one.
    pub fn as_instance(&self) -> Option<&RecallInstance> {
        match self {
            Self::Instance(i) => Some(i),
            Self::Template(_) => None,
        }
    }

    pub(crate) fn as_instance_mut(&mut self) -> Option<&mut RecallInstance> {
        match self {
            Self::Instance(i) => Some(i),
            Self::Template(_) => None,
        }
    }

    /// Clones a template onto `target`, stripping the template flag.
    ///
    /// Returns `None` when called on an instance: only templates instantiate.
    pub fn instantiate(&self, target: RecallTarget) -> Option<Recall> {
        let Self::Template(template) = self else {
            return None;
        };
        Some(Self::Instance(RecallInstance {
            name: template.name.clone(),
            scope: template.scope,
            target,
            persistent: template.persistent,
            processor: template.processor.box_clone(),
        }))
    }
}

impl From<RecallTemplate> for Recall {
    fn from(template: RecallTemplate) -> Self {
        Self::Template(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recall::processor::{Volume, Tone};

    #[test]
    fn test_instantiate_strips_template_flag() {
        let recall: Recall = RecallTemplate::new(RecallScope::Channel, Volume::new(0.5))
            .persistent()
            .into();
        assert!(recall.is_template());
        let instance = recall
            .instantiate(RecallTarget::Channel(ChannelId::sentinel()))
            .unwrap();
        assert!(!instance.is_template());
        assert_eq!(instance.state(), RecallState::Instantiated);
        assert_eq!(instance.name(), "volume");
        assert!(instance.as_instance().unwrap().is_persistent());
    }

    #[test]
    fn test_instances_do_not_instantiate() {
        let recall: Recall = RecallTemplate::new(RecallScope::Audio, Tone::new(440.0, 1.0)).into();
        let instance = recall.instantiate(RecallTarget::Audio(AudioId::sentinel())).unwrap();
        assert!(instance.instantiate(RecallTarget::Audio(AudioId::sentinel())).is_none());
    }

    #[test]
    fn test_applies_to_direction() {
        let any = RecallTemplate::new(RecallScope::Recycling, Volume::new(1.0));
        let inputs = RecallTemplate::new(RecallScope::Channel, Volume::new(1.0)).on(Direction::Input);
        let audio = RecallTemplate::new(RecallScope::Audio, Volume::new(1.0));
        assert!(any.applies_to(Direction::Output));
        assert!(inputs.applies_to(Direction::Input));
        assert!(!inputs.applies_to(Direction::Output));
        assert!(!audio.applies_to(Direction::Input));
    }
}
