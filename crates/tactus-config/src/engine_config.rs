//! Engine configuration file format and operations.

use serde::{Deserialize, Serialize};
use std::path::Path;

use tactus_core::{Presets, SampleFormat, SoundScope};

use crate::error::ConfigError;
use crate::validation::{ValidationError, ValidationResult, validate_config};

/// Complete engine configuration.
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// # TOML Format
///
/// ```toml
/// [audio]
/// samplerate = 48000
/// buffer_size = 512
/// pcm_channels = 2
/// format = "s16"
/// output = "playback"
///
/// [timing]
/// bpm = 120.0
/// delay_factor = 0.25
/// loop = [0, 16]
///
/// [threads]
/// workers = 2
/// watchdog_interval_ms = 50
/// hang_after_ticks = 16
/// hang_policy = "subtree"
///
/// [[threads.scopes]]
/// scope = "playback"
/// mode = "synced"
///
/// [[threads.scopes]]
/// scope = "export"
/// mode = "free_running"
/// every = 4
///
/// [gc]
/// overdue_after_ticks = 64
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Soundcard presets.
    pub audio: AudioConfig,
    /// Musical clock.
    pub timing: TimingConfig,
    /// Thread tree layout.
    pub threads: ThreadsConfig,
    /// Recycling collector.
    pub gc: GcConfig,
}

/// `[audio]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Frames per second.
    pub samplerate: u32,
    /// Frames per tick.
    pub buffer_size: u32,
    /// Interleaved output channels.
    pub pcm_channels: u16,
    /// Sample format name, see [`SampleFormat`].
    pub format: String,
    /// Sound scope mixed to the soundcard.
    pub output: String,
    /// Frames kept per signal.
    pub ring_len: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let presets = Presets::default();
        Self {
            samplerate: presets.samplerate,
            buffer_size: presets.buffer_size,
            pcm_channels: presets.pcm_channels,
            format: presets.format.as_str().to_string(),
            output: SoundScope::Playback.as_str().to_string(),
            ring_len: tactus_core::graph::DEFAULT_RING_LEN,
        }
    }
}

/// `[timing]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Tempo in beats per minute.
    pub bpm: f64,
    /// Subdivision length relative to a sixteenth.
    pub delay_factor: f64,
    /// Loop range `[left, right)` in subdivisions.
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_range: Option<[u64; 2]>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            bpm: tactus_core::timing::DEFAULT_BPM,
            delay_factor: tactus_core::timing::DEFAULT_DELAY_FACTOR,
            loop_range: None,
        }
    }
}

/// What a detected hang stops.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HangEscalation {
    /// The hung node and its descendants.
    #[default]
    Subtree,
    /// The whole tree.
    Tree,
}

/// How a scope thread follows the root.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// Once per root tick, awaited.
    #[default]
    Synced,
    /// Every `every` root ticks, not awaited.
    FreeRunning,
    /// Every `period_ms`, on the wall clock.
    TimeLocked,
}

/// One `[[threads.scopes]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScopeConfig {
    /// Sound scope name.
    pub scope: String,
    /// Sync mode.
    #[serde(default)]
    pub mode: NodeMode,
    /// Root ticks per run, for `free_running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u32>,
    /// Milliseconds per run, for `time_locked`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
}

impl ScopeConfig {
    /// A synced thread for `scope`.
    pub fn synced(scope: SoundScope) -> Self {
        Self {
            scope: scope.as_str().to_string(),
            mode: NodeMode::Synced,
            every: None,
            period_ms: None,
        }
    }

    /// Parsed scope name.
    pub fn sound_scope(&self) -> ValidationResult<SoundScope> {
        self.scope
            .parse()
            .map_err(|_| ValidationError::UnknownScope(self.scope.clone()))
    }
}

/// `[threads]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThreadsConfig {
    /// Worker pool size; 0 disables the pool.
    pub workers: usize,
    /// Watchdog period in milliseconds; 0 disables the watchdog.
    pub watchdog_interval_ms: u64,
    /// Ticks a node may fall behind before it counts as hung.
    pub hang_after_ticks: u64,
    /// What a hang stops.
    pub hang_policy: HangEscalation,
    /// How often a parent re-checks a child it waits on, in milliseconds.
    pub poll_interval_ms: u64,
    /// Scopes with a thread of their own.
    pub scopes: Vec<ScopeConfig>,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            watchdog_interval_ms: 50,
            hang_after_ticks: 16,
            hang_policy: HangEscalation::Subtree,
            poll_interval_ms: 5,
            scopes: vec![
                ScopeConfig::synced(SoundScope::Playback),
                ScopeConfig::synced(SoundScope::Export),
            ],
        }
    }
}

/// `[gc]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcConfig {
    /// Ticks a stopped recycling may stay pending before it is reported.
    pub overdue_after_ticks: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            overdue_after_ticks: tactus_core::gc::DEFAULT_OVERDUE_AFTER_TICKS,
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }

        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every section; see [`validate_config`].
    pub fn validate(&self) -> ValidationResult<()> {
        validate_config(self)
    }

    /// Soundcard presets described by `[audio]`.
    pub fn presets(&self) -> ValidationResult<Presets> {
        let format: SampleFormat = self
            .audio
            .format
            .parse()
            .map_err(|_| ValidationError::UnknownFormat(self.audio.format.clone()))?;
        Ok(Presets {
            samplerate: self.audio.samplerate,
            buffer_size: self.audio.buffer_size,
            pcm_channels: self.audio.pcm_channels,
            format,
        })
    }

    /// Scope mixed to the soundcard.
    pub fn output_scope(&self) -> ValidationResult<SoundScope> {
        self.audio
            .output
            .parse()
            .map_err(|_| ValidationError::UnknownScope(self.audio.output.clone()))
    }

    /// Loop range as a tuple.
    pub fn loop_range(&self) -> Option<(u64, u64)> {
        self.timing.loop_range.map(|[left, right]| (left, right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.presets().unwrap(), Presets::default());
        assert_eq!(config.output_scope().unwrap(), SoundScope::Playback);
        assert_eq!(config.threads.scopes.len(), 2);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [audio]
            buffer_size = 256

            [timing]
            bpm = 90.0
            loop = [4, 12]
            "#,
        )
        .unwrap();
        assert_eq!(config.audio.buffer_size, 256);
        assert_eq!(config.audio.samplerate, 48000);
        assert_eq!(config.timing.bpm, 90.0);
        assert_eq!(config.timing.delay_factor, 0.25);
        assert_eq!(config.loop_range(), Some((4, 12)));
    }

    #[test]
    fn test_scope_entries() {
        let config = EngineConfig::from_toml(
            r#"
            [[threads.scopes]]
            scope = "sequencer"
            mode = "free_running"
            every = 2

            [[threads.scopes]]
            scope = "midi"
            mode = "time_locked"
            period_ms = 10
            "#,
        )
        .unwrap();
        let scopes = &config.threads.scopes;
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].sound_scope().unwrap(), SoundScope::Sequencer);
        assert_eq!(scopes[0].mode, NodeMode::FreeRunning);
        assert_eq!(scopes[0].every, Some(2));
        assert_eq!(scopes[1].mode, NodeMode::TimeLocked);
        assert_eq!(scopes[1].period_ms, Some(10));
    }

    #[test]
    fn test_invalid_values_fail_to_load() {
        assert!(EngineConfig::from_toml("[audio]\nformat = \"s12\"").is_err());
        assert!(EngineConfig::from_toml("[timing]\nbpm = -1.0").is_err());
        assert!(EngineConfig::from_toml("[threads]\nhang_policy = \"everything\"").is_err());
    }

    #[test]
    fn test_to_toml_round_trip() {
        let mut config = EngineConfig::default();
        config.timing.loop_range = Some([0, 8]);
        config.threads.hang_policy = HangEscalation::Tree;
        let text = config.to_toml().unwrap();
        assert!(text.contains("hang_policy = \"tree\""));
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }
}
