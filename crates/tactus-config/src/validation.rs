//! Engine configuration validation.
//!
//! Every check runs and all failures are reported together, so a user fixing
//! a config file sees the whole list at once.
//!
//! # Example
//!
//! ```rust
//! use tactus_config::{EngineConfig, validate_config};
//!
//! let mut config = EngineConfig::default();
//! assert!(validate_config(&config).is_ok());
//!
//! config.audio.buffer_size = 0;
//! config.timing.bpm = f64::NAN;
//! assert!(validate_config(&config).is_err());
//! ```

use std::collections::HashSet;
use thiserror::Error;

use crate::engine_config::{EngineConfig, NodeMode};

/// Largest accepted samplerate.
pub const MAX_SAMPLERATE: u32 = 768_000;

/// Largest accepted buffer size in frames.
pub const MAX_BUFFER_SIZE: u32 = 65_536;

/// Largest accepted interleaved channel count.
pub const MAX_PCM_CHANNELS: u16 = 64;

/// Largest accepted worker pool.
pub const MAX_WORKERS: usize = 256;

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// A numeric field is outside its accepted range.
    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Dotted field path.
        field: &'static str,
        /// Offending value.
        value: f64,
        /// Minimum allowed value.
        min: f64,
        /// Maximum allowed value.
        max: f64,
    },

    /// Unknown sample format name.
    #[error("unknown sample format: {0}")]
    UnknownFormat(String),

    /// Unknown sound scope name.
    #[error("unknown sound scope: {0}")]
    UnknownScope(String),

    /// A sound scope is listed twice under `[[threads.scopes]]`.
    #[error("sound scope '{0}' is assigned more than one thread")]
    DuplicateScope(String),

    /// A scope entry's mode is missing its parameter or has a zero one.
    #[error("scope '{scope}': {reason}")]
    InvalidMode {
        /// Scope name.
        scope: String,
        /// What is wrong.
        reason: String,
    },

    /// Loop range with `left >= right`.
    #[error("loop range [{left}, {right}) is empty")]
    EmptyLoop {
        /// Loop start.
        left: u64,
        /// Loop end.
        right: u64,
    },

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn check_range(errors: &mut Vec<ValidationError>, field: &'static str, value: f64, min: f64, max: f64) {
    if !(min..=max).contains(&value) {
        errors.push(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &'static str, value: f64, max: f64) {
    if value.is_nan() || value <= 0.0 || value > max {
        errors.push(ValidationError::OutOfRange {
            field,
            value,
            min: 0.0,
            max,
        });
    }
}

/// Checks every section of `config`.
///
/// Returns the single error when exactly one check fails, otherwise
/// [`ValidationError::Multiple`].
pub fn validate_config(config: &EngineConfig) -> ValidationResult<()> {
    let mut errors = Vec::new();

    let audio = &config.audio;
    check_range(&mut errors, "audio.samplerate", f64::from(audio.samplerate), 1.0, f64::from(MAX_SAMPLERATE));
    check_range(&mut errors, "audio.buffer_size", f64::from(audio.buffer_size), 1.0, f64::from(MAX_BUFFER_SIZE));
    check_range(
        &mut errors,
        "audio.pcm_channels",
        f64::from(audio.pcm_channels),
        1.0,
        f64::from(MAX_PCM_CHANNELS),
    );
    check_range(&mut errors, "audio.ring_len", audio.ring_len as f64, 2.0, 1024.0);
    if let Err(err) = config.presets() {
        errors.push(err);
    }
    if let Err(err) = config.output_scope() {
        errors.push(err);
    }

    let timing = &config.timing;
    check_positive(&mut errors, "timing.bpm", timing.bpm, 999.0);
    check_positive(&mut errors, "timing.delay_factor", timing.delay_factor, 64.0);
    if let Some([left, right]) = timing.loop_range
        && left >= right
    {
        errors.push(ValidationError::EmptyLoop { left, right });
    }

    let threads = &config.threads;
    check_range(&mut errors, "threads.workers", threads.workers as f64, 0.0, MAX_WORKERS as f64);
    check_range(
        &mut errors,
        "threads.hang_after_ticks",
        threads.hang_after_ticks as f64,
        1.0,
        f64::from(u32::MAX),
    );
    check_range(&mut errors, "threads.poll_interval_ms", threads.poll_interval_ms as f64, 1.0, 1000.0);

    let mut seen = HashSet::new();
    for entry in &threads.scopes {
        match entry.sound_scope() {
            Ok(scope) => {
                if !seen.insert(scope) {
                    errors.push(ValidationError::DuplicateScope(entry.scope.clone()));
                }
            }
            Err(err) => errors.push(err),
        }
        let problem = match entry.mode {
            NodeMode::Synced => None,
            NodeMode::FreeRunning => match entry.every {
                Some(0) | None => Some("free_running needs `every` >= 1"),
                Some(_) => None,
            },
            NodeMode::TimeLocked => match entry.period_ms {
                Some(0) | None => Some("time_locked needs `period_ms` >= 1"),
                Some(_) => None,
            },
        };
        if let Some(reason) = problem {
            errors.push(ValidationError::InvalidMode {
                scope: entry.scope.clone(),
                reason: reason.to_string(),
            });
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_config::ScopeConfig;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(validate_config(&EngineConfig::default()), Ok(()));
    }

    #[test]
    fn test_single_error_is_not_wrapped() {
        let mut config = EngineConfig::default();
        config.audio.buffer_size = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::OutOfRange { field: "audio.buffer_size", .. })
        ));
    }

    #[test]
    fn test_nan_tempo_is_rejected() {
        let mut config = EngineConfig::default();
        config.timing.bpm = f64::NAN;
        assert!(matches!(
            validate_config(&config),
            Err(ValidationError::OutOfRange { field: "timing.bpm", .. })
        ));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = EngineConfig::default();
        config.audio.format = "u8".into();
        config.timing.loop_range = Some([8, 8]);
        config.threads.scopes.push(ScopeConfig::synced(tactus_core::SoundScope::Playback));
        let Err(ValidationError::Multiple(errors)) = validate_config(&config) else {
            panic!("expected multiple errors");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ValidationError::UnknownFormat("u8".into())));
        assert!(errors.contains(&ValidationError::EmptyLoop { left: 8, right: 8 }));
        assert!(errors.contains(&ValidationError::DuplicateScope("playback".into())));
    }

    #[test]
    fn test_mode_parameters_are_required() {
        let mut config = EngineConfig::default();
        config.threads.scopes = vec![ScopeConfig {
            scope: "wave".into(),
            mode: NodeMode::TimeLocked,
            every: Some(3),
            period_ms: None,
        }];
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("period_ms"), "got: {err}");

        config.threads.scopes[0].mode = NodeMode::FreeRunning;
        assert_eq!(validate_config(&config), Ok(()));
    }

    #[test]
    fn test_multiple_display_joins_messages() {
        let err = ValidationError::Multiple(vec![
            ValidationError::UnknownScope("a".into()),
            ValidationError::UnknownFormat("b".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "multiple validation errors: unknown sound scope: a; unknown sample format: b"
        );
    }
}
