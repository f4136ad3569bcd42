//! Engine configuration for tactus.
//!
//! One TOML file describes everything the engine needs at startup: the
//! soundcard presets, the musical clock, the thread tree layout and the
//! collector threshold. Every field has a default, so a missing file or an
//! empty one both yield a runnable engine.
//!
//! # Features
//!
//! - **Config file**: [`EngineConfig`] loads, validates and saves TOML
//! - **Validation**: [`validate_config`] reports every problem at once
//! - **Paths**: platform config directory (feature `paths`)
//!
//! # Example
//!
//! ```rust
//! use tactus_config::{EngineConfig, NodeMode};
//!
//! let config = EngineConfig::from_toml(
//!     r#"
//!     [audio]
//!     buffer_size = 256
//!
//!     [[threads.scopes]]
//!     scope = "playback"
//!
//!     [[threads.scopes]]
//!     scope = "export"
//!     mode = "free_running"
//!     every = 4
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.presets().unwrap().buffer_size, 256);
//! assert_eq!(config.threads.scopes[1].mode, NodeMode::FreeRunning);
//! ```

mod engine_config;
mod error;

/// Engine configuration validation.
pub mod validation;

/// Platform-specific paths for configuration files.
#[cfg(feature = "paths")]
pub mod paths;

pub use engine_config::{
    AudioConfig, EngineConfig, GcConfig, HangEscalation, NodeMode, ScopeConfig, ThreadsConfig, TimingConfig,
};
pub use error::ConfigError;
#[cfg(feature = "paths")]
pub use paths::{default_config_path, ensure_user_config_dir, find_config, user_config_dir};
pub use validation::{ValidationError, ValidationResult, validate_config};
