//! CLI command implementations.

pub mod common;
pub mod config;
pub mod render;
pub mod run;
pub mod timing;
