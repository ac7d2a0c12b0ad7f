//! keepalive-daemon library: configuration loading for the daemon binary.
//!
//! Kept separate from `main.rs` so integration tests can reach it.

pub mod config;

pub use config::{load_config, ConfigOverrides};
