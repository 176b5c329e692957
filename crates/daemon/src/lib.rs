//! `gamehost-daemon` library crate.
//!
//! Wires the job scheduler, build registry and compile orchestrator of one
//! game server instance together. The binary entrypoint lives in `main.rs`.

pub mod app;
pub mod config;
pub mod error;

pub use app::Daemon;
pub use config::{ConfigError, DaemonConfig};
pub use error::DaemonError;
