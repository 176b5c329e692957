//! Lifecycle notifications for jobs and builds.
//!
//! - [`EventBus`] — in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PlatformEvent`] — the event envelope.
//! - [`EventLogger`] — background subscriber that writes every event to the
//!   tracing log.

pub mod bus;
pub mod logger;

pub use bus::{event_types, EventBus, PlatformEvent};
pub use logger::EventLogger;
