//! Chat notifications and the running-server query.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    /// Best effort; delivery failures are the notifier's problem.
    async fn send_update_message(&self, text: &str, token: &CancellationToken);
}

/// Writes chat updates to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl ChatNotifier for LogNotifier {
    async fn send_update_message(&self, text: &str, _token: &CancellationToken) {
        tracing::info!(message = text, "Chat update");
    }
}

pub trait ProcessSupervisor: Send + Sync {
    /// Whether a game server process is currently running.
    fn is_currently_running(&self) -> bool;
}

/// Supervisor state set by whoever launches the server.
#[derive(Debug, Default)]
pub struct StaticSupervisor {
    running: AtomicBool,
}

impl StaticSupervisor {
    pub fn new(running: bool) -> Self {
        Self {
            running: AtomicBool::new(running),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl ProcessSupervisor for StaticSupervisor {
    fn is_currently_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
