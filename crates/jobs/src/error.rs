use gamehost_core::error::CoreError;

/// Errors raised by [`crate::JobScheduler`] operations themselves.
///
/// Failures of a job *body* never surface here; they are recorded in the
/// ledger by the completion funnel.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// `wait_for_completion` was called without a cancellation token.
    #[error("waiting for a job requires a cancellable token")]
    UncancellableWait,

    #[error("scheduler has already been activated")]
    AlreadyActivated,

    /// The caller's token fired before the awaited condition was met.
    #[error("wait was cancelled")]
    WaitCancelled,
}
