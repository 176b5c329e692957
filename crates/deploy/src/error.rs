use gamehost_core::error::JobError;
use gamehost_core::types::DbId;

/// Errors raised by [`crate::BuildArtifactRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The descriptor cannot be loaded yet (or ever).
    #[error("Build {id} is not loadable: {reason}")]
    Incomplete { id: DbId, reason: &'static str },

    /// Loading would move the staged build backwards in time.
    #[error("Build {id} started before the staged build {staged}")]
    OlderThanStaged { id: DbId, staged: DbId },

    /// The last lease was released and the directory is being deleted.
    #[error("Build {id} has been retired")]
    ArtifactRetired { id: DbId },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deletion worker has stopped")]
    WorkerStopped,

    #[error("Registry closed before a build was loaded")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for JobError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Cancelled => JobError::Cancelled,
            other => JobError::internal(other),
        }
    }
}
