//! Job ledger models.

use gamehost_core::error::ErrorCode;
use gamehost_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `jobs` table.
///
/// `stopped_at` is `None` while the job is running and is written exactly
/// once by the scheduler's completion funnel.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub instance_id: DbId,
    pub description: String,
    pub started_by: DbId,
    pub cancelled_by: Option<DbId>,
    pub started_at: Timestamp,
    pub stopped_at: Option<Timestamp>,
    pub cancelled: bool,
    pub error_code: Option<i32>,
    pub exception_details: Option<String>,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.stopped_at.is_none()
    }

    /// Whether the job ended in a recorded failure.
    pub fn is_excepted(&self) -> bool {
        self.error_code.is_some() || self.exception_details.is_some()
    }

    /// Decoded failure code, when one was recorded and is known.
    pub fn error(&self) -> Option<ErrorCode> {
        self.error_code.and_then(ErrorCode::from_id)
    }
}

/// Input for registering a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub instance_id: DbId,
    pub description: String,
    /// Acting user; the system account when `None`.
    pub started_by: Option<DbId>,
}

impl NewJob {
    pub fn new(instance_id: DbId, description: impl Into<String>) -> Self {
        Self {
            instance_id,
            description: description.into(),
            started_by: None,
        }
    }

    pub fn started_by(mut self, user_id: DbId) -> Self {
        self.started_by = Some(user_id);
        self
    }
}

/// Terminal fields written when a job stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCompletion {
    pub cancelled: bool,
    pub error_code: Option<i32>,
    pub exception_details: Option<String>,
}

impl JobCompletion {
    pub fn succeeded() -> Self {
        Self::default()
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    pub fn failed(code: Option<ErrorCode>, details: impl Into<String>) -> Self {
        Self {
            cancelled: false,
            error_code: code.map(ErrorCode::id),
            exception_details: Some(details.into()),
        }
    }
}
