//! Persistence traits consumed by the scheduler and the build registry.
//!
//! Any durable store with read/write/query works. [`crate::PgStore`] is the
//! production implementation and [`crate::MemoryStore`] keeps everything in
//! process.

use async_trait::async_trait;
use gamehost_core::types::DbId;

use crate::models::compile_job::{CompileJob, NewCompileJob};
use crate::models::job::{Job, JobCompletion, NewJob};

pub type StoreResult<T> = Result<T, sqlx::Error>;

/// The job ledger.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a running job (`started_at = now`, not cancelled).
    async fn insert_job(&self, input: &NewJob) -> StoreResult<Job>;

    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>>;

    /// Record the cancelling user. Returns `None` for an unknown id.
    async fn record_cancelled_by(&self, id: DbId, user_id: DbId) -> StoreResult<Option<Job>>;

    /// Write `stopped_at = now` plus the outcome, once.
    ///
    /// Returns `None` if the job is unknown or already stopped.
    async fn finish_job(&self, id: DbId, completion: &JobCompletion) -> StoreResult<Option<Job>>;

    /// Mark rows left running by a previous process as cancelled.
    async fn cancel_orphaned_jobs(&self) -> StoreResult<u64>;
}

/// Build descriptors and the per-instance staged build.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_compile_job(&self, input: &NewCompileJob) -> StoreResult<CompileJob>;

    /// Latest build whose job stopped without cancellation or failure,
    /// together with that job.
    async fn latest_completed_build(&self, instance_id: DbId)
        -> StoreResult<Option<(CompileJob, Job)>>;

    async fn staged_build(&self, instance_id: DbId) -> StoreResult<Option<CompileJob>>;

    async fn set_staged_build(&self, instance_id: DbId, compile_job_id: DbId) -> StoreResult<()>;
}
