//! PostgreSQL-backed store delegating to the repositories.

use async_trait::async_trait;
use gamehost_core::types::DbId;

use crate::models::compile_job::{CompileJob, NewCompileJob};
use crate::models::job::{Job, JobCompletion, NewJob};
use crate::repositories::{CompileJobRepo, InstanceRepo, JobRepo};
use crate::store::{DeploymentStore, JobStore, StoreResult};
use crate::DbPool;

/// [`JobStore`] and [`DeploymentStore`] over a connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, input: &NewJob) -> StoreResult<Job> {
        JobRepo::create(&self.pool, input).await
    }

    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn record_cancelled_by(&self, id: DbId, user_id: DbId) -> StoreResult<Option<Job>> {
        JobRepo::set_cancelled_by(&self.pool, id, user_id).await
    }

    async fn finish_job(&self, id: DbId, completion: &JobCompletion) -> StoreResult<Option<Job>> {
        JobRepo::finish(&self.pool, id, completion).await
    }

    async fn cancel_orphaned_jobs(&self) -> StoreResult<u64> {
        JobRepo::cancel_orphaned(&self.pool).await
    }
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn insert_compile_job(&self, input: &NewCompileJob) -> StoreResult<CompileJob> {
        CompileJobRepo::create(&self.pool, input).await
    }

    async fn latest_completed_build(
        &self,
        instance_id: DbId,
    ) -> StoreResult<Option<(CompileJob, Job)>> {
        let Some(compile_job) = CompileJobRepo::latest_completed(&self.pool, instance_id).await?
        else {
            return Ok(None);
        };
        let job = JobRepo::find_by_id(&self.pool, compile_job.job_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(Some((compile_job, job)))
    }

    async fn staged_build(&self, instance_id: DbId) -> StoreResult<Option<CompileJob>> {
        let staged_id = InstanceRepo::find_by_id(&self.pool, instance_id)
            .await?
            .and_then(|instance| instance.staged_compile_job_id);
        match staged_id {
            Some(id) => CompileJobRepo::find_by_id(&self.pool, id).await,
            None => Ok(None),
        }
    }

    async fn set_staged_build(&self, instance_id: DbId, compile_job_id: DbId) -> StoreResult<()> {
        InstanceRepo::set_staged_compile_job(&self.pool, instance_id, compile_job_id).await
    }
}
