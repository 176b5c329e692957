//! Repository for the `jobs` table.

use gamehost_core::types::{DbId, SYSTEM_USER_ID};
use sqlx::PgPool;

use crate::models::job::{Job, JobCompletion, NewJob};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, instance_id, description, started_by, cancelled_by, \
    started_at, stopped_at, cancelled, error_code, exception_details";

/// Provides ledger operations for jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a running job. `started_at` is set by the database.
    pub async fn create(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (instance_id, description, started_by) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.instance_id)
            .bind(&input.description)
            .bind(input.started_by.unwrap_or(SYSTEM_USER_ID))
            .fetch_one(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Record who cancelled a job. The first canceller wins.
    pub async fn set_cancelled_by(
        pool: &PgPool,
        id: DbId,
        user_id: DbId,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs SET cancelled_by = COALESCE(cancelled_by, $2) \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }

    /// Write the terminal state of a job.
    ///
    /// Only a running row is updated, so `stopped_at` is written at most
    /// once. Returns `None` when the job was already stopped.
    pub async fn finish(
        pool: &PgPool,
        id: DbId,
        completion: &JobCompletion,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET stopped_at = NOW(), cancelled = $2, error_code = $3, exception_details = $4 \
             WHERE id = $1 AND stopped_at IS NULL \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(completion.cancelled)
            .bind(completion.error_code)
            .bind(&completion.exception_details)
            .fetch_optional(pool)
            .await
    }

    /// Mark every job left running by a previous process as cancelled.
    pub async fn cancel_orphaned(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET cancelled = TRUE, stopped_at = NOW() WHERE stopped_at IS NULL",
        )
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
