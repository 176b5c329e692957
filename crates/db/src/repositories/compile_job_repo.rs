//! Repository for the `compile_jobs` table.

use gamehost_core::types::DbId;
use sqlx::PgPool;

use crate::models::compile_job::{CompileJob, NewCompileJob};

/// Column list for `compile_jobs` queries.
const COLUMNS: &str = "\
    id, job_id, directory_name, source_file, output, \
    minimum_security_level, api_version, engine_version, \
    revision_id, commit_sha, created_at";

/// Same columns qualified for joins against `jobs`.
const QUALIFIED_COLUMNS: &str = "\
    cj.id, cj.job_id, cj.directory_name, cj.source_file, cj.output, \
    cj.minimum_security_level, cj.api_version, cj.engine_version, \
    cj.revision_id, cj.commit_sha, cj.created_at";

pub struct CompileJobRepo;

impl CompileJobRepo {
    pub async fn create(pool: &PgPool, input: &NewCompileJob) -> Result<CompileJob, sqlx::Error> {
        let query = format!(
            "INSERT INTO compile_jobs \
                 (job_id, directory_name, source_file, output, minimum_security_level, \
                  api_version, engine_version, revision_id, commit_sha) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, CompileJob>(&query)
            .bind(input.job_id)
            .bind(input.directory_name)
            .bind(&input.source_file)
            .bind(&input.output)
            .bind(input.minimum_security_level.map(|level| level.id()))
            .bind(&input.api_version)
            .bind(&input.engine_version)
            .bind(input.revision_id)
            .bind(&input.commit_sha)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<CompileJob>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM compile_jobs WHERE id = $1");
        sqlx::query_as::<_, CompileJob>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Most recent build of an instance whose job finished cleanly.
    pub async fn latest_completed(
        pool: &PgPool,
        instance_id: DbId,
    ) -> Result<Option<CompileJob>, sqlx::Error> {
        let query = format!(
            "SELECT {QUALIFIED_COLUMNS} FROM compile_jobs cj \
             JOIN jobs j ON j.id = cj.job_id \
             WHERE j.instance_id = $1 \
               AND j.stopped_at IS NOT NULL \
               AND NOT j.cancelled \
               AND j.error_code IS NULL \
               AND j.exception_details IS NULL \
             ORDER BY cj.id DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, CompileJob>(&query)
            .bind(instance_id)
            .fetch_optional(pool)
            .await
    }
}
