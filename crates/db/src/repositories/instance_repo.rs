//! Repository for the `instances` table.

use gamehost_core::types::DbId;
use sqlx::PgPool;

use crate::models::instance::Instance;

const COLUMNS: &str = "id, name, staged_compile_job_id, created_at";

pub struct InstanceRepo;

impl InstanceRepo {
    /// Fetch an instance by name, creating it on first use.
    pub async fn find_or_create(pool: &PgPool, name: &str) -> Result<Instance, sqlx::Error> {
        let query = format!(
            "INSERT INTO instances (name) VALUES ($1) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Instance>(&query)
            .bind(name)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Instance>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM instances WHERE id = $1");
        sqlx::query_as::<_, Instance>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Record the build that should go live on the next swap.
    pub async fn set_staged_compile_job(
        pool: &PgPool,
        id: DbId,
        compile_job_id: DbId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE instances SET staged_compile_job_id = $2 WHERE id = $1")
            .bind(id)
            .bind(compile_job_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
