use gamehost_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `instances` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Instance {
    pub id: DbId,
    pub name: String,
    pub staged_compile_job_id: Option<DbId>,
    pub created_at: Timestamp,
}
