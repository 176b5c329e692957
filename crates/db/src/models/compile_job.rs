//! Build artifact descriptor models.

use gamehost_core::security::SecurityLevel;
use gamehost_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `compile_jobs` table: one compiled build on disk.
///
/// `minimum_security_level` and `api_version` come from the post-compile
/// validation probe. A descriptor without a security level has not finished
/// validating.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CompileJob {
    pub id: DbId,
    pub job_id: DbId,
    pub directory_name: Uuid,
    pub source_file: String,
    pub output: String,
    pub minimum_security_level: Option<i16>,
    pub api_version: Option<String>,
    pub engine_version: String,
    pub revision_id: DbId,
    pub commit_sha: String,
    pub created_at: Timestamp,
}

impl CompileJob {
    pub fn security_level(&self) -> Option<SecurityLevel> {
        self.minimum_security_level.and_then(SecurityLevel::from_id)
    }

    pub fn is_validated(&self) -> bool {
        self.security_level().is_some()
    }
}

/// Input for persisting a finished compilation.
#[derive(Debug, Clone)]
pub struct NewCompileJob {
    pub job_id: DbId,
    pub directory_name: Uuid,
    pub source_file: String,
    pub output: String,
    pub minimum_security_level: Option<SecurityLevel>,
    pub api_version: Option<String>,
    pub engine_version: String,
    pub revision_id: DbId,
    pub commit_sha: String,
}
