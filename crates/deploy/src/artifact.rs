use gamehost_core::types::DbId;
use gamehost_db::models::compile_job::CompileJob;
use gamehost_db::models::job::Job;
use serde::Serialize;
use uuid::Uuid;

/// A build descriptor together with the job that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct BuildArtifact {
    pub compile_job: CompileJob,
    pub job: Job,
}

impl BuildArtifact {
    pub fn new(compile_job: CompileJob, job: Job) -> Self {
        Self { compile_job, job }
    }

    pub fn id(&self) -> DbId {
        self.compile_job.id
    }

    pub fn directory(&self) -> Uuid {
        self.compile_job.directory_name
    }

    /// Why the artifact cannot be handed to a supervisor, if it cannot.
    ///
    /// The producing job may still be running (the compile job registers its
    /// own output); the validation probe having filled in a security level
    /// is what marks the compile as finished.
    pub fn incomplete_reason(&self) -> Option<&'static str> {
        if !self.compile_job.is_validated() {
            Some("validation has not completed")
        } else if self.job.cancelled {
            Some("its job was cancelled")
        } else if self.job.is_excepted() {
            Some("its job failed")
        } else {
            None
        }
    }
}
