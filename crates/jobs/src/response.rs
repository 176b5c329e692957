use gamehost_db::models::job::Job;
use serde::Serialize;

use crate::handle::JobProgress;

/// A ledger row enriched with live progress, as handed to API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    pub stage: Option<String>,
    pub progress: Option<i16>,
    pub progress_is_estimate: bool,
}

impl JobResponse {
    pub(crate) fn merge(&mut self, progress: JobProgress) {
        self.stage = progress.stage;
        self.progress = progress.percent;
        self.progress_is_estimate = progress.estimated;
    }
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job,
            stage: None,
            progress: None,
            progress_is_estimate: false,
        }
    }
}
