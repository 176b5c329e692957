//! The deployment job: compile the active repository code as a scheduled job.

use std::sync::Arc;
use std::time::Duration;

use gamehost_core::error::JobError;
use gamehost_core::types::DbId;
use gamehost_db::models::job::{Job, NewJob};
use gamehost_db::DeploymentStore;
use gamehost_jobs::{job_body, JobContext, JobScheduler, SchedulerError};

use crate::compiler::{CompileOrchestrator, CompileRequest, CompileSettings};
use crate::repository::SourceRepository;

/// Description of every deployment job in the ledger.
pub const DEPLOY_JOB_DESCRIPTION: &str = "Compile active repository code";

/// Runtime context handed to deployment bodies once the scheduler activates.
pub struct DeploymentRuntime {
    pub orchestrator: Arc<CompileOrchestrator>,
    pub repository: Arc<dyn SourceRepository>,
    pub store: Arc<dyn DeploymentStore>,
    pub settings: CompileSettings,
    pub probe_timeout: Duration,
    /// Fixed compile estimate. When `None` the duration of the last
    /// completed deployment is used, if there is one.
    pub estimated_duration: Option<Duration>,
}

pub struct DeploymentManager {
    instance_id: DbId,
    scheduler: Arc<JobScheduler<DeploymentRuntime>>,
}

impl DeploymentManager {
    pub fn new(instance_id: DbId, scheduler: Arc<JobScheduler<DeploymentRuntime>>) -> Self {
        Self {
            instance_id,
            scheduler,
        }
    }

    /// Register a deployment job. The compile starts once the scheduler is active.
    pub async fn deploy(&self, user_id: Option<DbId>) -> Result<Job, SchedulerError> {
        let mut new_job = NewJob::new(self.instance_id, DEPLOY_JOB_DESCRIPTION);
        if let Some(user_id) = user_id {
            new_job = new_job.started_by(user_id);
        }
        let job = self
            .scheduler
            .register_job(new_job, job_body(run_deployment))
            .await?;
        tracing::info!(job_id = job.id, instance_id = self.instance_id, "Deployment queued");
        Ok(job)
    }
}

async fn run_deployment(ctx: JobContext<DeploymentRuntime>) -> Result<(), JobError> {
    let runtime = &ctx.runtime;
    let revision = runtime.repository.revision().await?;
    let estimated_duration = match runtime.estimated_duration {
        Some(estimate) => Some(estimate),
        None => previous_duration(runtime.store.as_ref(), ctx.job.instance_id).await,
    };

    let compile_job = runtime
        .orchestrator
        .compile(
            CompileRequest {
                job: &ctx.job,
                revision: &revision,
                settings: &runtime.settings,
                probe_timeout: runtime.probe_timeout,
                estimated_duration,
            },
            runtime.repository.as_ref(),
            &ctx.progress,
            &ctx.cancel,
        )
        .await?;

    tracing::info!(
        job_id = ctx.job.id,
        compile_job_id = compile_job.id,
        commit_sha = %compile_job.commit_sha,
        "Deployment finished",
    );
    Ok(())
}

/// How long the last completed deployment took.
async fn previous_duration(store: &dyn DeploymentStore, instance_id: DbId) -> Option<Duration> {
    match store.latest_completed_build(instance_id).await {
        Ok(Some((_, job))) => job
            .stopped_at
            .and_then(|stopped| (stopped - job.started_at).to_std().ok()),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(instance_id, error = %e, "Could not look up previous deployment");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use gamehost_core::error::ErrorCode;
    use gamehost_core::security::ApiValidationStatus;
    use gamehost_db::JobStore;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::compiler::tests::{Harness, INSTANCE};

    fn runtime(harness: &Harness) -> Arc<DeploymentRuntime> {
        Arc::new(DeploymentRuntime {
            orchestrator: harness.orchestrator.clone(),
            repository: harness.repository.clone(),
            store: harness.store.clone(),
            settings: CompileSettings::default(),
            probe_timeout: Duration::from_secs(5),
            estimated_duration: None,
        })
    }

    async fn deploy_and_wait(harness: &Harness) -> Job {
        let scheduler = JobScheduler::new(harness.store.clone(), None);
        scheduler.activate(runtime(harness)).unwrap();
        let manager = DeploymentManager::new(INSTANCE, scheduler.clone());

        let job = manager.deploy(Some(1)).await.unwrap();
        assert_eq!(job.description, DEPLOY_JOB_DESCRIPTION);
        let wait = scheduler
            .wait_for_completion(job.id, None, CancellationToken::new(), Some(CancellationToken::new()))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("deployment finishes")
            .unwrap();
        harness.store.find_job(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn deployment_job_stages_a_build() {
        let harness = Harness::new("touch game.dmb", ApiValidationStatus::RequiresSafe);
        let job = deploy_and_wait(&harness).await;

        assert!(job.stopped_at.is_some());
        assert!(!job.cancelled);
        assert!(!job.is_excepted());
        let staged = harness.store.staged_build(INSTANCE).await.unwrap().unwrap();
        assert_eq!(staged.job_id, job.id);

        let (latest, latest_job) = harness
            .store
            .latest_completed_build(INSTANCE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, staged.id);
        assert!(previous_duration(harness.store.as_ref(), INSTANCE).await.is_some());
        assert_eq!(latest_job.id, job.id);
    }

    #[tokio::test]
    async fn failed_compile_is_recorded_on_the_job() {
        let harness = Harness::new("echo broken\nexit 2", ApiValidationStatus::RequiresSafe);
        let job = deploy_and_wait(&harness).await;

        assert_eq!(job.error(), Some(ErrorCode::CompilerExitCode));
        let details = job.exception_details.unwrap();
        assert!(details.contains("exit code 2"));
        assert!(details.contains("broken"));
        assert!(harness.store.staged_build(INSTANCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelling_a_deployment_removes_its_build() {
        let harness = Harness::new("sleep 5\ntouch game.dmb", ApiValidationStatus::RequiresSafe);
        let scheduler = JobScheduler::new(harness.store.clone(), None);
        scheduler.activate(runtime(&harness)).unwrap();
        let manager = DeploymentManager::new(INSTANCE, scheduler.clone());

        let job = manager.deploy(Some(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(harness.orchestrator.is_compiling());

        let cancelled = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler.cancel_job(job.id, Some(4), true, &CancellationToken::new()),
        )
        .await
        .expect("cancellation completes")
        .unwrap()
        .unwrap();

        assert!(cancelled.cancelled);
        assert!(cancelled.stopped_at.is_some());
        assert_eq!(cancelled.cancelled_by, Some(4));
        assert!(!cancelled.is_excepted());
        assert!(!harness.orchestrator.is_compiling());
        assert!(harness.build_dirs().is_empty());
        assert!(harness.store.staged_build(INSTANCE).await.unwrap().is_none());
        let messages = harness.chat.messages.lock().unwrap().clone();
        assert!(messages.last().unwrap().ends_with("was cancelled"));
    }
}
