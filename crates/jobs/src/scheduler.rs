//! The job scheduler.
//!
//! Every job is persisted before it becomes visible at runtime, runs on its
//! own Tokio task, and ends through [`JobScheduler::run_job`], which is the
//! only place that writes `stopped_at`.
//!
//! Two locks guard the runtime registry. `structural` serializes add, cancel
//! and drain transitions and is always taken before `jobs`, which protects
//! only the map itself. Progress updates never touch either.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gamehost_core::error::{CoreError, JobError};
use gamehost_core::types::{DbId, SYSTEM_USER_ID};
use gamehost_db::models::job::{Job, JobCompletion, NewJob};
use gamehost_db::JobStore;
use gamehost_events::{event_types, EventBus, PlatformEvent};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::body::{JobBody, JobContext};
use crate::error::SchedulerError;
use crate::handle::{JobHandle, JobProgress, ProgressReporter};
use crate::response::JobResponse;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs job bodies against a runtime context of type `C`.
///
/// Bodies registered before [`activate`](Self::activate) wait for the
/// context; once [`shutdown`](Self::shutdown) has begun, new registrations
/// are recorded but never started.
pub struct JobScheduler<C> {
    store: Arc<dyn JobStore>,
    events: Option<Arc<EventBus>>,
    structural: Mutex<()>,
    jobs: Mutex<HashMap<DbId, Arc<JobHandle>>>,
    activation: watch::Sender<Option<Arc<C>>>,
    draining: AtomicBool,
}

impl<C> JobScheduler<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn JobStore>, events: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            structural: Mutex::new(()),
            jobs: Mutex::new(HashMap::new()),
            activation: watch::Sender::new(None),
            draining: AtomicBool::new(false),
        })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Cold start: mark every job left running by a previous process as cancelled.
    pub async fn initialize(&self) -> Result<u64, SchedulerError> {
        let orphaned = self.store.cancel_orphaned_jobs().await?;
        if orphaned > 0 {
            tracing::warn!(orphaned, "Cancelled jobs orphaned by a previous run");
        }
        Ok(orphaned)
    }

    /// Release bodies waiting on the runtime context. Allowed exactly once.
    pub fn activate(&self, runtime: Arc<C>) -> Result<(), SchedulerError> {
        let activated = self.activation.send_if_modified(move |current| {
            if current.is_some() {
                return false;
            }
            *current = Some(runtime);
            true
        });
        if !activated {
            return Err(SchedulerError::AlreadyActivated);
        }
        tracing::info!("Job scheduler activated");
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stop starting new jobs, cancel every started one and wait for them.
    ///
    /// `token` bounds the wait only; cancellation has been requested either way.
    pub async fn shutdown(&self, token: &CancellationToken) -> Result<(), SchedulerError> {
        let tracked: Vec<Arc<JobHandle>> = {
            let _structure = lock(&self.structural);
            self.draining.store(true, Ordering::SeqCst);
            lock(&self.jobs).values().cloned().collect()
        };

        let started: Vec<Arc<JobHandle>> =
            tracked.into_iter().filter(|handle| handle.is_started()).collect();
        tracing::info!(jobs = started.len(), "Draining job scheduler");
        for handle in &started {
            handle.cancel.cancel();
        }

        let all_finished =
            futures::future::join_all(started.iter().map(|handle| handle.wait_finished()));
        tokio::select! {
            _ = all_finished => {
                tracing::info!("All jobs stopped");
                Ok(())
            }
            _ = token.cancelled() => {
                tracing::warn!("Gave up waiting for jobs to stop");
                Err(SchedulerError::WaitCancelled)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Persist a new job and start `body` on its own task.
    ///
    /// The returned row is the one persisted before the job became visible
    /// to [`cancel_job`](Self::cancel_job) and friends.
    pub async fn register_job(
        self: &Arc<Self>,
        input: NewJob,
        body: JobBody<C>,
    ) -> Result<Job, SchedulerError> {
        if input.description.trim().is_empty() {
            return Err(CoreError::Validation("Job description must not be empty".into()).into());
        }

        let job = self.store.insert_job(&input).await?;
        let handle = Arc::new(JobHandle::new(job.id));

        let started = {
            let _structure = lock(&self.structural);
            lock(&self.jobs).insert(job.id, Arc::clone(&handle));
            if self.is_draining() {
                false
            } else {
                handle.mark_started();
                let scheduler = Arc::clone(self);
                let job = job.clone();
                tokio::spawn(async move { scheduler.run_job(handle, job, body).await });
                true
            }
        };

        if started {
            tracing::info!(
                job_id = job.id,
                instance_id = job.instance_id,
                started_by = job.started_by,
                description = %job.description,
                "Job registered",
            );
        } else {
            tracing::warn!(
                job_id = job.id,
                description = %job.description,
                "Job registered while draining; it will not start",
            );
        }

        self.publish(
            PlatformEvent::new(event_types::JOB_REGISTERED, job.instance_id)
                .with_job(job.id)
                .with_actor(job.started_by)
                .with_payload(serde_json::json!({ "description": job.description })),
        );

        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Cancellation and waiting
    // -----------------------------------------------------------------------

    /// Request cancellation of a tracked job.
    ///
    /// Returns `Ok(None)` for unknown or already finished jobs. The cancelling
    /// user (the system account when `None`) is recorded durably. With
    /// `blocking`, waits until the job has stopped, bounded by `token`, and
    /// returns the ledger row as it stands afterwards.
    pub async fn cancel_job(
        &self,
        id: DbId,
        user_id: Option<DbId>,
        blocking: bool,
        token: &CancellationToken,
    ) -> Result<Option<Job>, SchedulerError> {
        let handle = {
            let _structure = lock(&self.structural);
            let handle = lock(&self.jobs).get(&id).cloned();
            if let Some(handle) = &handle {
                handle.cancel.cancel();
            }
            handle
        };
        let Some(handle) = handle else {
            tracing::debug!(job_id = id, "Cancel requested for a job that is not running");
            return Ok(None);
        };

        let cancelled_by = user_id.unwrap_or(SYSTEM_USER_ID);
        let job = self.store.record_cancelled_by(id, cancelled_by).await?;
        tracing::info!(job_id = id, cancelled_by, blocking, "Job cancellation requested");

        if !blocking {
            return Ok(job);
        }

        tokio::select! {
            _ = handle.wait_finished() => {}
            _ = token.cancelled() => return Err(SchedulerError::WaitCancelled),
        }
        Ok(self.store.find_job(id).await?)
    }

    /// Build a future that resolves once job `id` has stopped.
    ///
    /// `token` must be supplied: a wait that cannot be cancelled is rejected
    /// here, before any future exists. If `job_cancel` fires first, the job
    /// is cancelled on behalf of `canceller` and the future resolves only
    /// after the cancellation is reflected in the ledger.
    pub fn wait_for_completion(
        self: &Arc<Self>,
        id: DbId,
        canceller: Option<DbId>,
        job_cancel: CancellationToken,
        token: Option<CancellationToken>,
    ) -> Result<impl Future<Output = Result<(), SchedulerError>> + Send + 'static, SchedulerError>
    {
        let token = token.ok_or(SchedulerError::UncancellableWait)?;
        let scheduler = Arc::clone(self);

        Ok(async move {
            let Some(handle) = scheduler.tracked(id) else {
                return Ok(());
            };
            tokio::select! {
                _ = handle.wait_finished() => Ok(()),
                _ = token.cancelled() => Err(SchedulerError::WaitCancelled),
                _ = job_cancel.cancelled() => {
                    scheduler.cancel_job(id, canceller, true, &token).await?;
                    Ok(())
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    /// Merge live progress into `response`. Untracked ids leave it untouched.
    pub fn report_progress(&self, id: DbId, response: &mut JobResponse) {
        if let Some(progress) = self.progress(id) {
            response.merge(progress);
        }
    }

    pub fn progress(&self, id: DbId) -> Option<JobProgress> {
        self.tracked(id).map(|handle| handle.progress())
    }

    /// Whether `id` is in the runtime registry (registered and not yet stopped).
    pub fn is_tracked(&self, id: DbId) -> bool {
        self.tracked(id).is_some()
    }

    fn tracked(&self, id: DbId) -> Option<Arc<JobHandle>> {
        lock(&self.jobs).get(&id).cloned()
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Completion funnel. Always persists exactly one outcome for the job.
    async fn run_job(self: Arc<Self>, handle: Arc<JobHandle>, job: Job, body: JobBody<C>) {
        let job_id = job.id;
        let instance_id = job.instance_id;

        let outcome = self.execute(&handle, job, body).await;
        let (completion, event_type) = completion_for(job_id, outcome);

        match self.store.finish_job(job_id, &completion).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(job_id, "Job was already stopped in the ledger"),
            Err(e) => tracing::error!(job_id, error = %e, "Failed to persist job completion"),
        }

        {
            let _structure = lock(&self.structural);
            lock(&self.jobs).remove(&job_id);
        }
        handle.mark_finished();

        self.publish(PlatformEvent::new(event_type, instance_id).with_job(job_id).with_payload(
            serde_json::json!({
                "cancelled": completion.cancelled,
                "error_code": completion.error_code,
            }),
        ));
    }

    /// Wait for activation, then run the body on its own task so that a
    /// panic becomes an ordinary outcome.
    async fn execute(
        &self,
        handle: &Arc<JobHandle>,
        job: Job,
        body: JobBody<C>,
    ) -> Result<(), JobError> {
        let runtime = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return Err(JobError::Cancelled),
            runtime = self.wait_for_activation() => runtime?,
        };

        let context = JobContext {
            runtime,
            store: Arc::clone(&self.store),
            job,
            progress: ProgressReporter::new(Arc::clone(handle)),
            cancel: handle.cancel.clone(),
        };

        match tokio::spawn(body(context)).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(JobError::internal(format!(
                "job body panicked: {}",
                panic_message(join_error.into_panic())
            ))),
            Err(join_error) => Err(JobError::internal(join_error)),
        }
    }

    async fn wait_for_activation(&self) -> Result<Arc<C>, JobError> {
        let mut rx = self.activation.subscribe();
        let runtime = rx
            .wait_for(Option::is_some)
            .await
            .map_err(JobError::internal)?
            .clone();
        runtime.ok_or_else(|| JobError::internal("activation resolved without a runtime"))
    }

    fn publish(&self, event: PlatformEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

/// Translate a body outcome into the ledger fields and lifecycle event.
fn completion_for(
    job_id: DbId,
    outcome: Result<(), JobError>,
) -> (JobCompletion, &'static str) {
    match outcome {
        Ok(()) => {
            tracing::info!(job_id, "Job completed");
            (JobCompletion::succeeded(), event_types::JOB_COMPLETED)
        }
        Err(JobError::Cancelled) => {
            tracing::info!(job_id, "Job cancelled");
            (JobCompletion::cancelled(), event_types::JOB_CANCELLED)
        }
        Err(JobError::Domain {
            code,
            message,
            cause,
        }) => {
            let details = match cause {
                Some(cause) => format!("{message}\n{cause}"),
                None => message,
            };
            tracing::info!(job_id, error_code = ?code, error = %details, "Job failed");
            (JobCompletion::failed(code, details), event_types::JOB_FAILED)
        }
        Err(JobError::Internal(err)) => {
            let details = format!("{err:?}");
            tracing::debug!(job_id, error = %details, "Job errored");
            (JobCompletion::failed(None, details), event_types::JOB_FAILED)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
