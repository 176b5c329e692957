//! What a job body receives and how bodies are boxed.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use gamehost_core::error::JobError;
use gamehost_db::models::job::Job;
use gamehost_db::JobStore;
use tokio_util::sync::CancellationToken;

use crate::handle::ProgressReporter;

/// Everything a running body needs.
pub struct JobContext<C> {
    /// Runtime context supplied through [`crate::JobScheduler::activate`].
    pub runtime: Arc<C>,
    pub store: Arc<dyn JobStore>,
    /// The ledger row as it was persisted at registration.
    pub job: Job,
    pub progress: ProgressReporter,
    /// Fires when the job is cancelled or the scheduler drains.
    pub cancel: CancellationToken,
}

/// A boxed, run-once job body.
pub type JobBody<C> =
    Box<dyn FnOnce(JobContext<C>) -> BoxFuture<'static, Result<(), JobError>> + Send>;

/// Box an async closure as a [`JobBody`].
///
/// ```ignore
/// let body = job_body(|ctx: JobContext<Runtime>| async move {
///     ctx.progress.set_stage("Working");
///     Ok(())
/// });
/// ```
pub fn job_body<C, F, Fut>(f: F) -> JobBody<C>
where
    F: FnOnce(JobContext<C>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Box::new(move |context| f(context).boxed())
}
