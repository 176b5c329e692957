//! Job scheduler: runs every long-lived operation of an instance under
//! cancellation, progress reporting and a durable ledger.
//!
//! A job is a row in the `jobs` table plus, while its body executes, a
//! runtime [`handle`] holding its cancellation token and progress. Bodies
//! do not run until [`JobScheduler::activate`] supplies the runtime context,
//! and every outcome is funnelled into a single ledger update.

pub mod body;
pub mod error;
pub mod handle;
pub mod response;
pub mod scheduler;

pub use body::{job_body, JobBody, JobContext};
pub use error::SchedulerError;
pub use handle::{JobProgress, ProgressReporter};
pub use response::JobResponse;
pub use scheduler::JobScheduler;
