//! Runtime state of a tracked job and the progress reporter handed to bodies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gamehost_core::progress::fraction_to_percent;
use gamehost_core::types::DbId;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Last progress reported by a job body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub stage: Option<String>,
    /// Whole percent in `0..=100`.
    pub percent: Option<i16>,
    /// Set when `percent` comes from a timer rather than measured work.
    pub estimated: bool,
}

/// One entry of the scheduler's runtime registry.
pub(crate) struct JobHandle {
    pub(crate) job_id: DbId,
    pub(crate) cancel: CancellationToken,
    progress: Mutex<JobProgress>,
    started: AtomicBool,
    finished: watch::Sender<bool>,
}

impl JobHandle {
    pub(crate) fn new(job_id: DbId) -> Self {
        Self {
            job_id,
            cancel: CancellationToken::new(),
            progress: Mutex::new(JobProgress::default()),
            started: AtomicBool::new(false),
            finished: watch::Sender::new(false),
        }
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Fire the completion latch. Waiters already parked and any later
    /// waiters both observe it.
    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub(crate) async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|finished| *finished).await;
    }

    pub(crate) fn progress(&self) -> JobProgress {
        self.lock_progress().clone()
    }

    fn lock_progress(&self) -> MutexGuard<'_, JobProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// ProgressReporter
// ---------------------------------------------------------------------------

/// Cheap, cloneable writer for a job's progress.
///
/// Only touches the handle's own mutex, never the scheduler's registry locks.
#[derive(Clone)]
pub struct ProgressReporter {
    handle: Arc<JobHandle>,
}

impl ProgressReporter {
    pub(crate) fn new(handle: Arc<JobHandle>) -> Self {
        Self { handle }
    }

    /// A reporter not attached to any scheduler, for driving job bodies directly.
    pub fn detached(job_id: DbId) -> Self {
        Self::new(Arc::new(JobHandle::new(job_id)))
    }

    pub fn job_id(&self) -> DbId {
        self.handle.job_id
    }

    /// Record a stage name and/or a measured completion fraction.
    ///
    /// `None` leaves the respective field as it was. A fraction outside
    /// `[0, 1]` (or NaN) is logged and ignored, keeping the prior value.
    pub fn report(&self, stage: Option<&str>, fraction: Option<f64>) {
        self.apply(stage, fraction, false);
    }

    /// Record a timer-driven estimate of the completion fraction.
    pub fn report_estimate(&self, fraction: f64) {
        self.apply(None, Some(fraction), true);
    }

    pub fn set_stage(&self, stage: &str) {
        self.apply(Some(stage), None, false);
    }

    pub fn snapshot(&self) -> JobProgress {
        self.handle.progress()
    }

    fn apply(&self, stage: Option<&str>, fraction: Option<f64>, estimated: bool) {
        let percent = match fraction {
            Some(fraction) => match fraction_to_percent(fraction) {
                Some(percent) => Some(percent),
                None => {
                    tracing::warn!(
                        job_id = self.handle.job_id,
                        fraction,
                        "Rejected progress outside [0, 1]",
                    );
                    None
                }
            },
            None => None,
        };

        let mut progress = self.handle.lock_progress();
        if let Some(stage) = stage {
            progress.stage = Some(stage.to_string());
        }
        if let Some(percent) = percent {
            progress.percent = Some(percent);
            progress.estimated = estimated;
        }
    }
}
