//! In-process store with the same semantics as the PostgreSQL repositories.
//!
//! Used by tests and for running a daemon without a database. Nothing is
//! durable across restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use gamehost_core::types::{DbId, SYSTEM_USER_ID};

use crate::models::compile_job::{CompileJob, NewCompileJob};
use crate::models::job::{Job, JobCompletion, NewJob};
use crate::store::{DeploymentStore, JobStore, StoreResult};

#[derive(Default)]
struct MemoryState {
    next_id: DbId,
    jobs: BTreeMap<DbId, Job>,
    compile_jobs: BTreeMap<DbId, CompileJob>,
    staged: HashMap<DbId, DbId>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-update; the maps are still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, input: &NewJob) -> StoreResult<Job> {
        let mut state = self.lock();
        let id = state.allocate_id();
        let job = Job {
            id,
            instance_id: input.instance_id,
            description: input.description.clone(),
            started_by: input.started_by.unwrap_or(SYSTEM_USER_ID),
            cancelled_by: None,
            started_at: Utc::now(),
            stopped_at: None,
            cancelled: false,
            error_code: None,
            exception_details: None,
        };
        state.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn record_cancelled_by(&self, id: DbId, user_id: DbId) -> StoreResult<Option<Job>> {
        let mut state = self.lock();
        Ok(state.jobs.get_mut(&id).map(|job| {
            job.cancelled_by.get_or_insert(user_id);
            job.clone()
        }))
    }

    async fn finish_job(&self, id: DbId, completion: &JobCompletion) -> StoreResult<Option<Job>> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(&id).filter(|job| job.stopped_at.is_none()) else {
            return Ok(None);
        };
        job.stopped_at = Some(Utc::now());
        job.cancelled = completion.cancelled;
        job.error_code = completion.error_code;
        job.exception_details = completion.exception_details.clone();
        Ok(Some(job.clone()))
    }

    async fn cancel_orphaned_jobs(&self) -> StoreResult<u64> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut count = 0;
        for job in state.jobs.values_mut().filter(|job| job.stopped_at.is_none()) {
            job.cancelled = true;
            job.stopped_at = Some(now);
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert_compile_job(&self, input: &NewCompileJob) -> StoreResult<CompileJob> {
        let mut state = self.lock();
        let id = state.allocate_id();
        let compile_job = CompileJob {
            id,
            job_id: input.job_id,
            directory_name: input.directory_name,
            source_file: input.source_file.clone(),
            output: input.output.clone(),
            minimum_security_level: input.minimum_security_level.map(|level| level.id()),
            api_version: input.api_version.clone(),
            engine_version: input.engine_version.clone(),
            revision_id: input.revision_id,
            commit_sha: input.commit_sha.clone(),
            created_at: Utc::now(),
        };
        state.compile_jobs.insert(id, compile_job.clone());
        Ok(compile_job)
    }

    async fn latest_completed_build(
        &self,
        instance_id: DbId,
    ) -> StoreResult<Option<(CompileJob, Job)>> {
        let state = self.lock();
        Ok(state.compile_jobs.values().rev().find_map(|compile_job| {
            let job = state.jobs.get(&compile_job.job_id)?;
            let clean = job.instance_id == instance_id
                && job.stopped_at.is_some()
                && !job.cancelled
                && !job.is_excepted();
            clean.then(|| (compile_job.clone(), job.clone()))
        }))
    }

    async fn staged_build(&self, instance_id: DbId) -> StoreResult<Option<CompileJob>> {
        let state = self.lock();
        Ok(state
            .staged
            .get(&instance_id)
            .and_then(|id| state.compile_jobs.get(id))
            .cloned())
    }

    async fn set_staged_build(&self, instance_id: DbId, compile_job_id: DbId) -> StoreResult<()> {
        self.lock().staged.insert(instance_id, compile_job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gamehost_core::security::SecurityLevel;
    use uuid::Uuid;

    use super::*;

    fn new_compile_job(job_id: DbId) -> NewCompileJob {
        NewCompileJob {
            job_id,
            directory_name: Uuid::new_v4(),
            source_file: "game.dme".into(),
            output: "0 errors, 0 warnings".into(),
            minimum_security_level: Some(SecurityLevel::Safe),
            api_version: Some("5.10.0".into()),
            engine_version: "515.1647".into(),
            revision_id: 1,
            commit_sha: "abc123".into(),
        }
    }

    #[tokio::test]
    async fn finish_writes_stopped_at_once() {
        let store = MemoryStore::new();
        let job = store.insert_job(&NewJob::new(1, "Test")).await.unwrap();
        assert!(job.is_running());
        assert_eq!(job.started_by, SYSTEM_USER_ID);

        let first = store.finish_job(job.id, &JobCompletion::succeeded()).await.unwrap();
        assert!(first.expect("first finish applies").stopped_at.is_some());

        let second = store.finish_job(job.id, &JobCompletion::cancelled()).await.unwrap();
        assert!(second.is_none());
        let stored = store.find_job(job.id).await.unwrap().unwrap();
        assert!(!stored.cancelled);
    }

    #[tokio::test]
    async fn first_canceller_is_kept() {
        let store = MemoryStore::new();
        let job = store.insert_job(&NewJob::new(1, "Test")).await.unwrap();
        store.record_cancelled_by(job.id, 7).await.unwrap();
        let job = store.record_cancelled_by(job.id, 9).await.unwrap().unwrap();
        assert_eq!(job.cancelled_by, Some(7));
        assert!(store.record_cancelled_by(999, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphans_are_cancelled() {
        let store = MemoryStore::new();
        let running = store.insert_job(&NewJob::new(1, "Running")).await.unwrap();
        let done = store.insert_job(&NewJob::new(1, "Done")).await.unwrap();
        store.finish_job(done.id, &JobCompletion::succeeded()).await.unwrap();

        assert_eq!(store.cancel_orphaned_jobs().await.unwrap(), 1);
        let running = store.find_job(running.id).await.unwrap().unwrap();
        assert!(running.cancelled);
        assert!(running.stopped_at.is_some());
        let done = store.find_job(done.id).await.unwrap().unwrap();
        assert!(!done.cancelled);
    }

    #[tokio::test]
    async fn latest_completed_build_skips_failed_jobs() {
        let store = MemoryStore::new();
        let good = store.insert_job(&NewJob::new(1, "Deploy")).await.unwrap();
        store.finish_job(good.id, &JobCompletion::succeeded()).await.unwrap();
        let good_build = store.insert_compile_job(&new_compile_job(good.id)).await.unwrap();

        let bad = store.insert_job(&NewJob::new(1, "Deploy")).await.unwrap();
        store
            .finish_job(bad.id, &JobCompletion::failed(None, "boom"))
            .await
            .unwrap();
        store.insert_compile_job(&new_compile_job(bad.id)).await.unwrap();

        let (latest, job) = store.latest_completed_build(1).await.unwrap().unwrap();
        assert_eq!(latest.id, good_build.id);
        assert_eq!(job.id, good.id);
        assert!(store.latest_completed_build(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn staged_build_round_trip() {
        let store = MemoryStore::new();
        let job = store.insert_job(&NewJob::new(3, "Deploy")).await.unwrap();
        let build = store.insert_compile_job(&new_compile_job(job.id)).await.unwrap();
        assert!(store.staged_build(3).await.unwrap().is_none());
        store.set_staged_build(3, build.id).await.unwrap();
        assert_eq!(store.staged_build(3).await.unwrap().unwrap().id, build.id);
    }
}
