//! Build artifact registry.
//!
//! Tracks which compiled builds are in use, hands the newest one to whoever
//! runs the server, and deletes build directories nobody needs anymore.
//!
//! - Every [`ArtifactHandle`] is a lease. When the last lease on a build is
//!   dropped the build moves to `Retiring` and a request is queued to the
//!   single deletion worker, so deletions never run concurrently. A build
//!   leased again before the worker reaches it is left alone.
//! - The registry itself holds a lease on the staged ("next") build, so the
//!   staged build is never deleted.
//! - `load_artifact` resolves the current notifier generation and replaces
//!   it with a fresh one under the structural lock. Every waiter of a
//!   generation observes the same build; later waiters only see later ones.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gamehost_core::types::DbId;
use gamehost_db::models::compile_job::CompileJob;
use gamehost_db::DeploymentStore;
use gamehost_events::{event_types, EventBus, PlatformEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::BuildArtifact;
use crate::error::RegistryError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Lease table
// ---------------------------------------------------------------------------

/// Lifecycle of a build in the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Held by this many handles.
    Active(usize),
    /// No handles left; a deletion request is queued.
    Retiring,
    /// The worker is deleting the directory. The entry is pruned afterwards.
    Deleting,
}

struct Lease {
    directory: Uuid,
    state: LeaseState,
}

#[derive(Default)]
struct LeaseBook {
    leases: HashMap<DbId, Lease>,
    /// Directories of compiles still in flight.
    reserved: HashSet<Uuid>,
}

impl LeaseBook {
    fn protects(&self, directory: Uuid) -> bool {
        self.reserved.contains(&directory)
            || self.leases.values().any(|lease| lease.directory == directory)
    }
}

enum DeletionRequest {
    /// Delete a build whose last lease was released.
    Retire(Arc<BuildArtifact>),
    /// Delete an untracked directory found by a purge.
    Purge(Uuid),
    /// Acknowledge once everything queued before it was handled.
    Flush(oneshot::Sender<()>),
}

struct LeaseTable {
    book: Arc<Mutex<LeaseBook>>,
    deletions: mpsc::UnboundedSender<DeletionRequest>,
}

impl LeaseTable {
    fn check_out(self: &Arc<Self>, artifact: Arc<BuildArtifact>) -> Result<ArtifactHandle, RegistryError> {
        let id = artifact.id();
        {
            let mut book = lock(&self.book);
            let lease = book.leases.entry(id).or_insert(Lease {
                directory: artifact.directory(),
                state: LeaseState::Active(0),
            });
            match lease.state {
                LeaseState::Active(count) => lease.state = LeaseState::Active(count + 1),
                LeaseState::Retiring => {
                    tracing::debug!(compile_job_id = id, "Retiring build leased again");
                    lease.state = LeaseState::Active(1);
                }
                LeaseState::Deleting => return Err(RegistryError::ArtifactRetired { id }),
            }
        }
        Ok(ArtifactHandle {
            artifact,
            leases: Arc::clone(self),
        })
    }

    fn release(&self, artifact: &Arc<BuildArtifact>) {
        let id = artifact.id();
        let retire = {
            let mut book = lock(&self.book);
            match book.leases.get_mut(&id) {
                Some(lease) => match lease.state {
                    LeaseState::Active(count) if count > 1 => {
                        lease.state = LeaseState::Active(count - 1);
                        false
                    }
                    LeaseState::Active(_) => {
                        lease.state = LeaseState::Retiring;
                        true
                    }
                    state => {
                        tracing::warn!(compile_job_id = id, ?state, "Released a build without a lease");
                        false
                    }
                },
                None => {
                    tracing::warn!(compile_job_id = id, "Released an untracked build");
                    false
                }
            }
        };

        if retire {
            tracing::debug!(compile_job_id = id, "Last lease released, queueing deletion");
            if self.deletions.send(DeletionRequest::Retire(Arc::clone(artifact))).is_err() {
                tracing::warn!(
                    compile_job_id = id,
                    directory = %artifact.directory(),
                    "Deletion worker stopped; build directory left on disk",
                );
            }
        }
    }

    fn state(&self, id: DbId) -> Option<LeaseState> {
        lock(&self.book).leases.get(&id).map(|lease| lease.state)
    }

    fn protects(&self, directory: Uuid) -> bool {
        lock(&self.book).protects(directory)
    }

    fn request(&self, request: DeletionRequest) -> Result<(), RegistryError> {
        self.deletions
            .send(request)
            .map_err(|_| RegistryError::WorkerStopped)
    }
}

// ---------------------------------------------------------------------------
// ArtifactHandle
// ---------------------------------------------------------------------------

/// A lease on a build. Dropping it releases the lease.
pub struct ArtifactHandle {
    artifact: Arc<BuildArtifact>,
    leases: Arc<LeaseTable>,
}

impl ArtifactHandle {
    pub fn artifact(&self) -> &BuildArtifact {
        &self.artifact
    }

    pub fn compile_job(&self) -> &CompileJob {
        &self.artifact.compile_job
    }

    /// Take another, independent lease on the same build.
    pub fn duplicate(&self) -> Result<ArtifactHandle, RegistryError> {
        self.leases.check_out(Arc::clone(&self.artifact))
    }

    pub fn release(self) {}
}

impl Drop for ArtifactHandle {
    fn drop(&mut self) {
        self.leases.release(&self.artifact);
    }
}

impl fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("compile_job_id", &self.artifact.id())
            .field("directory", &self.artifact.directory())
            .finish()
    }
}

/// Keeps an in-flight compile's directory safe from [`BuildArtifactRegistry::purge_unused`].
pub struct DirectoryReservation {
    book: Arc<Mutex<LeaseBook>>,
    directory: Uuid,
}

impl DirectoryReservation {
    pub fn directory(&self) -> Uuid {
        self.directory
    }
}

impl Drop for DirectoryReservation {
    fn drop(&mut self) {
        lock(&self.book).reserved.remove(&self.directory);
    }
}

// ---------------------------------------------------------------------------
// Deletion worker
// ---------------------------------------------------------------------------

struct DeletionWorker {
    book: Arc<Mutex<LeaseBook>>,
    game_dir: PathBuf,
    requests: mpsc::UnboundedReceiver<DeletionRequest>,
    abort: CancellationToken,
}

impl DeletionWorker {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.abort.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            match request {
                DeletionRequest::Retire(artifact) => self.retire(&artifact).await,
                DeletionRequest::Purge(directory) => self.purge(directory).await,
                DeletionRequest::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Build deletion worker stopped");
    }

    async fn retire(&self, artifact: &BuildArtifact) {
        let id = artifact.id();
        {
            let mut book = lock(&self.book);
            match book.leases.get_mut(&id) {
                Some(lease) if lease.state == LeaseState::Retiring => {
                    lease.state = LeaseState::Deleting;
                }
                _ => {
                    tracing::debug!(compile_job_id = id, "Build leased again, skipping deletion");
                    return;
                }
            }
        }

        tracing::info!(
            compile_job_id = id,
            directory = %artifact.directory(),
            "Deleting retired build",
        );
        self.delete(artifact.directory()).await;
        lock(&self.book).leases.remove(&id);
    }

    async fn purge(&self, directory: Uuid) {
        if lock(&self.book).protects(directory) {
            tracing::debug!(%directory, "Directory became protected, skipping purge");
            return;
        }
        tracing::info!(%directory, "Deleting unused build directory");
        self.delete(directory).await;
    }

    async fn delete(&self, directory: Uuid) {
        let path = self.game_dir.join(directory.to_string());
        tokio::select! {
            _ = self.abort.cancelled() => {
                tracing::warn!(path = %path.display(), "Build deletion aborted");
            }
            _ = crate::fs::remove_dir_best_effort(&path) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Latest {
    next: Option<ArtifactHandle>,
    notifier: watch::Sender<Option<ArtifactHandle>>,
}

/// Per-instance registry of builds on disk under `game_dir`.
///
/// Must be created inside a Tokio runtime: it spawns its deletion worker.
pub struct BuildArtifactRegistry {
    instance_id: DbId,
    game_dir: PathBuf,
    store: Arc<dyn DeploymentStore>,
    events: Option<Arc<EventBus>>,
    leases: Arc<LeaseTable>,
    latest: tokio::sync::Mutex<Latest>,
    abort: CancellationToken,
}

impl BuildArtifactRegistry {
    pub fn new(
        instance_id: DbId,
        game_dir: impl Into<PathBuf>,
        store: Arc<dyn DeploymentStore>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        let game_dir = game_dir.into();
        let book = Arc::new(Mutex::new(LeaseBook::default()));
        let (deletions, requests) = mpsc::unbounded_channel();
        let abort = CancellationToken::new();

        tokio::spawn(
            DeletionWorker {
                book: Arc::clone(&book),
                game_dir: game_dir.clone(),
                requests,
                abort: abort.clone(),
            }
            .run(),
        );

        Self {
            instance_id,
            game_dir,
            store,
            events,
            leases: Arc::new(LeaseTable { book, deletions }),
            latest: tokio::sync::Mutex::new(Latest {
                next: None,
                notifier: watch::Sender::new(None),
            }),
            abort,
        }
    }

    /// Directory holding one sub-directory per build.
    pub fn game_dir(&self) -> &Path {
        &self.game_dir
    }

    pub fn build_dir(&self, directory: Uuid) -> PathBuf {
        self.game_dir.join(directory.to_string())
    }

    /// Current lease state of a build, if it is tracked.
    pub fn lease_state(&self, compile_job_id: DbId) -> Option<LeaseState> {
        self.leases.state(compile_job_id)
    }

    /// Take a lease on `artifact`.
    pub fn check_out(&self, artifact: Arc<BuildArtifact>) -> Result<ArtifactHandle, RegistryError> {
        self.leases.check_out(artifact)
    }

    /// Protect `directory` from purging until the reservation is dropped.
    pub fn reserve_directory(&self, directory: Uuid) -> DirectoryReservation {
        lock(&self.leases.book).reserved.insert(directory);
        DirectoryReservation {
            book: Arc::clone(&self.leases.book),
            directory,
        }
    }

    /// Make `artifact` the next build handed out by [`lock_latest`](Self::lock_latest).
    ///
    /// Rejects builds that have not finished validating or whose job was
    /// cancelled or failed, and builds whose job started before the one
    /// currently staged.
    pub async fn load_artifact(
        &self,
        artifact: BuildArtifact,
        persist_as_staged: bool,
        token: &CancellationToken,
    ) -> Result<(), RegistryError> {
        let id = artifact.id();
        if let Some(reason) = artifact.incomplete_reason() {
            return Err(RegistryError::Incomplete { id, reason });
        }

        let artifact = Arc::new(artifact);
        let mut latest = tokio::select! {
            _ = token.cancelled() => return Err(RegistryError::Cancelled),
            latest = self.latest.lock() => latest,
        };

        if let Some(current) = &latest.next {
            let staged = current.artifact();
            if artifact.job.started_at < staged.job.started_at {
                return Err(RegistryError::OlderThanStaged {
                    id,
                    staged: staged.id(),
                });
            }
        }

        // The ledger only ever records the build that becomes `next`.
        if persist_as_staged {
            tokio::select! {
                _ = token.cancelled() => return Err(RegistryError::Cancelled),
                result = self.store.set_staged_build(self.instance_id, id) => result?,
            }
        }

        let handle = self.leases.check_out(Arc::clone(&artifact))?;
        let for_waiters = handle.duplicate()?;
        let resolved = std::mem::replace(&mut latest.notifier, watch::Sender::new(None));
        resolved.send_replace(Some(for_waiters));
        let previous = latest.next.replace(handle);
        drop(latest);
        drop(resolved);
        drop(previous);

        tracing::info!(
            instance_id = self.instance_id,
            compile_job_id = id,
            directory = %artifact.directory(),
            engine_version = %artifact.compile_job.engine_version,
            persisted = persist_as_staged,
            "Build loaded as next",
        );
        if let Some(events) = &self.events {
            events.publish(
                PlatformEvent::new(event_types::BUILD_LOADED, self.instance_id)
                    .with_job(artifact.job.id)
                    .with_payload(serde_json::json!({
                        "compile_job_id": id,
                        "directory": artifact.directory(),
                    })),
            );
        }
        Ok(())
    }

    /// Lease the next build, waiting for the first load if there is none yet.
    pub async fn lock_latest(
        &self,
        token: &CancellationToken,
    ) -> Result<ArtifactHandle, RegistryError> {
        let mut generation = {
            let latest = tokio::select! {
                _ = token.cancelled() => return Err(RegistryError::Cancelled),
                latest = self.latest.lock() => latest,
            };
            if let Some(next) = &latest.next {
                return next.duplicate();
            }
            latest.notifier.subscribe()
        };

        tokio::select! {
            _ = token.cancelled() => Err(RegistryError::Cancelled),
            resolved = generation.wait_for(Option::is_some) => match resolved {
                Ok(value) => match &*value {
                    Some(handle) => handle.duplicate(),
                    None => Err(RegistryError::Closed),
                },
                Err(_) => Err(RegistryError::Closed),
            },
        }
    }

    /// Load the most recently completed build from the ledger without
    /// re-persisting it. Returns the loaded descriptor id.
    pub async fn recover_on_startup(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<DbId>, RegistryError> {
        let latest = tokio::select! {
            _ = token.cancelled() => return Err(RegistryError::Cancelled),
            latest = self.store.latest_completed_build(self.instance_id) => latest?,
        };
        let Some((compile_job, job)) = latest else {
            tracing::info!(instance_id = self.instance_id, "No completed build to recover");
            return Ok(None);
        };

        let id = compile_job.id;
        self.load_artifact(BuildArtifact::new(compile_job, job), false, token)
            .await?;
        tracing::info!(instance_id = self.instance_id, compile_job_id = id, "Recovered last completed build");
        Ok(Some(id))
    }

    /// Delete every build directory that is not leased, reserved, staged in
    /// the ledger or `except`. Failures are logged, never returned.
    pub async fn purge_unused(&self, except: Option<&CompileJob>, token: &CancellationToken) {
        let except = except.map(|build| build.directory_name);
        match self.queue_purge(except, token).await {
            Ok(0) => tracing::debug!(instance_id = self.instance_id, "No unused build directories"),
            Ok(queued) => tracing::info!(
                instance_id = self.instance_id,
                queued,
                "Purged unused build directories",
            ),
            Err(e) => tracing::warn!(
                instance_id = self.instance_id,
                error = %e,
                "Purging unused build directories failed",
            ),
        }
    }

    async fn queue_purge(
        &self,
        except: Option<Uuid>,
        token: &CancellationToken,
    ) -> Result<usize, RegistryError> {
        let staged = self
            .store
            .staged_build(self.instance_id)
            .await?
            .map(|build| build.directory_name);

        let mut entries = match tokio::fs::read_dir(&self.game_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut queued = 0;
        while let Some(entry) = entries.next_entry().await? {
            if token.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            let Some(directory) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            if !entry.file_type().await?.is_dir()
                || Some(directory) == except
                || Some(directory) == staged
                || self.leases.protects(directory)
            {
                continue;
            }
            self.leases.request(DeletionRequest::Purge(directory))?;
            queued += 1;
        }

        self.flush(token).await?;
        Ok(queued)
    }

    /// Wait for queued deletions to finish. If `token` fires first, abort
    /// the deletion in progress and stop the worker.
    pub async fn drain(&self, token: &CancellationToken) -> Result<(), RegistryError> {
        match self.flush(token).await {
            Ok(()) => {
                tracing::info!(instance_id = self.instance_id, "Build deletions drained");
                Ok(())
            }
            Err(RegistryError::Cancelled) => {
                self.abort.cancel();
                tracing::warn!(instance_id = self.instance_id, "Aborted pending build deletions");
                Err(RegistryError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    async fn flush(&self, token: &CancellationToken) -> Result<(), RegistryError> {
        let (done, flushed) = oneshot::channel();
        self.leases.request(DeletionRequest::Flush(done))?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RegistryError::Cancelled),
            result = flushed => result.map_err(|_| RegistryError::WorkerStopped),
        }
    }
}

impl Drop for BuildArtifactRegistry {
    fn drop(&mut self) {
        // Stop the worker before `next` is released so the staged build survives.
        self.abort.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use gamehost_core::security::SecurityLevel;
    use gamehost_db::models::compile_job::NewCompileJob;
    use gamehost_db::models::job::{Job, JobCompletion, NewJob};
    use gamehost_db::{JobStore, MemoryStore};
    use tempfile::TempDir;

    use super::*;

    const INSTANCE: DbId = 1;

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        registry: Arc<BuildArtifactRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let registry = Arc::new(BuildArtifactRegistry::new(
                INSTANCE,
                dir.path(),
                store.clone(),
                None,
            ));
            Self {
                dir,
                store,
                registry,
            }
        }

        /// A finished, validated build with its directory on disk.
        async fn build(&self) -> BuildArtifact {
            let job = self
                .store
                .insert_job(&NewJob::new(INSTANCE, "Compile"))
                .await
                .unwrap();
            let job = self
                .store
                .finish_job(job.id, &JobCompletion::succeeded())
                .await
                .unwrap()
                .unwrap();
            self.build_for(job).await
        }

        async fn build_for(&self, job: Job) -> BuildArtifact {
            let compile_job = self
                .store
                .insert_compile_job(&NewCompileJob {
                    job_id: job.id,
                    directory_name: Uuid::new_v4(),
                    source_file: "game.dme".into(),
                    output: "0 errors, 0 warnings".into(),
                    minimum_security_level: Some(SecurityLevel::Safe),
                    api_version: Some("5.10.0".into()),
                    engine_version: "515.1647".into(),
                    revision_id: 1,
                    commit_sha: "abc123".into(),
                })
                .await
                .unwrap();
            std::fs::create_dir_all(self.path(compile_job.directory_name).join("A")).unwrap();
            BuildArtifact::new(compile_job, job)
        }

        fn path(&self, directory: Uuid) -> PathBuf {
            self.dir.path().join(directory.to_string())
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn directory_deleted_only_after_last_release() {
        let fx = Fixture::new();
        let build = Arc::new(fx.build().await);
        let first = fx.registry.check_out(build.clone()).unwrap();
        let second = first.duplicate().unwrap();
        assert_eq!(fx.registry.lease_state(build.id()), Some(LeaseState::Active(2)));

        first.release();
        fx.registry.flush(&token()).await.unwrap();
        assert!(fx.path(build.directory()).exists());
        assert_eq!(fx.registry.lease_state(build.id()), Some(LeaseState::Active(1)));

        drop(second);
        fx.registry.flush(&token()).await.unwrap();
        assert!(!fx.path(build.directory()).exists());
        assert_eq!(fx.registry.lease_state(build.id()), None);
    }

    #[tokio::test]
    async fn releasing_then_leasing_again_skips_deletion() {
        let fx = Fixture::new();
        let build = Arc::new(fx.build().await);
        let handle = fx.registry.check_out(build.clone()).unwrap();

        // The worker cannot run between these two calls on this runtime.
        drop(handle);
        assert_eq!(fx.registry.lease_state(build.id()), Some(LeaseState::Retiring));
        let again = fx.registry.check_out(build.clone()).unwrap();

        fx.registry.flush(&token()).await.unwrap();
        assert!(fx.path(build.directory()).exists());
        assert_eq!(fx.registry.lease_state(build.id()), Some(LeaseState::Active(1)));
        drop(again);
    }

    #[tokio::test]
    async fn waiters_observe_first_load_and_later_calls_observe_newest() {
        let fx = Fixture::new();
        let a = fx.build().await;
        let b = fx.build().await;
        let (a_id, b_id) = (a.id(), b.id());

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let registry = fx.registry.clone();
                tokio::spawn(async move { registry.lock_latest(&CancellationToken::new()).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.registry.load_artifact(a, false, &token()).await.unwrap();
        fx.registry.load_artifact(b, false, &token()).await.unwrap();

        for waiter in waiters {
            let handle = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(handle.artifact().id(), a_id);
        }

        let latest = fx.registry.lock_latest(&token()).await.unwrap();
        assert_eq!(latest.artifact().id(), b_id);
    }

    #[tokio::test]
    async fn replaced_build_is_deleted_once_unleased() {
        let fx = Fixture::new();
        let a = fx.build().await;
        let b = fx.build().await;
        let (a_dir, b_dir) = (a.directory(), b.directory());

        fx.registry.load_artifact(a, true, &token()).await.unwrap();
        fx.registry.load_artifact(b, true, &token()).await.unwrap();
        fx.registry.drain(&token()).await.unwrap();

        assert!(!fx.path(a_dir).exists());
        assert!(fx.path(b_dir).exists());
        let staged = fx.store.staged_build(INSTANCE).await.unwrap().unwrap();
        assert_eq!(staged.directory_name, b_dir);
    }

    #[tokio::test]
    async fn older_build_is_rejected() {
        let fx = Fixture::new();
        let newer = fx.build().await;
        let mut older = fx.build().await;
        older.job.started_at = newer.job.started_at - chrono::Duration::seconds(30);
        let (newer_id, older_id) = (newer.id(), older.id());

        fx.registry.load_artifact(newer, false, &token()).await.unwrap();
        let result = fx.registry.load_artifact(older, false, &token()).await;
        assert_matches!(
            result,
            Err(RegistryError::OlderThanStaged { id, staged }) if id == older_id && staged == newer_id
        );
        let latest = fx.registry.lock_latest(&token()).await.unwrap();
        assert_eq!(latest.artifact().id(), newer_id);
    }

    #[tokio::test]
    async fn incomplete_builds_are_rejected() {
        let fx = Fixture::new();

        let mut unvalidated = fx.build().await;
        unvalidated.compile_job.minimum_security_level = None;
        assert_matches!(
            fx.registry.load_artifact(unvalidated, true, &token()).await,
            Err(RegistryError::Incomplete { .. })
        );

        let mut cancelled = fx.build().await;
        cancelled.job.cancelled = true;
        assert_matches!(
            fx.registry.load_artifact(cancelled, true, &token()).await,
            Err(RegistryError::Incomplete { .. })
        );

        let mut failed = fx.build().await;
        failed.job.error_code = Some(4);
        assert_matches!(
            fx.registry.load_artifact(failed, true, &token()).await,
            Err(RegistryError::Incomplete { .. })
        );

        assert!(fx.store.staged_build(INSTANCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn build_of_a_running_job_can_be_loaded() {
        let fx = Fixture::new();
        let job = fx
            .store
            .insert_job(&NewJob::new(INSTANCE, "Compile"))
            .await
            .unwrap();
        let build = fx.build_for(job).await;
        fx.registry.load_artifact(build, true, &token()).await.unwrap();
    }

    #[tokio::test]
    async fn recovery_loads_without_persisting() {
        let fx = Fixture::new();
        let build = fx.build().await;
        let id = build.id();

        assert_eq!(fx.registry.recover_on_startup(&token()).await.unwrap(), Some(id));
        let latest = fx.registry.lock_latest(&token()).await.unwrap();
        assert_eq!(latest.artifact().id(), id);
        assert!(fx.store.staged_build(INSTANCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_without_builds_is_a_no_op() {
        let fx = Fixture::new();
        assert_eq!(fx.registry.recover_on_startup(&token()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_keeps_protected_directories() {
        let fx = Fixture::new();
        let loaded = fx.build().await;
        let loaded_dir = loaded.directory();
        fx.registry.load_artifact(loaded, false, &token()).await.unwrap();

        let staged = fx.build().await;
        fx.store.set_staged_build(INSTANCE, staged.id()).await.unwrap();
        let excepted = fx.build().await;
        let unused = fx.build().await;

        let reserved_dir = Uuid::new_v4();
        std::fs::create_dir_all(fx.path(reserved_dir)).unwrap();
        let reservation = fx.registry.reserve_directory(reserved_dir);
        std::fs::create_dir_all(fx.dir.path().join("Static")).unwrap();

        fx.registry
            .purge_unused(Some(&excepted.compile_job), &token())
            .await;

        assert!(fx.path(loaded_dir).exists());
        assert!(fx.path(staged.directory()).exists());
        assert!(fx.path(excepted.directory()).exists());
        assert!(fx.path(reserved_dir).exists());
        assert!(fx.dir.path().join("Static").exists());
        assert!(!fx.path(unused.directory()).exists());

        drop(reservation);
        fx.registry.purge_unused(None, &token()).await;
        assert!(!fx.path(reserved_dir).exists());
    }

    #[tokio::test]
    async fn purge_of_missing_game_dir_is_silent() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            BuildArtifactRegistry::new(INSTANCE, "/nonexistent/gamehost/game", store, None);
        registry.purge_unused(None, &token()).await;
    }

    #[tokio::test]
    async fn lock_latest_honours_cancellation() {
        let fx = Fixture::new();
        let cancel = token();
        cancel.cancel();
        assert_matches!(
            fx.registry.lock_latest(&cancel).await,
            Err(RegistryError::Cancelled)
        );
    }

    #[tokio::test]
    async fn cancelled_drain_aborts_queued_deletions() {
        let fx = Fixture::new();
        let queued = Arc::new(fx.build().await);
        drop(fx.registry.check_out(queued.clone()).unwrap());
        assert_eq!(fx.registry.lease_state(queued.id()), Some(LeaseState::Retiring));

        let cancel = token();
        cancel.cancel();
        assert_matches!(fx.registry.drain(&cancel).await, Err(RegistryError::Cancelled));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.path(queued.directory()).exists());

        let later = Arc::new(fx.build().await);
        drop(fx.registry.check_out(later.clone()).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.path(later.directory()).exists());
        assert_matches!(
            fx.registry.drain(&token()).await,
            Err(RegistryError::WorkerStopped)
        );
    }

    #[tokio::test]
    async fn rejected_older_build_leaves_staged_build_untouched() {
        let fx = Fixture::new();
        let newer = fx.build().await;
        let mut older = fx.build().await;
        older.job.started_at = newer.job.started_at - chrono::Duration::seconds(30);
        let (newer_id, older_dir) = (newer.id(), older.directory());

        fx.registry.load_artifact(newer, true, &token()).await.unwrap();
        assert_matches!(
            fx.registry.load_artifact(older, true, &token()).await,
            Err(RegistryError::OlderThanStaged { .. })
        );

        let staged = fx.store.staged_build(INSTANCE).await.unwrap().unwrap();
        assert_eq!(staged.id, newer_id);
        let latest = fx.registry.lock_latest(&token()).await.unwrap();
        assert_eq!(latest.artifact().id(), newer_id);

        // The rejected build is not protected by the ledger and can be purged.
        fx.registry.purge_unused(None, &token()).await;
        assert!(!fx.path(older_dir).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deletions_of_distinct_builds_run_one_after_another() {
        let fx = Fixture::new();
        let first = Arc::new(fx.build().await);
        let second = Arc::new(fx.build().await);
        for build in [&first, &second] {
            let dir = fx.path(build.directory()).join("A");
            for i in 0..500 {
                std::fs::write(dir.join(format!("{i}.dm")), "/proc/x()").unwrap();
            }
        }
        let (first_id, second_id) = (first.id(), second.id());

        let book = Arc::clone(&fx.registry.leases.book);
        let snapshot = move || {
            let book = lock(&book);
            (
                book.leases.get(&first_id).map(|lease| lease.state),
                book.leases.get(&second_id).map(|lease| lease.state),
            )
        };

        drop(fx.registry.check_out(first.clone()).unwrap());
        drop(fx.registry.check_out(second.clone()).unwrap());

        let mut observed = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let states = snapshot();
            if observed.last() != Some(&states) {
                observed.push(states);
            }
            if states == (None, None) || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(observed.last(), Some(&(None, None)));
        for (a, b) in &observed {
            assert!(
                !(a.is_some() && b == &Some(LeaseState::Deleting)),
                "second deletion started before the first finished: {observed:?}"
            );
            assert!(
                !(a == &Some(LeaseState::Deleting) && b == &Some(LeaseState::Deleting)),
                "deletions overlapped: {observed:?}"
            );
        }
        assert!(!fx.path(first.directory()).exists());
        assert!(!fx.path(second.directory()).exists());
    }
}
