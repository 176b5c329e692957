//! Compile orchestrator: one end-to-end build of an instance's code.
//!
//! A compile copies the repository into `<game>/<uuid>/A`, runs the engine
//! compiler there, probes the result for the security level it needs, then
//! duplicates it into `<game>/<uuid>/B` and hands the descriptor to the
//! [`BuildArtifactRegistry`]. Only one compile runs per orchestrator.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gamehost_core::error::{ErrorCode, JobError};
use gamehost_core::progress::estimated_fraction;
use gamehost_core::security::{evaluate_validation, SecurityLevel};
use gamehost_core::source::{augment_source, is_source_file, resolve_source_file};
use gamehost_db::models::compile_job::{CompileJob, NewCompileJob};
use gamehost_db::models::job::Job;
use gamehost_db::DeploymentStore;
use gamehost_jobs::ProgressReporter;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::BuildArtifact;
use crate::augment::{SourceAugmentation, SourceAugmentationProvider};
use crate::engine::{EngineLease, EngineManager};
use crate::hooks::{EventHook, EventKind};
use crate::notify::{ChatNotifier, ProcessSupervisor};
use crate::probe::{CapabilityProbe, ProbeReport};
use crate::process::run_command;
use crate::registry::BuildArtifactRegistry;
use crate::repository::{RevisionInfo, SourceRepository};

/// How often the estimated progress is refreshed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Directory the compiler runs in.
pub const BUILD_DIR_A: &str = "A";
/// Second copy of a validated build.
pub const BUILD_DIR_B: &str = "B";

/// Per-instance compile options.
#[derive(Debug, Clone)]
pub struct CompileSettings {
    /// Project file to build; discovered when `None`.
    pub project_name: Option<String>,
    /// Level the validation probe runs under.
    pub security_level: SecurityLevel,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            project_name: None,
            security_level: SecurityLevel::Safe,
        }
    }
}

/// Everything one compile is about.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    /// The job the compile runs in.
    pub job: &'a Job,
    pub revision: &'a RevisionInfo,
    pub settings: &'a CompileSettings,
    pub probe_timeout: Duration,
    /// Expected compile duration, used for the estimated progress.
    pub estimated_duration: Option<Duration>,
}

/// The external seams a compile talks to.
#[derive(Clone)]
pub struct CompileCollaborators {
    pub hooks: Arc<dyn EventHook>,
    pub augmentations: Arc<dyn SourceAugmentationProvider>,
    pub chat: Arc<dyn ChatNotifier>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub engine: Arc<dyn EngineManager>,
    pub probe: Arc<dyn CapabilityProbe>,
}

pub struct CompileOrchestrator {
    registry: Arc<BuildArtifactRegistry>,
    store: Arc<dyn DeploymentStore>,
    collaborators: CompileCollaborators,
    static_files_dir: Option<PathBuf>,
    compiling: AtomicBool,
}

/// Clears the single-flight flag on drop.
struct CompileGuard<'a>(&'a AtomicBool);

impl<'a> CompileGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CompileGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CompileOrchestrator {
    pub fn new(
        registry: Arc<BuildArtifactRegistry>,
        store: Arc<dyn DeploymentStore>,
        collaborators: CompileCollaborators,
        static_files_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            collaborators,
            static_files_dir,
            compiling: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<BuildArtifactRegistry> {
        &self.registry
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling.load(Ordering::SeqCst)
    }

    /// Compile `repository` and load the result as the next build.
    ///
    /// Any failure after the build directory was allocated removes the
    /// directory and posts a chat message before the error is returned.
    pub async fn compile(
        &self,
        request: CompileRequest<'_>,
        repository: &dyn SourceRepository,
        progress: &ProgressReporter,
        token: &CancellationToken,
    ) -> Result<CompileJob, JobError> {
        let _guard = CompileGuard::acquire(&self.compiling).ok_or_else(|| {
            JobError::domain(ErrorCode::DeploymentInProgress, "compile already in progress")
        })?;

        let directory = Uuid::new_v4();
        let _reservation = self.registry.reserve_directory(directory);
        let _heartbeat = request
            .estimated_duration
            .map(|estimated| spawn_heartbeat(progress.clone(), estimated, token).drop_guard());

        let build_root = self.registry.build_dir(directory);
        let result = self
            .run(&request, directory, &build_root, repository, progress, token)
            .await;

        if let Err(err) = &result {
            crate::fs::remove_dir_best_effort(&build_root).await;
            let text = if err.is_cancelled() {
                format!("Deployment of revision {} was cancelled", request.revision.short_sha())
            } else {
                format!("Deployment of revision {} failed: {err}", request.revision.short_sha())
            };
            // The job token may already be cancelled; the message still goes out.
            self.collaborators
                .chat
                .send_update_message(&text, &CancellationToken::new())
                .await;
            tracing::info!(
                job_id = request.job.id,
                directory = %directory,
                cancelled = err.is_cancelled(),
                "Compile did not complete",
            );
        }
        result
    }

    async fn run(
        &self,
        request: &CompileRequest<'_>,
        directory: Uuid,
        build_root: &Path,
        repository: &dyn SourceRepository,
        progress: &ProgressReporter,
        token: &CancellationToken,
    ) -> Result<CompileJob, JobError> {
        progress.set_stage("Acquiring engine");
        let engine = self.collaborators.engine.acquire(token).await?;

        tracing::info!(
            job_id = request.job.id,
            directory = %directory,
            commit_sha = %request.revision.commit_sha,
            engine_version = %engine.version(),
            "Starting compile",
        );
        self.collaborators
            .chat
            .send_update_message(
                &format!(
                    "Deploying revision {} with engine {}...",
                    request.revision.short_sha(),
                    engine.version()
                ),
                token,
            )
            .await;

        progress.set_stage("Copying repository");
        let dir_a = build_root.join(BUILD_DIR_A);
        let dir_b = build_root.join(BUILD_DIR_B);
        tokio::fs::create_dir_all(&dir_a).await?;
        tokio::fs::create_dir_all(&dir_b).await?;
        repository.copy_to(&dir_a, token).await?;
        ensure_not_cancelled(token)?;

        progress.set_stage("Running pre-compile hook");
        self.collaborators
            .hooks
            .handle_event(EventKind::PreCompile, &[path_param(&dir_a)], token)
            .await?;

        progress.set_stage("Resolving project file");
        let candidates = list_source_files(&dir_a).await?;
        let source_file =
            resolve_source_file(request.settings.project_name.as_deref(), &candidates)?;
        self.apply_augmentations(&dir_a, &source_file, token).await?;

        progress.set_stage("Compiling");
        let output = self.run_compiler(&engine, &dir_a, &source_file, token).await?;

        progress.set_stage("Validating API");
        let (level, report) = match self
            .validate(&engine, &dir_a, &source_file, request, token)
            .await
        {
            Ok(validated) => validated,
            Err(err) => {
                self.run_failure_hook(&dir_a, &err, token).await;
                return Err(err);
            }
        };

        progress.set_stage("Staging build");
        self.collaborators
            .hooks
            .handle_event(EventKind::PostCompile, &[path_param(&dir_a)], token)
            .await?;
        crate::fs::copy_dir(&dir_a, &dir_b, &[]).await?;
        if let Some(static_dir) = &self.static_files_dir {
            for dir in [&dir_a, &dir_b] {
                let linked = crate::fs::link_static_files(static_dir, dir).await?;
                tracing::debug!(dir = %dir.display(), linked, "Linked static files");
            }
        }
        ensure_not_cancelled(token)?;

        let mut message = format!(
            "Deployment of revision {} complete",
            request.revision.short_sha()
        );
        if self.collaborators.supervisor.is_currently_running() {
            message.push_str("; changes apply on next reboot");
        }
        self.collaborators.chat.send_update_message(&message, token).await;

        let compile_job = self
            .store
            .insert_compile_job(&NewCompileJob {
                job_id: request.job.id,
                directory_name: directory,
                source_file,
                output,
                minimum_security_level: Some(level),
                api_version: report.api_version,
                engine_version: engine.version().to_string(),
                revision_id: request.revision.id,
                commit_sha: request.revision.commit_sha.clone(),
            })
            .await
            .map_err(JobError::internal)?;

        self.registry
            .load_artifact(
                BuildArtifact::new(compile_job.clone(), request.job.clone()),
                true,
                token,
            )
            .await?;

        tracing::info!(
            job_id = request.job.id,
            compile_job_id = compile_job.id,
            security_level = %level,
            "Compile complete",
        );
        Ok(compile_job)
    }

    async fn apply_augmentations(
        &self,
        dir: &Path,
        source_file: &str,
        token: &CancellationToken,
    ) -> Result<(), JobError> {
        let Some(augmentation) = self
            .collaborators
            .augmentations
            .copy_source_augmentations(source_file, dir, token)
            .await?
        else {
            return Ok(());
        };

        let path = dir.join(source_file);
        let contents = match augmentation {
            SourceAugmentation::Override(contents) => {
                tracing::info!(source_file, "Project file overridden");
                contents
            }
            SourceAugmentation::Includes { prepend, append } => {
                tracing::info!(
                    source_file,
                    prepended = prepend.len(),
                    appended = append.len(),
                    "Adding includes to project file",
                );
                let original = tokio::fs::read_to_string(&path).await?;
                augment_source(&original, &prepend, &append)
            }
        };
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    /// Run the compiler; on a non-zero exit run the failure hook and fail
    /// with the exit code and the captured output.
    async fn run_compiler(
        &self,
        engine: &EngineLease,
        dir: &Path,
        source_file: &str,
        token: &CancellationToken,
    ) -> Result<String, JobError> {
        let mut cmd = Command::new(&engine.installation().compiler_path);
        cmd.arg("-clean").arg(source_file).current_dir(dir);
        let output = run_command(&mut cmd, None, token).await?;
        let combined = output.combined();

        tracing::debug!(
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "Compiler finished",
        );
        if output.success() {
            return Ok(combined);
        }

        let err = JobError::domain(
            ErrorCode::CompilerExitCode,
            format!(
                "Compilation failed with exit code {}:\n{combined}",
                output.exit_code
            ),
        );
        self.run_failure_hook(dir, &err, token).await;
        Err(err)
    }

    async fn validate(
        &self,
        engine: &EngineLease,
        dir: &Path,
        source_file: &str,
        request: &CompileRequest<'_>,
        token: &CancellationToken,
    ) -> Result<(SecurityLevel, ProbeReport), JobError> {
        let requested = request.settings.security_level;
        let report = self
            .collaborators
            .probe
            .probe(engine, dir, source_file, requested, request.probe_timeout, token)
            .await?;
        let level = evaluate_validation(report.status, requested)?;
        tracing::info!(
            requested = %requested,
            required = %level,
            api_version = ?report.api_version,
            "API validation passed",
        );
        Ok((level, report))
    }

    /// The failure hook never changes the outcome of the compile.
    async fn run_failure_hook(&self, dir: &Path, err: &JobError, token: &CancellationToken) {
        if err.is_cancelled() {
            return;
        }
        let params = [path_param(dir), err.to_string()];
        if let Err(hook_err) = self
            .collaborators
            .hooks
            .handle_event(EventKind::CompileFailure, &params, token)
            .await
        {
            tracing::warn!(error = %hook_err, "Compile failure hook failed");
        }
    }
}

/// Report a timer-driven estimate until the returned token is cancelled
/// (or `parent` is).
fn spawn_heartbeat(
    progress: ProgressReporter,
    estimated: Duration,
    parent: &CancellationToken,
) -> CancellationToken {
    let stop = parent.child_token();
    let stopped = stop.clone();
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = stopped.cancelled() => break,
                _ = ticker.tick() => {
                    progress.report_estimate(estimated_fraction(started.elapsed(), estimated));
                }
            }
        }
    });
    stop
}

async fn list_source_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if is_source_file(name) && entry.file_type().await?.is_file() {
                found.push(name.to_string());
            }
        }
    }
    found.sort();
    Ok(found)
}

fn ensure_not_cancelled(token: &CancellationToken) -> Result<(), JobError> {
    if token.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

fn path_param(path: &Path) -> String {
    path.display().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
