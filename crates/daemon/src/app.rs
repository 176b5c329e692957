//! Assembly of one instance's deployment services.
//!
//! Startup order matters: orphaned jobs are closed before anything can
//! register a new one, the last completed build is recovered before unused
//! directories are purged, and deployment bodies only run once the
//! scheduler has been activated with the fully built runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gamehost_core::types::DbId;
use gamehost_db::repositories::InstanceRepo;
use gamehost_db::{DeploymentStore, JobStore, MemoryStore, PgStore};
use gamehost_deploy::augment::CodeModificationsDir;
use gamehost_deploy::engine::LocalEngine;
use gamehost_deploy::hooks::ScriptHooks;
use gamehost_deploy::notify::{LogNotifier, StaticSupervisor};
use gamehost_deploy::probe::ProcessProbe;
use gamehost_deploy::repository::LocalRepository;
use gamehost_deploy::{
    BuildArtifactRegistry, CompileCollaborators, CompileOrchestrator, CompileSettings,
    DeploymentManager, DeploymentRuntime,
};
use gamehost_events::{EventBus, EventLogger};
use gamehost_jobs::JobScheduler;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::error::DaemonError;

/// Instance id used when running without a database.
const MEMORY_INSTANCE_ID: DbId = 1;

/// How long to wait for the event logger to flush after the bus closes.
const LOGGER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Daemon {
    instance_id: DbId,
    shutdown_timeout: Duration,
    events: Arc<EventBus>,
    logger: JoinHandle<()>,
    scheduler: Arc<JobScheduler<DeploymentRuntime>>,
    registry: Arc<BuildArtifactRegistry>,
    deployments: DeploymentManager,
}

impl Daemon {
    /// Connect to the configured ledger and start every service.
    pub async fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        match &config.database_url {
            Some(url) => {
                let pool = gamehost_db::create_pool(url).await?;
                gamehost_db::health_check(&pool).await?;
                tracing::info!("Database connection established");

                gamehost_db::run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");

                let instance = InstanceRepo::find_or_create(&pool, &config.instance_name).await?;
                tracing::info!(instance_id = instance.id, name = %instance.name, "Instance resolved");

                let store = Arc::new(PgStore::new(pool));
                Self::start_with(config, store.clone(), store, instance.id).await
            }
            None => {
                tracing::warn!("DATABASE_URL not set, job ledger will not survive a restart");
                let store = Arc::new(MemoryStore::new());
                Self::start_with(config, store.clone(), store, MEMORY_INSTANCE_ID).await
            }
        }
    }

    /// Start every service against the given stores.
    pub async fn start_with(
        config: DaemonConfig,
        jobs: Arc<dyn JobStore>,
        builds: Arc<dyn DeploymentStore>,
        instance_id: DbId,
    ) -> Result<Self, DaemonError> {
        let events = Arc::new(EventBus::default());
        let logger = tokio::spawn(EventLogger::run(events.subscribe()));

        let scheduler = JobScheduler::new(jobs, Some(Arc::clone(&events)));
        let orphaned = scheduler.initialize().await?;
        tracing::info!(orphaned, "Job scheduler initialized");

        let startup = CancellationToken::new();
        let registry = Arc::new(BuildArtifactRegistry::new(
            instance_id,
            config.game_dir(),
            Arc::clone(&builds),
            Some(Arc::clone(&events)),
        ));
        let recovered = registry.recover_on_startup(&startup).await?;
        registry.purge_unused(None, &startup).await;
        tracing::info!(instance_id, ?recovered, "Build registry ready");

        let repository = LocalRepository::open(&config.repository_path);
        let collaborators = CompileCollaborators {
            hooks: Arc::new(ScriptHooks::new(Some(config.scripts_dir.clone()))),
            augmentations: Arc::new(CodeModificationsDir::new(Some(
                config.code_modifications_dir.clone(),
            ))),
            chat: Arc::new(LogNotifier),
            supervisor: Arc::new(StaticSupervisor::new(false)),
            engine: Arc::new(LocalEngine::new(config.engine.clone())),
            probe: Arc::new(ProcessProbe),
        };
        let orchestrator = Arc::new(CompileOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&builds),
            collaborators,
            existing_dir(&config.static_files_dir).await,
        ));

        scheduler.activate(Arc::new(DeploymentRuntime {
            orchestrator,
            repository: Arc::new(repository),
            store: builds,
            settings: CompileSettings {
                project_name: config.project_name.clone(),
                security_level: config.security_level,
            },
            probe_timeout: config.probe_timeout,
            estimated_duration: config.estimated_deploy,
        }))?;
        tracing::info!(
            instance_id,
            engine = %config.engine.version,
            security_level = %config.security_level,
            "Deployment services started",
        );

        let deployments = DeploymentManager::new(instance_id, Arc::clone(&scheduler));
        if config.deploy_on_startup {
            deployments.deploy(None).await?;
        }

        Ok(Self {
            instance_id,
            shutdown_timeout: config.shutdown_timeout,
            events,
            logger,
            scheduler,
            registry,
            deployments,
        })
    }

    pub fn instance_id(&self) -> DbId {
        self.instance_id
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler<DeploymentRuntime>> {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<BuildArtifactRegistry> {
        &self.registry
    }

    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// Cancel running jobs, drain build deletions and stop the event logger.
    ///
    /// Both waits share one deadline of `SHUTDOWN_TIMEOUT_SECS`; hitting it is
    /// logged and does not fail the shutdown.
    pub async fn shutdown(self) {
        let Self {
            instance_id,
            shutdown_timeout,
            events,
            logger,
            scheduler,
            registry,
            deployments,
        } = self;
        tracing::info!(instance_id, "Shutting down deployment services");

        let token = deadline(shutdown_timeout);
        if let Err(e) = scheduler.shutdown(&token).await {
            tracing::warn!(error = %e, "Job scheduler did not stop cleanly");
        }
        if let Err(e) = registry.drain(&token).await {
            tracing::warn!(error = %e, "Build registry did not drain cleanly");
        }
        token.cancel();

        drop(deployments);
        drop(scheduler);
        drop(registry);
        // Close the channel so the logger sees the end of the stream.
        drop(events);
        match tokio::time::timeout(LOGGER_SHUTDOWN_TIMEOUT, logger).await {
            Ok(_) => tracing::debug!("Event logger stopped"),
            Err(_) => tracing::warn!("Event logger did not stop within timeout"),
        }
    }
}

/// A token that cancels itself after `timeout`, or earlier when cancelled.
fn deadline(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let expiry = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => expiry.cancel(),
            _ = expiry.cancelled() => {}
        }
    });
    token
}

async fn existing_dir(path: &Path) -> Option<PathBuf> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Some(path.to_path_buf()),
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot inspect directory");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use gamehost_core::error::ErrorCode;
    use gamehost_deploy::deployment::DEPLOY_JOB_DESCRIPTION;

    use super::*;

    fn config(root: &Path, extra: &[(&str, &str)]) -> DaemonConfig {
        let root = root.display().to_string();
        let mut vars: HashMap<String, String> = [
            ("INSTANCE_ROOT", root.as_str()),
            ("ENGINE_VERSION", "515.1642"),
            ("COMPILER_PATH", "/nonexistent/DreamMaker"),
            ("SERVER_PATH", "/nonexistent/DreamDaemon"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        DaemonConfig::from_lookup(|var| vars.get(var).cloned()).unwrap()
    }

    async fn start(root: &Path, extra: &[(&str, &str)]) -> (Daemon, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let daemon = Daemon::start_with(config(root, extra), store.clone(), store.clone(), 1)
            .await
            .unwrap();
        (daemon, store)
    }

    #[tokio::test]
    async fn starts_and_shuts_down_without_a_database() {
        let root = tempfile::tempdir().unwrap();
        let (daemon, _store) = start(root.path(), &[]).await;

        assert_eq!(daemon.instance_id(), 1);
        assert!(!daemon.scheduler().is_draining());
        assert!(daemon.registry().game_dir().ends_with("Game"));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn deployment_without_engine_fails_with_engine_code() {
        let root = tempfile::tempdir().unwrap();
        let (daemon, store) = start(root.path(), &[]).await;

        let job = daemon.deployments().deploy(Some(7)).await.unwrap();
        assert_eq!(job.description, DEPLOY_JOB_DESCRIPTION);
        assert_eq!(job.started_by, 7);

        let wait = daemon
            .scheduler()
            .wait_for_completion(job.id, None, CancellationToken::new(), Some(CancellationToken::new()))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("deployment stops")
            .unwrap();

        let finished = store.find_job(job.id).await.unwrap().unwrap();
        assert!(finished.stopped_at.is_some());
        assert!(!finished.cancelled);
        assert_eq!(finished.error(), Some(ErrorCode::EngineUnavailable));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn deploy_on_startup_registers_a_job() {
        let root = tempfile::tempdir().unwrap();
        let (daemon, store) = start(root.path(), &[("DEPLOY_ON_STARTUP", "true")]).await;

        let job = store.find_job(1).await.unwrap().expect("startup deployment was recorded");
        assert_eq!(job.description, DEPLOY_JOB_DESCRIPTION);

        daemon.shutdown().await;
    }
}
