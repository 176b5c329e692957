//! Engine toolchain installations.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gamehost_core::error::{ErrorCode, JobError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// One installed engine version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInstallation {
    pub version: String,
    /// The compiler binary.
    pub compiler_path: PathBuf,
    /// The server binary, used for the validation probe.
    pub server_path: PathBuf,
}

/// Exclusive use of an engine installation. Released on drop.
pub struct EngineLease {
    installation: Arc<EngineInstallation>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl EngineLease {
    pub fn new(installation: Arc<EngineInstallation>, guard: Option<OwnedMutexGuard<()>>) -> Self {
        Self {
            installation,
            _guard: guard,
        }
    }

    pub fn installation(&self) -> &EngineInstallation {
        &self.installation
    }

    pub fn version(&self) -> &str {
        &self.installation.version
    }
}

#[async_trait]
pub trait EngineManager: Send + Sync {
    async fn acquire(&self, token: &CancellationToken) -> Result<EngineLease, JobError>;
}

/// A single local installation shared by lease.
pub struct LocalEngine {
    installation: Arc<EngineInstallation>,
    lock: Arc<Mutex<()>>,
}

impl LocalEngine {
    pub fn new(installation: EngineInstallation) -> Self {
        Self {
            installation: Arc::new(installation),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl EngineManager for LocalEngine {
    async fn acquire(&self, token: &CancellationToken) -> Result<EngineLease, JobError> {
        if !tokio::fs::try_exists(&self.installation.compiler_path).await? {
            return Err(JobError::domain(
                ErrorCode::EngineUnavailable,
                format!(
                    "Engine {} compiler not found at {}",
                    self.installation.version,
                    self.installation.compiler_path.display()
                ),
            ));
        }

        let guard = tokio::select! {
            _ = token.cancelled() => return Err(JobError::Cancelled),
            guard = Arc::clone(&self.lock).lock_owned() => guard,
        };
        tracing::debug!(engine_version = %self.installation.version, "Engine lease acquired");
        Ok(EngineLease::new(Arc::clone(&self.installation), Some(guard)))
    }
}
