//! Compile lifecycle hooks.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use gamehost_core::error::{ErrorCode, JobError};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::process::run_command;

/// Points in a compile at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Source copied, before the compiler runs.
    PreCompile,
    /// Build validated, before it is duplicated and staged.
    PostCompile,
    /// The compiler or the validation probe failed.
    CompileFailure,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::PreCompile => "PreCompile",
            Self::PostCompile => "PostCompile",
            Self::CompileFailure => "CompileFailure",
        }
    }
}

#[async_trait]
pub trait EventHook: Send + Sync {
    /// Run whatever is configured for `kind`. An error aborts the compile.
    async fn handle_event(
        &self,
        kind: EventKind,
        params: &[String],
        token: &CancellationToken,
    ) -> Result<(), JobError>;
}

/// How long an event script may run.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs `<scripts_dir>/<EventName>.sh` with the event parameters as arguments.
///
/// Missing scripts (or no scripts directory) are not an error.
pub struct ScriptHooks {
    scripts_dir: Option<PathBuf>,
}

impl ScriptHooks {
    pub fn new(scripts_dir: Option<PathBuf>) -> Self {
        Self { scripts_dir }
    }
}

#[async_trait]
impl EventHook for ScriptHooks {
    async fn handle_event(
        &self,
        kind: EventKind,
        params: &[String],
        token: &CancellationToken,
    ) -> Result<(), JobError> {
        let Some(dir) = &self.scripts_dir else {
            return Ok(());
        };
        let script = dir.join(format!("{}.sh", kind.name()));
        if !tokio::fs::try_exists(&script).await? {
            tracing::trace!(event = kind.name(), "No event script");
            return Ok(());
        }

        tracing::info!(event = kind.name(), script = %script.display(), "Running event script");
        let mut cmd = Command::new("sh");
        cmd.arg(&script).args(params).current_dir(dir);
        let output = run_command(&mut cmd, Some(SCRIPT_TIMEOUT), token).await?;

        if !output.success() {
            return Err(JobError::domain(
                ErrorCode::HookFailed,
                format!(
                    "{} script exited with code {}:\n{}",
                    kind.name(),
                    output.exit_code,
                    output.combined()
                ),
            ));
        }
        tracing::debug!(event = kind.name(), duration_ms = output.duration_ms, "Event script finished");
        Ok(())
    }
}
