//! Post-compile API validation probe.
//!
//! The freshly compiled build is launched once under the requested security
//! level and asked which level it actually needs. It answers with a JSON
//! report on stdout:
//!
//! ```json
//! {"status": "requires_safe", "api_version": "5.10.0"}
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use gamehost_core::error::JobError;
use gamehost_core::security::{ApiValidationStatus, SecurityLevel};
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineLease;
use crate::process::{run_command, ProcessError};

/// Extension of the compiler's output binary.
pub const BUILD_EXTENSION: &str = "dmb";

/// Command-line switch asking the build to report and exit.
const VALIDATE_ARG: &str = "-validate-api";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeReport {
    pub status: ApiValidationStatus,
    #[serde(default)]
    pub api_version: Option<String>,
}

impl ProbeReport {
    pub fn never_validated() -> Self {
        Self {
            status: ApiValidationStatus::NeverValidated,
            api_version: None,
        }
    }
}

#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    /// Launch the build in `build_dir` and collect its report.
    ///
    /// A build that does not report within `timeout` yields
    /// [`ApiValidationStatus::NeverValidated`].
    async fn probe(
        &self,
        engine: &EngineLease,
        build_dir: &Path,
        source_file: &str,
        requested: SecurityLevel,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ProbeReport, JobError>;
}

/// Runs the engine's server binary against the compiled build.
#[derive(Debug, Default)]
pub struct ProcessProbe;

#[async_trait]
impl CapabilityProbe for ProcessProbe {
    async fn probe(
        &self,
        engine: &EngineLease,
        build_dir: &Path,
        source_file: &str,
        requested: SecurityLevel,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<ProbeReport, JobError> {
        let binary = Path::new(source_file).with_extension(BUILD_EXTENSION);
        let mut cmd = Command::new(&engine.installation().server_path);
        cmd.arg(&binary)
            .arg(requested.server_arg())
            .arg(VALIDATE_ARG)
            .current_dir(build_dir);

        let output = match run_command(&mut cmd, Some(timeout), token).await {
            Ok(output) => output,
            Err(ProcessError::Timeout { elapsed_ms }) => {
                tracing::warn!(elapsed_ms, "Validation probe timed out");
                return Ok(ProbeReport::never_validated());
            }
            Err(e) => return Err(e.into()),
        };

        let report = output
            .parsed_output
            .and_then(|value| serde_json::from_value::<ProbeReport>(value).ok())
            .unwrap_or_else(ProbeReport::never_validated);
        tracing::debug!(
            status = ?report.status,
            api_version = ?report.api_version,
            exit_code = output.exit_code,
            "Validation probe reported",
        );
        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::engine::EngineInstallation;

    fn fake_server(dir: &Path, body: &str) -> EngineLease {
        let server = dir.join("DreamDaemon");
        std::fs::write(&server, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&server, std::fs::Permissions::from_mode(0o755)).unwrap();
        EngineLease::new(
            Arc::new(EngineInstallation {
                version: "515.1647".into(),
                compiler_path: PathBuf::from("/bin/true"),
                server_path: server,
            }),
            None,
        )
    }

    #[tokio::test]
    async fn report_is_parsed_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_server(
            dir.path(),
            r#"echo "{\"status\":\"requires_trusted\",\"api_version\":\"5.10.0\"}""#,
        );
        let report = ProcessProbe
            .probe(
                &engine,
                dir.path(),
                "game.dme",
                SecurityLevel::Trusted,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.status, ApiValidationStatus::RequiresTrusted);
        assert_eq!(report.api_version.as_deref(), Some("5.10.0"));
    }

    #[tokio::test]
    async fn silence_and_timeouts_are_never_validated() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();

        let quiet = fake_server(dir.path(), "exit 0");
        let report = ProcessProbe
            .probe(&quiet, dir.path(), "game.dme", SecurityLevel::Safe, Duration::from_secs(5), &token)
            .await
            .unwrap();
        assert_eq!(report, ProbeReport::never_validated());

        let slow = fake_server(dir.path(), "sleep 5");
        let report = ProcessProbe
            .probe(&slow, dir.path(), "game.dme", SecurityLevel::Safe, Duration::from_millis(100), &token)
            .await
            .unwrap();
        assert_eq!(report, ProbeReport::never_validated());
    }
}
