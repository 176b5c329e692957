//! Daemon configuration loaded from environment variables.
//!
//! | Variable                         | Required | Default                                 |
//! |----------------------------------|----------|-----------------------------------------|
//! | `DATABASE_URL`                   | no       | in-memory ledger when unset             |
//! | `INSTANCE_NAME`                  | no       | `main`                                  |
//! | `INSTANCE_ROOT`                  | no       | `./instance`                            |
//! | `REPOSITORY_PATH`                | no       | `<INSTANCE_ROOT>/Repository`            |
//! | `COMPILER_PATH`                  | yes      | --                                      |
//! | `SERVER_PATH`                    | yes      | --                                      |
//! | `ENGINE_VERSION`                 | yes      | --                                      |
//! | `PROJECT_NAME`                   | no       | discovered from the repository          |
//! | `API_VALIDATION_SECURITY_LEVEL`  | no       | `safe`                                  |
//! | `PROBE_TIMEOUT_SECS`             | no       | `60`                                    |
//! | `ESTIMATED_DEPLOY_SECS`          | no       | duration of the last deployment         |
//! | `SHUTDOWN_TIMEOUT_SECS`          | no       | `30`                                    |
//! | `DEPLOY_ON_STARTUP`              | no       | `false`                                 |
//! | `SCRIPTS_DIR`                    | no       | `<INSTANCE_ROOT>/EventScripts`          |
//! | `STATIC_FILES_DIR`               | no       | `<INSTANCE_ROOT>/Configuration/GameStaticFiles` |
//! | `CODE_MODIFICATIONS_DIR`         | no       | `<INSTANCE_ROOT>/Configuration/CodeModifications` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gamehost_core::security::SecurityLevel;
use gamehost_deploy::engine::EngineInstallation;

const DEFAULT_INSTANCE_NAME: &str = "main";
const DEFAULT_INSTANCE_ROOT: &str = "./instance";
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Postgres connection string. `None` runs against an in-memory ledger.
    pub database_url: Option<String>,
    /// Name of the instance row this daemon serves.
    pub instance_name: String,
    pub instance_root: PathBuf,
    pub repository_path: PathBuf,
    pub engine: EngineInstallation,
    pub project_name: Option<String>,
    pub security_level: SecurityLevel,
    pub probe_timeout: Duration,
    pub estimated_deploy: Option<Duration>,
    /// Upper bound on draining jobs and build deletions at shutdown.
    pub shutdown_timeout: Duration,
    pub deploy_on_startup: bool,
    pub scripts_dir: PathBuf,
    pub static_files_dir: PathBuf,
    pub code_modifications_dir: PathBuf,
}

impl DaemonConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which returns the raw value of a
    /// variable or `None` when it is unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let require = |var: &'static str| get(var).ok_or(ConfigError::Missing(var));

        let instance_root =
            PathBuf::from(get("INSTANCE_ROOT").unwrap_or_else(|| DEFAULT_INSTANCE_ROOT.into()));
        let under_root = |var: &str, default: &str| {
            get(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| instance_root.join(default))
        };

        let engine = EngineInstallation {
            version: require("ENGINE_VERSION")?,
            compiler_path: PathBuf::from(require("COMPILER_PATH")?),
            server_path: PathBuf::from(require("SERVER_PATH")?),
        };

        let security_level = match get("API_VALIDATION_SECURITY_LEVEL") {
            Some(value) => parse("API_VALIDATION_SECURITY_LEVEL", &value)?,
            None => SecurityLevel::Safe,
        };

        let probe_timeout = Duration::from_secs(match get("PROBE_TIMEOUT_SECS") {
            Some(value) => parse_positive("PROBE_TIMEOUT_SECS", &value)?,
            None => DEFAULT_PROBE_TIMEOUT_SECS,
        });
        let shutdown_timeout = Duration::from_secs(match get("SHUTDOWN_TIMEOUT_SECS") {
            Some(value) => parse_positive("SHUTDOWN_TIMEOUT_SECS", &value)?,
            None => DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        });
        let estimated_deploy = get("ESTIMATED_DEPLOY_SECS")
            .map(|value| parse_positive("ESTIMATED_DEPLOY_SECS", &value))
            .transpose()?
            .map(Duration::from_secs);

        let deploy_on_startup = match get("DEPLOY_ON_STARTUP") {
            Some(value) => parse_flag("DEPLOY_ON_STARTUP", &value)?,
            None => false,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            instance_name: get("INSTANCE_NAME").unwrap_or_else(|| DEFAULT_INSTANCE_NAME.into()),
            repository_path: under_root("REPOSITORY_PATH", "Repository"),
            scripts_dir: under_root("SCRIPTS_DIR", "EventScripts"),
            static_files_dir: under_root("STATIC_FILES_DIR", "Configuration/GameStaticFiles"),
            code_modifications_dir: under_root(
                "CODE_MODIFICATIONS_DIR",
                "Configuration/CodeModifications",
            ),
            engine,
            project_name: get("PROJECT_NAME"),
            security_level,
            probe_timeout,
            estimated_deploy,
            shutdown_timeout,
            deploy_on_startup,
            instance_root,
        })
    }

    /// Directory holding the instance's build directories.
    pub fn game_dir(&self) -> PathBuf {
        self.instance_root.join("Game")
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(var, value)? {
        0 => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        }),
        secs => Ok(secs),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected true or false".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|var| vars.get(var).cloned())
    }

    const ENGINE: [(&str, &str); 3] = [
        ("ENGINE_VERSION", "515.1642"),
        ("COMPILER_PATH", "/opt/engine/bin/DreamMaker"),
        ("SERVER_PATH", "/opt/engine/bin/DreamDaemon"),
    ];

    #[test]
    fn defaults_hang_off_the_instance_root() {
        let mut vars = ENGINE.to_vec();
        vars.push(("INSTANCE_ROOT", "/srv/game"));
        let config = load(&vars).unwrap();

        assert_eq!(config.instance_name, "main");
        assert_eq!(config.database_url, None);
        assert_eq!(config.game_dir(), PathBuf::from("/srv/game/Game"));
        assert_eq!(config.repository_path, PathBuf::from("/srv/game/Repository"));
        assert_eq!(config.scripts_dir, PathBuf::from("/srv/game/EventScripts"));
        assert_eq!(
            config.code_modifications_dir,
            PathBuf::from("/srv/game/Configuration/CodeModifications")
        );
        assert_eq!(config.security_level, SecurityLevel::Safe);
        assert_eq!(config.probe_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.estimated_deploy, None);
        assert!(!config.deploy_on_startup);
        assert_eq!(config.engine.version, "515.1642");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let mut vars = ENGINE.to_vec();
        vars.extend([
            ("DATABASE_URL", "postgres://localhost/gamehost"),
            ("INSTANCE_NAME", "staging"),
            ("REPOSITORY_PATH", "/work/repo"),
            ("PROJECT_NAME", "tgstation"),
            ("API_VALIDATION_SECURITY_LEVEL", "Trusted"),
            ("PROBE_TIMEOUT_SECS", "5"),
            ("ESTIMATED_DEPLOY_SECS", "300"),
            ("DEPLOY_ON_STARTUP", "yes"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/gamehost"));
        assert_eq!(config.instance_name, "staging");
        assert_eq!(config.repository_path, PathBuf::from("/work/repo"));
        assert_eq!(config.project_name.as_deref(), Some("tgstation"));
        assert_eq!(config.security_level, SecurityLevel::Trusted);
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.estimated_deploy, Some(Duration::from_secs(300)));
        assert!(config.deploy_on_startup);
    }

    #[test]
    fn engine_paths_are_required() {
        assert_matches!(load(&ENGINE[..2]), Err(ConfigError::Missing("SERVER_PATH")));
        assert_matches!(load(&[]), Err(ConfigError::Missing("ENGINE_VERSION")));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let mut vars = ENGINE.to_vec();
        vars.push(("DATABASE_URL", "  "));
        assert_eq!(load(&vars).unwrap().database_url, None);
    }

    #[test]
    fn rejects_malformed_values() {
        let mut vars = ENGINE.to_vec();
        vars.push(("API_VALIDATION_SECURITY_LEVEL", "paranoid"));
        assert_matches!(
            load(&vars),
            Err(ConfigError::Invalid { var: "API_VALIDATION_SECURITY_LEVEL", .. })
        );

        let mut vars = ENGINE.to_vec();
        vars.push(("PROBE_TIMEOUT_SECS", "0"));
        assert_matches!(load(&vars), Err(ConfigError::Invalid { var: "PROBE_TIMEOUT_SECS", .. }));

        let mut vars = ENGINE.to_vec();
        vars.push(("DEPLOY_ON_STARTUP", "maybe"));
        assert_matches!(load(&vars), Err(ConfigError::Invalid { var: "DEPLOY_ON_STARTUP", .. }));
    }
}
