use serde::{Deserialize, Serialize};

/// Boxed error used for causes and undeclared failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable failure codes recorded in `jobs.error_code`.
///
/// Discriminants are persisted; never renumber an existing variant.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DeploymentInProgress = 1,
    DeploymentNoSourceFile = 2,
    DeploymentAmbiguousSourceFile = 3,
    CompilerExitCode = 4,
    ValidationTimedOut = 5,
    ValidationSecurityLevel = 6,
    ValidationBadRequest = 7,
    HookFailed = 8,
    EngineUnavailable = 9,
}

impl ErrorCode {
    /// Return the persisted integer code.
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Parse a persisted code. Unknown values yield `None`.
    pub fn from_id(id: i32) -> Option<Self> {
        Some(match id {
            1 => Self::DeploymentInProgress,
            2 => Self::DeploymentNoSourceFile,
            3 => Self::DeploymentAmbiguousSourceFile,
            4 => Self::CompilerExitCode,
            5 => Self::ValidationTimedOut,
            6 => Self::ValidationSecurityLevel,
            7 => Self::ValidationBadRequest,
            8 => Self::HookFailed,
            9 => Self::EngineUnavailable,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// Outcome of a job body that did not succeed.
///
/// The scheduler converts each variant into a ledger mutation:
/// `Cancelled` sets the cancelled flag, `Domain` records its code and
/// message verbatim, `Internal` records the full diagnostic text.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Cooperative cancellation. Not an error from the user's perspective.
    #[error("job was cancelled")]
    Cancelled,

    /// An expected, user-facing failure.
    #[error("{message}")]
    Domain {
        code: Option<ErrorCode>,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    /// Anything else. Treated as an internal fault.
    #[error(transparent)]
    Internal(BoxError),
}

impl JobError {
    /// Build a domain failure carrying a machine-readable code.
    pub fn domain(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Domain {
            code: Some(code),
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap any error as an undeclared internal failure.
    pub fn internal(err: impl Into<BoxError>) -> Self {
        Self::Internal(err.into())
    }

    /// Attach an inner cause to a domain failure. Other variants are returned unchanged.
    pub fn with_cause(self, err: impl Into<BoxError>) -> Self {
        match self {
            Self::Domain { code, message, .. } => Self::Domain {
                code,
                message,
                cause: Some(err.into()),
            },
            other => other,
        }
    }

    /// The machine-readable code, if this is a coded domain failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Domain { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(Box::new(err))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
