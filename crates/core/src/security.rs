//! Capability tiers and the post-compile validation decision table.
//!
//! A freshly compiled build is launched once under the requested
//! [`SecurityLevel`] purely so it can report which tier it actually needs.
//! [`evaluate_validation`] turns that report into either the build's
//! minimum level or a failure.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, JobError};

// ---------------------------------------------------------------------------
// SecurityLevel
// ---------------------------------------------------------------------------

/// Trust tier a build is permitted to run under, from most to least trusted.
///
/// Discriminants are persisted in `compile_jobs.minimum_security_level`.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Trusted = 0,
    Safe = 1,
    Ultrasafe = 2,
}

impl SecurityLevel {
    pub fn id(self) -> i16 {
        self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(Self::Trusted),
            1 => Some(Self::Safe),
            2 => Some(Self::Ultrasafe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Safe => "safe",
            Self::Ultrasafe => "ultrasafe",
        }
    }

    /// Command-line switch understood by the game server binary.
    pub fn server_arg(self) -> &'static str {
        match self {
            Self::Trusted => "-trusted",
            Self::Safe => "-safe",
            Self::Ultrasafe => "-ultrasafe",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trusted" => Ok(Self::Trusted),
            "safe" => Ok(Self::Safe),
            "ultrasafe" => Ok(Self::Ultrasafe),
            other => Err(CoreError::Validation(format!(
                "Invalid security level: '{other}'. Must be one of: trusted, safe, ultrasafe"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ApiValidationStatus
// ---------------------------------------------------------------------------

/// What the probe run reported about the build's requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiValidationStatus {
    /// The build never reported back before exiting.
    NeverValidated,
    RequiresUltrasafe,
    RequiresSafe,
    RequiresTrusted,
    /// The build did not understand the validation request.
    BadValidationRequest,
    /// The build reported without having been asked to validate.
    UnaskedValidationRequest,
}

// ---------------------------------------------------------------------------
// Decision table
// ---------------------------------------------------------------------------

/// Why a probe result was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("build requires the {required} security level but validation ran at {requested}")]
    InsufficientSecurity {
        required: SecurityLevel,
        requested: SecurityLevel,
    },

    #[error("validation timed out")]
    TimedOut,

    #[error("unrecognized validation request")]
    BadRequest,

    #[error("unexpected validation state: {0:?}")]
    Unexpected(ApiValidationStatus),
}

impl From<ValidationFailure> for JobError {
    fn from(failure: ValidationFailure) -> Self {
        let code = match &failure {
            ValidationFailure::InsufficientSecurity { .. } => ErrorCode::ValidationSecurityLevel,
            ValidationFailure::TimedOut => ErrorCode::ValidationTimedOut,
            ValidationFailure::BadRequest => ErrorCode::ValidationBadRequest,
            ValidationFailure::Unexpected(_) => return JobError::internal(failure),
        };
        JobError::domain(code, format!("API validation failed: {failure}"))
    }
}

/// Map a probe report onto the minimum security level of the build.
///
/// `requested` is the level the probe run was launched under. A build that
/// needs more trust than it was launched with cannot have validated, so it
/// fails rather than being silently upgraded.
pub fn evaluate_validation(
    status: ApiValidationStatus,
    requested: SecurityLevel,
) -> Result<SecurityLevel, ValidationFailure> {
    match status {
        ApiValidationStatus::RequiresUltrasafe => Ok(SecurityLevel::Ultrasafe),
        ApiValidationStatus::RequiresSafe => {
            if requested == SecurityLevel::Ultrasafe {
                Err(ValidationFailure::InsufficientSecurity {
                    required: SecurityLevel::Safe,
                    requested,
                })
            } else {
                Ok(SecurityLevel::Safe)
            }
        }
        ApiValidationStatus::RequiresTrusted => {
            if requested == SecurityLevel::Trusted {
                Ok(SecurityLevel::Trusted)
            } else {
                Err(ValidationFailure::InsufficientSecurity {
                    required: SecurityLevel::Trusted,
                    requested,
                })
            }
        }
        ApiValidationStatus::NeverValidated => Err(ValidationFailure::TimedOut),
        ApiValidationStatus::BadValidationRequest => Err(ValidationFailure::BadRequest),
        ApiValidationStatus::UnaskedValidationRequest => {
            Err(ValidationFailure::Unexpected(status))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
