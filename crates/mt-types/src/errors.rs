use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the tuning harness.
///
/// Only configuration and infrastructure problems travel through this type.
/// A candidate that fails to build, crashes, times out or produces wrong
/// results is a measurement, and is reported as a [`crate::Verdict`].
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] InfrastructureError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TuneError {
    /// The pipeline stage a session-fatal error is attributed to.
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::Config(ConfigurationError::InvalidAssignment(_)) => FailureStage::Proposal,
            Self::Config(_) => FailureStage::Declaration,
            Self::Infrastructure(e) => e.stage(),
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => FailureStage::Session,
        }
    }

    /// User-facing "session aborted during <stage>: <cause>" line.
    pub fn abort_message(&self) -> String {
        format!("session aborted during {}: {self}", self.stage())
    }

    /// Whether the failed pipeline entry may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Infrastructure(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Pipeline stage named in user-visible abort messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Declaration,
    Proposal,
    Build,
    Run,
    Session,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Declaration => "declaration",
            Self::Proposal => "proposal",
            Self::Build => "build",
            Self::Run => "run",
            Self::Session => "session",
        };
        f.write_str(s)
    }
}

/// Programmer or strategy errors. Surfaced immediately, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("parameter declared twice: {name}")]
    DuplicateParameter { name: String },

    #[error("invalid domain for parameter {name}: {message}")]
    InvalidDomain { name: String, message: String },

    #[error("invalid assignment: {0}")]
    InvalidAssignment(#[from] InvalidAssignment),

    #[error("parameter space has no parameters")]
    EmptySpace,

    #[error("{0}")]
    Invalid(String),
}

/// A rejected assignment: which parameter was wrong and why.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parameter {parameter}: {reason}")]
pub struct InvalidAssignment {
    pub parameter: String,
    pub reason: AssignmentViolation,
}

impl InvalidAssignment {
    pub fn new(parameter: impl Into<String>, reason: AssignmentViolation) -> Self {
        Self {
            parameter: parameter.into(),
            reason,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentViolation {
    #[error("missing value")]
    Missing,

    #[error("not declared in the parameter space")]
    Unknown,

    #[error("value {value} outside domain {domain}")]
    OutOfDomain { value: String, domain: String },

    #[error("value {value} has the wrong type, expected {expected}")]
    TypeMismatch { value: String, expected: String },
}

/// Conditions under which no evaluation can proceed.
#[derive(Error, Debug)]
pub enum InfrastructureError {
    #[error("scratch storage unavailable: {message}")]
    ScratchUnavailable { message: String },

    #[error("toolchain program not found: {program}")]
    ToolchainMissing { program: String },

    #[error("failed to spawn {program} during {stage}: {message}")]
    Spawn {
        stage: FailureStage,
        program: String,
        message: String,
    },

    #[error("allocator source directory unavailable: {path}")]
    SourceUnavailable { path: String },
}

impl InfrastructureError {
    pub fn stage(&self) -> FailureStage {
        match self {
            Self::Spawn { stage, .. } => *stage,
            Self::ToolchainMissing { .. } | Self::SourceUnavailable { .. } => FailureStage::Build,
            Self::ScratchUnavailable { .. } => FailureStage::Build,
        }
    }

    /// Flaky filesystem and spawn errors are worth another attempt; a missing
    /// toolchain or source tree is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ScratchUnavailable { .. } | Self::Spawn { .. })
    }
}

/// Result type alias for harness operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating session configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config($crate::ConfigurationError::Invalid(format!($($arg)*)))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = InvalidAssignment::new(
            "ALIGNMENT",
            AssignmentViolation::OutOfDomain {
                value: "17".into(),
                domain: "int[1, 16]".into(),
            },
        );

        let text = error.to_string();
        assert!(text.contains("ALIGNMENT"));
        assert!(text.contains("17"));
        assert!(text.contains("int[1, 16]"));
    }

    #[test]
    fn test_abort_message_names_stage() {
        let duplicate: TuneError = ConfigurationError::DuplicateParameter {
            name: "ALIGNMENT".into(),
        }
        .into();
        assert!(duplicate
            .abort_message()
            .starts_with("session aborted during declaration: "));

        let missing: TuneError = InfrastructureError::ToolchainMissing {
            program: "cc".into(),
        }
        .into();
        assert_eq!(
            missing.abort_message(),
            "session aborted during build: Infrastructure error: toolchain program not found: cc"
        );
    }

    #[test]
    fn test_error_conversion() {
        let invalid = InvalidAssignment::new("X", AssignmentViolation::Missing);
        let err: TuneError = ConfigurationError::from(invalid).into();

        match &err {
            TuneError::Config(ConfigurationError::InvalidAssignment(_)) => (),
            _ => panic!("Expected InvalidAssignment error"),
        }
        assert_eq!(err.stage(), FailureStage::Proposal);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_infrastructure_stage_and_retry() {
        let missing: TuneError = InfrastructureError::ToolchainMissing {
            program: "make".into(),
        }
        .into();
        assert_eq!(missing.stage(), FailureStage::Build);
        assert!(!missing.is_transient());

        let spawn: TuneError = InfrastructureError::Spawn {
            stage: FailureStage::Run,
            program: "./mdriver".into(),
            message: "resource temporarily unavailable".into(),
        }
        .into();
        assert_eq!(spawn.stage(), FailureStage::Run);
        assert!(spawn.is_transient());
    }

    #[test]
    fn test_macros() {
        let err = config_error!("concurrency must be positive, got {}", 0);
        assert_eq!(err.stage(), FailureStage::Declaration);
        let _internal_err = internal_error!("Something went wrong");
    }
}
