//! Error taxonomy for image builds.
//!
//! Every library operation returns [`Result`]. The [`ErrorKind`] of an error
//! decides two things: whether it may be retried internally (only
//! [`ErrorKind::TransientResourceBusy`]) and which process exit code the
//! binary reports.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Exit code for a successful build.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for any failure not covered by a more specific code.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a malformed or missing artifact, plan or config.
pub const EXIT_VALIDATION: i32 = 2;
/// Exit code for a missing host tool or required dependency.
pub const EXIT_MISSING_PREREQUISITE: i32 = 3;
/// Exit code for insufficient disk space.
pub const EXIT_INSUFFICIENT_RESOURCES: i32 = 4;

/// Classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientResourceBusy,
    Timeout,
    ValidationFailure,
    IntegrityMismatch,
    PermissionDenied,
    ResourceExhaustion,
    MissingPrerequisite,
    InvalidState,
    External,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientResourceBusy => "transient_resource_busy",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::MissingPrerequisite => "missing_prerequisite",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::External => "external",
            ErrorKind::Io => "io",
        }
    }

    /// Process exit code reported for an error of this kind.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::ValidationFailure => EXIT_VALIDATION,
            ErrorKind::MissingPrerequisite => EXIT_MISSING_PREREQUISITE,
            ErrorKind::ResourceExhaustion => EXIT_INSUFFICIENT_RESOURCES,
            _ => EXIT_FAILURE,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("resource busy: {0}")]
    Busy(String),

    #[error("mount of '{}' failed after {attempts} attempt(s): {source}", path.display())]
    Mount {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Box<BuildError>,
    },

    #[error("{operation} timed out after {:.1}s", timeout.as_secs_f64())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity mismatch for '{name}': expected sha256 {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(
        "insufficient space under '{}': need {needed} bytes, {available} available",
        path.display()
    )]
    ResourceExhaustion {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("config store alias '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("config store alias '{0}' is not loaded")]
    NotLoaded(String),

    #[error(
        "session {session} still has config store handles attached: {}",
        aliases.join(", ")
    )]
    HandlesOutstanding {
        session: String,
        aliases: Vec<String>,
    },

    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    /// An error that must fail the current stage even though its kind would
    /// normally be retried or discarded.
    #[error("fatal: {0}")]
    Fatal(#[source] Box<BuildError>),

    #[error("'{program}' exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    External {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<BuildError>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Busy(_) => ErrorKind::TransientResourceBusy,
            BuildError::Mount { source, .. } => source.kind(),
            BuildError::Timeout { .. } => ErrorKind::Timeout,
            BuildError::Validation(_) => ErrorKind::ValidationFailure,
            BuildError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            BuildError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            BuildError::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            BuildError::MissingPrerequisite(_) => ErrorKind::MissingPrerequisite,
            BuildError::AlreadyLoaded(_)
            | BuildError::NotLoaded(_)
            | BuildError::HandlesOutstanding { .. }
            | BuildError::InvalidState { .. } => ErrorKind::InvalidState,
            BuildError::Fatal(inner) => inner.kind(),
            BuildError::External { .. } => ErrorKind::External,
            BuildError::Step { source, .. } => source.kind(),
            BuildError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::Io,
            },
        }
    }

    /// Only a bare busy report is retried. Anything wrapped (fatal, mount
    /// exhaustion, step failure) has already been through its retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BuildError::Busy(_))
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            BuildError::Fatal(_) => true,
            BuildError::Step { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn fatal(self) -> Self {
        match self {
            BuildError::Fatal(_) => self,
            other => BuildError::Fatal(Box::new(other)),
        }
    }

    pub fn step(step: impl Into<String>, source: BuildError) -> Self {
        BuildError::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid_state(expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        BuildError::InvalidState {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(source: std::io::Error) -> Self {
        BuildError::io("i/o error", source)
    }
}

/// `with_context` for `std::io::Result`, producing a [`BuildError::Io`].
pub trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| BuildError::io(f(), source))
    }
}
