//! Error taxonomy shared by the controller, the bridge, and the boundary layer.

use std::fmt;

use thiserror::Error;

use crate::driver::DriverError;
use crate::transaction::TransactionState;

/// Result type for extension manager operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// One violated parameter reported by the parameter validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterViolation {
    pub id: String,
    pub name: String,
    pub message: String,
}

impl fmt::Display for ParameterViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to validate parameter '{}' ({}): {}",
            self.name, self.id, self.message
        )
    }
}

/// Stable classification of [`ControllerError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ForbiddenStatement,
    StatementExecution,
    TransactionClosed,
    ExtensionNotFound,
    EntryPointMissing,
    ExtensionExecution,
    Validation,
    FileNotFound,
    NotInstalled,
    Cancelled,
    Database,
    InvalidScanRow,
    InvalidArgument,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ForbiddenStatement => "forbidden_statement",
            Self::StatementExecution => "statement_execution",
            Self::TransactionClosed => "transaction_closed",
            Self::ExtensionNotFound => "extension_not_found",
            Self::EntryPointMissing => "entry_point_missing",
            Self::ExtensionExecution => "extension_execution",
            Self::Validation => "validation",
            Self::FileNotFound => "file_not_found",
            Self::NotInstalled => "not_installed",
            Self::Cancelled => "cancelled",
            Self::Database => "database",
            Self::InvalidScanRow => "invalid_scan_row",
            Self::InvalidArgument => "invalid_argument",
        }
    }
}

/// Failure raised by guest code, as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GuestFailure {
    pub message: String,
    /// HTTP-style status the guest attached to its error, if any.
    pub status: Option<u16>,
}

/// Errors returned by the extension manager core.
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    #[error("statement {statement:?} contains forbidden command {command:?}. Transaction handling is done by extension manager")]
    ForbiddenStatement { statement: String, command: String },
    #[error("error executing statement {statement:?}: {source}")]
    StatementExecution {
        statement: String,
        #[source]
        source: DriverError,
    },
    #[error("transaction is already {state}")]
    TransactionClosed { state: TransactionState },
    #[error("{}", describe_extension_not_found(.extension_id, .version.as_deref()))]
    ExtensionNotFound {
        extension_id: String,
        version: Option<String>,
    },
    #[error("extension '{extension_id}' does not provide entry point '{entry_point}'")]
    EntryPointMissing {
        extension_id: String,
        entry_point: String,
    },
    #[error("extension '{extension_id}' failed in '{entry_point}': {source}")]
    ExtensionExecution {
        extension_id: String,
        version: Option<String>,
        entry_point: String,
        #[source]
        source: GuestFailure,
    },
    #[error("invalid parameters: {}", render_violations(.violations))]
    Validation { violations: Vec<ParameterViolation> },
    #[error("file {file_name:?} not found in BucketFS")]
    FileNotFound { file_name: String },
    #[error("{}", describe_not_installed(.extension_id, .version.as_deref()))]
    NotInstalled {
        extension_id: String,
        version: Option<String>,
    },
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("failed to {action} database transaction: {source}")]
    Database {
        action: &'static str,
        #[source]
        source: DriverError,
    },
    #[error("invalid row returned by BucketFS scan routine: {message}")]
    InvalidScanRow { message: String },
    #[error("{message}")]
    InvalidArgument { message: String },
    #[error("{error} (cleanup also failed: {cleanup})")]
    CleanupFailed {
        error: Box<ControllerError>,
        cleanup: Box<ControllerError>,
    },
}

impl ControllerError {
    /// Returns the stable kind; cleanup failures report the kind of the triggering error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ForbiddenStatement { .. } => ErrorKind::ForbiddenStatement,
            Self::StatementExecution { .. } => ErrorKind::StatementExecution,
            Self::TransactionClosed { .. } => ErrorKind::TransactionClosed,
            Self::ExtensionNotFound { .. } => ErrorKind::ExtensionNotFound,
            Self::EntryPointMissing { .. } => ErrorKind::EntryPointMissing,
            Self::ExtensionExecution { .. } => ErrorKind::ExtensionExecution,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::NotInstalled { .. } => ErrorKind::NotInstalled,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Database { .. } => ErrorKind::Database,
            Self::InvalidScanRow { .. } => ErrorKind::InvalidScanRow,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::CleanupFailed { error, .. } => error.kind(),
        }
    }

    /// Unwraps cleanup failures down to the error that triggered them.
    pub fn primary(&self) -> &ControllerError {
        match self {
            Self::CleanupFailed { error, .. } => error.primary(),
            other => other,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Combines a triggering error with a failure that happened while releasing resources.
    pub fn with_cleanup_failure(self, cleanup: ControllerError) -> Self {
        Self::CleanupFailed {
            error: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }

    /// True for failures that end the operation regardless of what guest code does with them.
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Self::ForbiddenStatement { .. }
                | Self::TransactionClosed { .. }
                | Self::Cancelled { .. }
        )
    }
}

fn describe_extension_not_found(extension_id: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("extension '{extension_id}' in version '{version}' not found"),
        None => format!("extension '{extension_id}' not found"),
    }
}

fn describe_not_installed(extension_id: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => {
            format!("extension '{extension_id}' is not installed in version '{version}'")
        }
        None => format!("extension '{extension_id}' is not installed"),
    }
}

fn render_violations(violations: &[ParameterViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
