use std::fmt;

use thiserror::Error;

use crate::context::PendingScan;

/// Failures raised by constant pool lookups.
///
/// Out-of-range indexes are a known defect class (stale bytecode against
/// edited sources), so they carry the pool description for bug reports
/// instead of being swallowed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum ConstantPoolError {
    #[error("constant pool index {index} out of bounds (size {size}) in {description}")]
    IndexOutOfBounds {
        index: usize,
        size: usize,
        description: String,
    },
    #[error("constant pool entry {index} in {description} is {found}, expected {expected}")]
    UnexpectedEntry {
        index: usize,
        found: &'static str,
        expected: &'static str,
        description: String,
    },
}

/// The single user-facing failure of expression evaluation.
#[derive(Debug, Error)]
pub(crate) enum InvalidExpressionError {
    #[error("{0}")]
    Compile(String),
    #[error("unable to compile expression: {0}")]
    Io(#[from] std::io::Error),
    #[error("no class was generated for {0}")]
    MissingClass(String),
    #[error("no enclosing class at line {0}")]
    NoEnclosingClass(u32),
    #[error("{0}")]
    Context(String),
}

/// Result of a request that went through the scanning processor.
#[derive(Debug, Error)]
pub(crate) enum ContextError<T: fmt::Debug> {
    /// The scan did not finish in time and the caller must not block.
    /// The pending handle yields the result once the scan completes.
    #[error("scan is still running")]
    Pending(PendingScan<T>),
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

impl<T: fmt::Debug> From<anyhow::Error> for ContextError<T> {
    fn from(error: anyhow::Error) -> Self {
        ContextError::Failed(error)
    }
}

/// Failures reported by the debuggee while redefining classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReloadFailure {
    Verify(String),
    ClassFormat(String),
    UnsupportedVersion(String),
    ClassCircularity(String),
    OutOfMemory,
    VmDisconnected,
    Other(String),
}

impl ReloadFailure {
    /// Classifies the exception thrown by `redefineClasses`.
    pub(crate) fn from_exception(exception: &str, class: &str, message: &str) -> Self {
        let simple = exception.rsplit('.').next().unwrap_or(exception);
        match simple {
            "VerifyError" => ReloadFailure::Verify(class.to_string()),
            "ClassFormatError" => ReloadFailure::ClassFormat(class.to_string()),
            "UnsupportedClassVersionError" => ReloadFailure::UnsupportedVersion(class.to_string()),
            "ClassCircularityError" => ReloadFailure::ClassCircularity(class.to_string()),
            "OutOfMemoryError" => ReloadFailure::OutOfMemory,
            "VMDisconnectedException" => ReloadFailure::VmDisconnected,
            _ => ReloadFailure::Other(message.to_string()),
        }
    }

    /// Message shown to the user, or `None` when the failure must be ignored.
    /// A disconnected VM means the debuggee is already gone.
    pub(crate) fn user_message(&self) -> Option<String> {
        match self {
            ReloadFailure::Verify(class) => {
                Some(format!("Class {class} failed verification and was not reloaded."))
            }
            ReloadFailure::ClassFormat(class) => {
                Some(format!("Class {class} has an invalid format and was not reloaded."))
            }
            ReloadFailure::UnsupportedVersion(class) => Some(format!(
                "Class {class} was compiled for a newer class file version than the debuggee supports."
            )),
            ReloadFailure::ClassCircularity(class) => {
                Some(format!("Class {class} has a circular class hierarchy."))
            }
            ReloadFailure::OutOfMemory => {
                Some("The debuggee ran out of memory while reloading classes.".to_string())
            }
            ReloadFailure::VmDisconnected => None,
            ReloadFailure::Other(message) => Some(format!("Classes were not reloaded: {message}")),
        }
    }
}
