//! Error types for Joblet.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous reference: {0}")]
    AmbiguousReference(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{op}: {source}")]
    Syscall {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a kernel error with the operation that produced it. The errno is
    /// preserved inside the `io::Error` for callers that branch on it.
    pub fn syscall(op: impl Into<String>, source: std::io::Error) -> Self {
        Error::Syscall {
            op: op.into(),
            source,
        }
    }

    /// The raw OS error code, if this error originated in the kernel.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Syscall { source, .. } | Error::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
