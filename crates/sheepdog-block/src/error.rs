//! Driver error types.

use sheepdog_proto::SdError;
use thiserror::Error;

/// Errors returned by the block driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("{context}: {source}")]
    Server {
        context: String,
        #[source]
        source: SdError,
    },

    #[error("cannot connect to {0}")]
    Transport(String),

    #[error("VDI not found: {0}")]
    NotFound(String),

    #[error("VDI is locked: {0}")]
    Busy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("I/O error")]
    Io,

    #[error("operation canceled")]
    Canceled,

    #[error("device is closed")]
    Closed,
}

impl DriverError {
    /// Wrap a daemon result with what was being attempted.
    pub fn server(context: impl Into<String>, source: SdError) -> Self {
        DriverError::Server {
            context: context.into(),
            source,
        }
    }
}

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;
