//! Broker error abstractions.

use thiserror::Error;

use crate::remoting::{response_code, RemotingCommand};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The request could not be queued, the target processor is at capacity.
    #[error("system busy, {0}")]
    Overloaded(String),
    /// The request code is not supported by this broker.
    #[error("request code {0} not supported")]
    NotSupported(i32),
    /// The resource specified by the request is not found.
    #[error("the resource specified in the request is not found")]
    ResourceNotFound,
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}

impl AppError {
    /// The remoting response code corresponding to this error.
    pub fn response_code(&self) -> i32 {
        match self {
            AppError::InvalidInput(_) | AppError::Ise(_) => response_code::SYSTEM_ERROR,
            AppError::Overloaded(_) => response_code::SYSTEM_BUSY,
            AppError::NotSupported(_) => response_code::REQUEST_CODE_NOT_SUPPORTED,
            AppError::ResourceNotFound => response_code::QUERY_NOT_FOUND,
        }
    }

    /// Build a response command for the request with the given opaque.
    pub fn into_response(self, opaque: i32) -> RemotingCommand {
        let code = self.response_code();
        RemotingCommand::new_response(code, opaque, Some(self.to_string()))
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
