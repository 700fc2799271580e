//! Error types for the client runtime.

use thiserror::Error;
use vidingest_auth::AuthError;

/// Which callback category a registration targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackCategory {
    /// Remote-call chain.
    Api,
    /// Credential source.
    Auth,
    /// Stream lifecycle events.
    Stream,
    /// Client lifecycle events.
    Producer,
    /// Clock and randomness.
    Platform,
}

/// Errors raised by the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An argument or configuration value was rejected.
    #[error("invalid argument: {reason}")]
    InvalidArg {
        /// What was wrong.
        reason: String,
    },

    /// Registration rejected: the implementation targets a newer structure
    /// version than this provider understands.
    #[error("invalid {category:?} callbacks version {version} (supported up to {supported})")]
    InvalidCallbacksVersion {
        /// Category of the rejected registration.
        category: CallbackCategory,
        /// Version the implementation reported.
        version: u32,
        /// Highest version this provider accepts.
        supported: u32,
    },

    /// The same object was registered twice in one category.
    #[error("{category:?} callbacks already registered")]
    DuplicateCallbacks {
        /// Category of the rejected registration.
        category: CallbackCategory,
    },

    /// A callback implementation reported failure.
    #[error("callback failed: {reason}")]
    Callback {
        /// Failure reported by the implementation.
        reason: String,
    },

    /// A live stream already uses this name.
    #[error("stream {name:?} already exists")]
    StreamExists {
        /// The contested name.
        name: String,
    },

    /// The stream was stopped before the operation finished.
    #[error("stream stopped")]
    Stopped,

    /// Failure inside the auth subsystem.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Result alias for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub(crate) fn invalid_arg(reason: impl Into<String>) -> Self {
        ClientError::InvalidArg {
            reason: reason.into(),
        }
    }

    /// Convenience for callback implementations.
    pub fn callback(reason: impl Into<String>) -> Self {
        ClientError::Callback {
            reason: reason.into(),
        }
    }
}
