//! Error types for the auth subsystem.

use thiserror::Error;

use crate::provider::AuthCapability;

/// Errors raised by the credential and auth-provider layer.
///
/// Argument and credential-format errors are surfaced synchronously and are
/// never retried by callers: a malformed or expired credential cannot become
/// valid by asking again.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A required input was missing (the null buffer / null handle case).
    #[error("null argument")]
    NullArg,

    /// An input was present but unusable.
    #[error("invalid argument: {reason}")]
    InvalidArg {
        /// What was wrong with the input.
        reason: String,
    },

    /// The serialized credential would exceed the authentication blob limit,
    /// or a mandatory field is empty where content is required.
    #[error("invalid auth length: {len} bytes (max {max})")]
    InvalidAuthLen {
        /// Length that was requested, in bytes.
        len: usize,
        /// Largest accepted length, in bytes.
        max: usize,
    },

    /// The expiration string was empty.
    #[error("empty expiration string")]
    EmptyString,

    /// The expiration string did not match `YYYY-MM-DDTHH:MM:SSZ`.
    #[error("failed to parse expiration timestamp {value:?}")]
    IotExpirationParsingFailed {
        /// The rejected input.
        value: String,
    },

    /// The expiration resolved to an instant before the reference time.
    #[error("expiration {expiration_secs}s is before now {now_secs}s")]
    IotExpirationOccursInPast {
        /// Parsed expiration, in Unix seconds.
        expiration_secs: i64,
        /// Reference time, in Unix seconds.
        now_secs: u64,
    },

    /// The credential endpoint answered with JSON we cannot use.
    #[error("invalid credential response: {reason}")]
    InvalidApiCallReturnJson {
        /// Why the response was rejected.
        reason: String,
    },

    /// The IoT role alias exceeds its length limit.
    #[error("role alias too long: {len} chars (max {max})")]
    RoleAliasTooLong {
        /// Supplied length.
        len: usize,
        /// Length limit.
        max: usize,
    },

    /// A certificate or key path exceeds its length limit.
    #[error("path too long: {len} chars (max {max})")]
    PathTooLong {
        /// Supplied length.
        len: usize,
        /// Length limit.
        max: usize,
    },

    /// The provider does not supply this capability.
    #[error("auth capability {capability:?} not supported")]
    Unsupported {
        /// The capability that was asked for.
        capability: AuthCapability,
    },

    /// The provider's credential has already been released.
    #[error("auth provider already released")]
    Released,

    /// The credential fetch itself failed (transport-level failure).
    #[error("credential fetch failed: {reason}")]
    Fetch {
        /// Description of the failure.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for auth operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl AuthError {
    pub(crate) fn invalid_arg(reason: impl Into<String>) -> Self {
        AuthError::InvalidArg {
            reason: reason.into(),
        }
    }
}
