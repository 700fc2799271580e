#![warn(missing_docs)]

//! vidingest auth subsystem: credential records, expiration parsing, rotating, file and certificate-exchange providers

pub mod credential;
pub mod custom;
pub mod error;
pub mod expiration;
pub mod file;
pub mod iot;
pub mod provider;
pub mod rotating;
pub mod time;

pub use credential::{CredentialHeader, CredentialRecord, CredentialView, FieldSpan, MAX_AUTH_LEN};
pub use custom::CustomAuthProvider;
pub use error::{AuthError, AuthResult};
pub use expiration::parse_iot_expiration;
pub use file::FileCredentialProvider;
pub use iot::{CertificateExchangeProvider, IotCredentialRequest, IotCredentialTransport, IotProviderConfig};
pub use provider::{
    AccessMode, AuthCapabilities, AuthCapability, AuthProvider, AuthToken, AuthTokenKind,
    StreamingTokenSink, AUTH_CALLBACKS_CURRENT_VERSION,
};
pub use rotating::RotatingStaticProvider;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
