//! The auth-provider capability interface.
//!
//! An [`AuthProvider`] advertises which of the five auth operations it
//! supplies through [`AuthProvider::capabilities`]. Callers consult that set
//! before calling; an operation outside the set is skipped, never treated as
//! a registration error. Streaming tokens are delivered through a
//! [`StreamingTokenSink`] so that providers whose fetch is itself a network
//! call can complete later.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{AuthError, AuthResult};
use crate::time::Timestamp;

/// Newest auth provider interface version understood here.
pub const AUTH_CALLBACKS_CURRENT_VERSION: u32 = 0;

/// Longest lifetime any cached or rotated credential is allowed to claim.
pub const MAX_ENFORCED_TOKEN_EXPIRATION_DURATION: Duration = Duration::from_secs(40 * 60);
/// Streaming tokens closer than this to expiry are not worth using.
pub const MIN_STREAMING_TOKEN_EXPIRATION_DURATION: Duration = Duration::from_secs(30);
/// Sessions are rotated this long before the streaming token expires.
pub const STREAMING_TOKEN_EXPIRATION_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Longest IoT role alias.
pub const MAX_ROLE_ALIAS_LEN: usize = 128;
/// Longest stream (and thing) name.
pub const MAX_STREAM_NAME_LEN: usize = 256;
/// Longest certificate or key path.
pub const MAX_PATH_LEN: usize = 4096;
/// Longest endpoint URI.
pub const MAX_URI_CHAR_LEN: usize = 10_000;

/// One operation an auth provider may supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthCapability {
    /// Per-stream upload token.
    StreamingToken,
    /// Control-plane token.
    SecurityToken,
    /// The device certificate itself.
    DeviceCertificate,
    /// Stable device identifier derived from the certificate.
    DeviceFingerprint,
    /// Trade a certificate for credentials.
    CertificateExchange,
}

impl AuthCapability {
    /// Every capability, in declaration order.
    pub const ALL: [AuthCapability; 5] = [
        AuthCapability::StreamingToken,
        AuthCapability::SecurityToken,
        AuthCapability::DeviceCertificate,
        AuthCapability::DeviceFingerprint,
        AuthCapability::CertificateExchange,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// The set of operations a provider supplies.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthCapabilities(u8);

impl AuthCapabilities {
    /// The empty set.
    pub const NONE: AuthCapabilities = AuthCapabilities(0);

    /// Set holding exactly `capabilities`.
    pub fn of(capabilities: &[AuthCapability]) -> Self {
        capabilities
            .iter()
            .fold(Self::NONE, |set, cap| set.with(*cap))
    }

    /// `self` plus `capability`.
    pub fn with(self, capability: AuthCapability) -> Self {
        AuthCapabilities(self.0 | capability.bit())
    }

    /// Whether `capability` is in the set.
    pub fn contains(self, capability: AuthCapability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = AuthCapability> {
        AuthCapability::ALL
            .into_iter()
            .filter(move |cap| self.contains(*cap))
    }
}

impl fmt::Debug for AuthCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// What kind of material an [`AuthToken`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTokenKind {
    /// A serialized credential record.
    Credentials,
    /// A device certificate (PEM bytes).
    Certificate,
    /// No auth material.
    None,
}

/// Opaque auth material plus its expiration.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// What the bytes hold.
    pub kind: AuthTokenKind,
    /// The material itself.
    pub bytes: Bytes,
    /// Absolute expiration; zero for [`AuthTokenKind::None`].
    pub expiration: Timestamp,
}

impl AuthToken {
    /// Token carrying a serialized credential record.
    pub fn credentials(bytes: impl Into<Bytes>, expiration: Timestamp) -> Self {
        Self {
            kind: AuthTokenKind::Credentials,
            bytes: bytes.into(),
            expiration,
        }
    }

    /// Token carrying a device certificate.
    pub fn certificate(bytes: impl Into<Bytes>, expiration: Timestamp) -> Self {
        Self {
            kind: AuthTokenKind::Certificate,
            bytes: bytes.into(),
            expiration,
        }
    }

    /// Token carrying no material.
    pub fn none() -> Self {
        Self {
            kind: AuthTokenKind::None,
            bytes: Bytes::new(),
            expiration: Timestamp::ZERO,
        }
    }

    /// Length of the material in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("kind", &self.kind)
            .field("size", &self.bytes.len())
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// How a stream intends to use a streaming token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Consuming media.
    Read,
    /// Producing media.
    #[default]
    Write,
}

/// Receiver of streaming-token results.
pub trait StreamingTokenSink: Send + Sync {
    /// Called once per request with the token or the failure.
    fn streaming_token_result(&self, stream_name: &str, result: AuthResult<AuthToken>);
}

/// Source of credentials for control-plane and data-plane calls.
///
/// Every operation has a default body that fails with `Unsupported`; an
/// implementation overrides the ones listed in its capability set.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Interface version the implementation targets.
    fn version(&self) -> u32 {
        AUTH_CALLBACKS_CURRENT_VERSION
    }

    /// Operations this provider supplies.
    fn capabilities(&self) -> AuthCapabilities;

    /// Produce a short-lived token for `stream_name`, delivered to `sink`.
    async fn get_streaming_token(
        &self,
        stream_name: &str,
        access_mode: AccessMode,
        sink: Arc<dyn StreamingTokenSink>,
    ) -> AuthResult<()> {
        let _ = (stream_name, access_mode, sink);
        Err(AuthError::Unsupported {
            capability: AuthCapability::StreamingToken,
        })
    }

    /// Token for control-plane calls.
    async fn get_security_token(&self) -> AuthResult<AuthToken> {
        Err(AuthError::Unsupported {
            capability: AuthCapability::SecurityToken,
        })
    }

    /// The device certificate.
    async fn get_device_certificate(&self) -> AuthResult<AuthToken> {
        Err(AuthError::Unsupported {
            capability: AuthCapability::DeviceCertificate,
        })
    }

    /// Stable identifier for the device.
    async fn get_device_fingerprint(&self) -> AuthResult<String> {
        Err(AuthError::Unsupported {
            capability: AuthCapability::DeviceFingerprint,
        })
    }

    /// Trade `certificate` for a credential token.
    async fn exchange_certificate(&self, certificate: &AuthToken) -> AuthResult<AuthToken> {
        let _ = certificate;
        Err(AuthError::Unsupported {
            capability: AuthCapability::CertificateExchange,
        })
    }

    /// Release the provider's credential material. Must be idempotent.
    fn release(&self) {}
}
