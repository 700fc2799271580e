//! Host-supplied auth provider assembled from closures.
//!
//! Each closure fills one capability; the capability set is exactly the set
//! of closures supplied. The release hook runs at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AuthError, AuthResult};
use crate::provider::{
    AccessMode, AuthCapabilities, AuthCapability, AuthProvider, AuthToken, StreamingTokenSink,
    AUTH_CALLBACKS_CURRENT_VERSION,
};

type StreamingFn = dyn Fn(&str, AccessMode) -> AuthResult<AuthToken> + Send + Sync;
type TokenFn = dyn Fn() -> AuthResult<AuthToken> + Send + Sync;
type FingerprintFn = dyn Fn() -> AuthResult<String> + Send + Sync;
type ExchangeFn = dyn Fn(&AuthToken) -> AuthResult<AuthToken> + Send + Sync;
type ReleaseFn = dyn Fn() + Send + Sync;

/// Auth provider whose capabilities are the closures it was built with.
#[derive(Default)]
pub struct CustomAuthProvider {
    version: u32,
    streaming_token: Option<Box<StreamingFn>>,
    security_token: Option<Box<TokenFn>>,
    device_certificate: Option<Box<TokenFn>>,
    device_fingerprint: Option<Box<FingerprintFn>>,
    exchange: Option<Box<ExchangeFn>>,
    on_release: Option<Box<ReleaseFn>>,
    released: AtomicBool,
}

impl CustomAuthProvider {
    /// Provider with no capabilities at the current interface version.
    pub fn new() -> Self {
        Self {
            version: AUTH_CALLBACKS_CURRENT_VERSION,
            ..Default::default()
        }
    }

    /// Report `version` as the interface version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Supply streaming tokens from `f`.
    pub fn streaming_token(
        mut self,
        f: impl Fn(&str, AccessMode) -> AuthResult<AuthToken> + Send + Sync + 'static,
    ) -> Self {
        self.streaming_token = Some(Box::new(f));
        self
    }

    /// Supply security tokens from `f`.
    pub fn security_token(
        mut self,
        f: impl Fn() -> AuthResult<AuthToken> + Send + Sync + 'static,
    ) -> Self {
        self.security_token = Some(Box::new(f));
        self
    }

    /// Supply the device certificate from `f`.
    pub fn device_certificate(
        mut self,
        f: impl Fn() -> AuthResult<AuthToken> + Send + Sync + 'static,
    ) -> Self {
        self.device_certificate = Some(Box::new(f));
        self
    }

    /// Supply the device fingerprint from `f`.
    pub fn device_fingerprint(
        mut self,
        f: impl Fn() -> AuthResult<String> + Send + Sync + 'static,
    ) -> Self {
        self.device_fingerprint = Some(Box::new(f));
        self
    }

    /// Trade certificates for credentials with `f`.
    pub fn exchange_certificate(
        mut self,
        f: impl Fn(&AuthToken) -> AuthResult<AuthToken> + Send + Sync + 'static,
    ) -> Self {
        self.exchange = Some(Box::new(f));
        self
    }

    /// Run `f` on the first release.
    pub fn on_release(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }
}

fn unsupported(capability: AuthCapability) -> AuthError {
    AuthError::Unsupported { capability }
}

#[async_trait]
impl AuthProvider for CustomAuthProvider {
    fn version(&self) -> u32 {
        self.version
    }

    fn capabilities(&self) -> AuthCapabilities {
        let mut set = AuthCapabilities::NONE;
        let slots = [
            (self.streaming_token.is_some(), AuthCapability::StreamingToken),
            (self.security_token.is_some(), AuthCapability::SecurityToken),
            (self.device_certificate.is_some(), AuthCapability::DeviceCertificate),
            (self.device_fingerprint.is_some(), AuthCapability::DeviceFingerprint),
            (self.exchange.is_some(), AuthCapability::CertificateExchange),
        ];
        for (present, capability) in slots {
            if present {
                set = set.with(capability);
            }
        }
        set
    }

    async fn get_streaming_token(
        &self,
        stream_name: &str,
        access_mode: AccessMode,
        sink: Arc<dyn StreamingTokenSink>,
    ) -> AuthResult<()> {
        let f = self
            .streaming_token
            .as_ref()
            .ok_or_else(|| unsupported(AuthCapability::StreamingToken))?;
        sink.streaming_token_result(stream_name, f(stream_name, access_mode));
        Ok(())
    }

    async fn get_security_token(&self) -> AuthResult<AuthToken> {
        let f = self
            .security_token
            .as_ref()
            .ok_or_else(|| unsupported(AuthCapability::SecurityToken))?;
        f()
    }

    async fn get_device_certificate(&self) -> AuthResult<AuthToken> {
        let f = self
            .device_certificate
            .as_ref()
            .ok_or_else(|| unsupported(AuthCapability::DeviceCertificate))?;
        f()
    }

    async fn get_device_fingerprint(&self) -> AuthResult<String> {
        let f = self
            .device_fingerprint
            .as_ref()
            .ok_or_else(|| unsupported(AuthCapability::DeviceFingerprint))?;
        f()
    }

    async fn exchange_certificate(&self, certificate: &AuthToken) -> AuthResult<AuthToken> {
        let f = self
            .exchange
            .as_ref()
            .ok_or_else(|| unsupported(AuthCapability::CertificateExchange))?;
        f(certificate)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(f) = &self.on_release {
            f();
        }
    }
}
