//! Rotating view over a fixed credential.
//!
//! The underlying record never changes; every streaming token handed out
//! claims a fresh expiration of `now + rotation_period`, which is what drives
//! periodic session rotation upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::credential::CredentialRecord;
use crate::error::{AuthError, AuthResult};
use crate::provider::{
    AccessMode, AuthCapabilities, AuthCapability, AuthProvider, AuthToken, StreamingTokenSink,
    MAX_ENFORCED_TOKEN_EXPIRATION_DURATION,
};
use crate::time::Clock;

/// Issues a fixed credential as streaming tokens that expire every rotation
/// period, forcing the upload session to rotate.
pub struct RotatingStaticProvider {
    credential: Mutex<Option<CredentialRecord>>,
    rotation_period: Duration,
    clock: Arc<dyn Clock>,
}

impl RotatingStaticProvider {
    /// Wrap `credential`. Rotation periods above
    /// [`MAX_ENFORCED_TOKEN_EXPIRATION_DURATION`] are rejected.
    pub fn new(
        credential: CredentialRecord,
        rotation_period: Duration,
        clock: Arc<dyn Clock>,
    ) -> AuthResult<Self> {
        if rotation_period > MAX_ENFORCED_TOKEN_EXPIRATION_DURATION {
            return Err(AuthError::invalid_arg(format!(
                "rotation period {:?} exceeds the enforced maximum {:?}",
                rotation_period, MAX_ENFORCED_TOKEN_EXPIRATION_DURATION
            )));
        }
        Ok(Self {
            credential: Mutex::new(Some(credential)),
            rotation_period,
            clock,
        })
    }

    /// Validity given to each streaming token.
    pub fn rotation_period(&self) -> Duration {
        self.rotation_period
    }

    /// Whether the credential has been released.
    pub fn is_released(&self) -> bool {
        self.credential.lock().is_none()
    }

    fn with_credential<T>(&self, f: impl FnOnce(&CredentialRecord) -> T) -> AuthResult<T> {
        let guard = self.credential.lock();
        guard.as_ref().map(f).ok_or(AuthError::Released)
    }
}

#[async_trait]
impl AuthProvider for RotatingStaticProvider {
    fn capabilities(&self) -> AuthCapabilities {
        AuthCapabilities::of(&[AuthCapability::StreamingToken, AuthCapability::SecurityToken])
    }

    async fn get_streaming_token(
        &self,
        stream_name: &str,
        access_mode: AccessMode,
        sink: Arc<dyn StreamingTokenSink>,
    ) -> AuthResult<()> {
        let expiration = self.clock.now().saturating_add(self.rotation_period);
        let bytes = self.with_credential(|record| record.as_bytes().to_vec())?;
        debug!(stream = %stream_name, ?access_mode, %expiration, "issuing rotated streaming token");
        sink.streaming_token_result(stream_name, Ok(AuthToken::credentials(bytes, expiration)));
        Ok(())
    }

    async fn get_security_token(&self) -> AuthResult<AuthToken> {
        self.with_credential(|record| {
            AuthToken::credentials(record.as_bytes().to_vec(), record.expiration())
        })
    }

    fn release(&self) {
        let mut slot = self.credential.lock();
        CredentialRecord::free(&mut slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualClock, Timestamp};

    struct CaptureSink(Mutex<Vec<(String, AuthResult<AuthToken>)>>);

    impl StreamingTokenSink for CaptureSink {
        fn streaming_token_result(&self, stream_name: &str, result: AuthResult<AuthToken>) {
            self.0.lock().push((stream_name.to_string(), result));
        }
    }

    fn record() -> CredentialRecord {
        CredentialRecord::new("AKID", "SECRET", None, Timestamp::from_unix_secs(5_000)).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Timestamp::from_unix_secs(1_000)))
    }

    #[test]
    fn test_rejects_long_rotation_period() {
        let err = RotatingStaticProvider::new(
            record(),
            MAX_ENFORCED_TOKEN_EXPIRATION_DURATION + Duration::from_secs(1),
            clock(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, AuthError::InvalidArg { .. }));

        assert!(RotatingStaticProvider::new(
            record(),
            MAX_ENFORCED_TOKEN_EXPIRATION_DURATION,
            clock()
        )
        .is_ok());
    }

    #[tokio::test]
    async fn test_streaming_token_rotates_expiration() {
        let clock = clock();
        let provider =
            RotatingStaticProvider::new(record(), Duration::from_secs(60), clock.clone()).unwrap();
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));

        provider
            .get_streaming_token("cam-1", AccessMode::Write, sink.clone())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(30));
        provider
            .get_streaming_token("cam-1", AccessMode::Write, sink.clone())
            .await
            .unwrap();

        let results = sink.0.lock();
        assert_eq!(results.len(), 2);
        let first = results[0].1.as_ref().unwrap();
        let second = results[1].1.as_ref().unwrap();
        assert_eq!(first.expiration, Timestamp::from_unix_secs(1_060));
        assert_eq!(second.expiration, Timestamp::from_unix_secs(1_090));
        assert_eq!(results[0].0, "cam-1");

        let view = CredentialRecord::deserialize_in_place(&first.bytes).unwrap();
        assert_eq!(view.access_key_id(), b"AKID");
        assert_eq!(view.expiration(), Timestamp::from_unix_secs(5_000));
    }

    #[tokio::test]
    async fn test_security_token_uses_stored_expiration() {
        let provider =
            RotatingStaticProvider::new(record(), Duration::from_secs(60), clock()).unwrap();
        let token = provider.get_security_token().await.unwrap();
        assert_eq!(token.expiration, Timestamp::from_unix_secs(5_000));
        assert_eq!(token.bytes.as_ref(), record().as_bytes());
    }

    #[tokio::test]
    async fn test_certificate_operations_unsupported() {
        let provider =
            RotatingStaticProvider::new(record(), Duration::from_secs(60), clock()).unwrap();
        let caps = provider.capabilities();
        assert!(!caps.contains(AuthCapability::DeviceCertificate));
        assert!(!caps.contains(AuthCapability::DeviceFingerprint));
        assert!(!caps.contains(AuthCapability::CertificateExchange));
        assert!(matches!(
            provider.get_device_certificate().await,
            Err(AuthError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let provider =
            RotatingStaticProvider::new(record(), Duration::from_secs(60), clock()).unwrap();
        provider.release();
        assert!(provider.is_released());
        provider.release();
        assert!(matches!(
            provider.get_security_token().await,
            Err(AuthError::Released)
        ));
    }
}
