//! Certificate-exchange (IoT) credential provider.
//!
//! Trades a device certificate for temporary credentials at
//! `https://{endpoint}/role-aliases/{role_alias}/credentials`. The HTTPS call
//! itself belongs to the host: it is made through an
//! [`IotCredentialTransport`] which receives a fully described request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credential::{
    CredentialRecord, MAX_ACCESS_KEY_LEN, MAX_EXPIRATION_LEN, MAX_SECRET_KEY_LEN,
    MAX_SESSION_TOKEN_LEN,
};
use crate::error::{AuthError, AuthResult};
use crate::expiration::parse_iot_expiration;
use crate::provider::{
    AccessMode, AuthCapabilities, AuthCapability, AuthProvider, AuthToken, StreamingTokenSink,
    MAX_ENFORCED_TOKEN_EXPIRATION_DURATION, MAX_PATH_LEN, MAX_ROLE_ALIAS_LEN,
    MAX_STREAM_NAME_LEN, MAX_URI_CHAR_LEN, MIN_STREAMING_TOKEN_EXPIRATION_DURATION,
};
use crate::time::{Clock, Timestamp};

/// Header carrying the thing name on every fetch.
pub const IOT_THING_NAME_HEADER: &str = "x-amzn-iot-thingname";
/// Fetch again when the cached credential expires within this window.
pub const IOT_CREDENTIAL_FETCH_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default connection timeout for a fetch.
pub const IOT_REQUEST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
/// Default completion timeout for a fetch.
pub const IOT_REQUEST_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a certificate-exchange provider.
#[derive(Debug, Clone)]
pub struct IotProviderConfig {
    /// Credential endpoint host, without scheme.
    pub endpoint: String,
    /// Role alias the certificate is exchanged under.
    pub role_alias: String,
    /// Device certificate (PEM).
    pub cert_path: PathBuf,
    /// Device private key (PEM).
    pub private_key_path: PathBuf,
    /// CA bundle used to verify the endpoint.
    pub ca_cert_path: PathBuf,
    /// Thing name sent with every fetch; the stream name by convention.
    pub thing_name: String,
    /// Connection timeout for the fetch (default: 3 seconds).
    pub connection_timeout: Duration,
    /// Overall completion timeout for the fetch (default: 5 seconds).
    pub completion_timeout: Duration,
}

impl IotProviderConfig {
    /// Settings with the default timeouts.
    pub fn new(
        endpoint: impl Into<String>,
        role_alias: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
        ca_cert_path: impl Into<PathBuf>,
        thing_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            role_alias: role_alias.into(),
            cert_path: cert_path.into(),
            private_key_path: private_key_path.into(),
            ca_cert_path: ca_cert_path.into(),
            thing_name: thing_name.into(),
            connection_timeout: IOT_REQUEST_CONNECTION_TIMEOUT,
            completion_timeout: IOT_REQUEST_COMPLETION_TIMEOUT,
        }
    }

    fn validate(&self) -> AuthResult<()> {
        if self.endpoint.is_empty() || self.role_alias.is_empty() || self.thing_name.is_empty() {
            return Err(AuthError::invalid_arg(
                "endpoint, role alias and thing name are required",
            ));
        }
        if self.endpoint.len() > MAX_URI_CHAR_LEN {
            return Err(AuthError::invalid_arg(format!(
                "endpoint of {} chars exceeds {}",
                self.endpoint.len(),
                MAX_URI_CHAR_LEN
            )));
        }
        if self.role_alias.len() > MAX_ROLE_ALIAS_LEN {
            return Err(AuthError::RoleAliasTooLong {
                len: self.role_alias.len(),
                max: MAX_ROLE_ALIAS_LEN,
            });
        }
        for path in [&self.cert_path, &self.private_key_path, &self.ca_cert_path] {
            let len = path.as_os_str().len();
            if len == 0 {
                return Err(AuthError::invalid_arg("certificate paths are required"));
            }
            if len > MAX_PATH_LEN {
                return Err(AuthError::PathTooLong {
                    len,
                    max: MAX_PATH_LEN,
                });
            }
        }
        if self.thing_name.len() > MAX_STREAM_NAME_LEN {
            return Err(AuthError::invalid_arg(format!(
                "thing name of {} chars exceeds {}",
                self.thing_name.len(),
                MAX_STREAM_NAME_LEN
            )));
        }
        Ok(())
    }

    /// Describe the credential fetch for the transport.
    pub fn request(&self) -> IotCredentialRequest {
        IotCredentialRequest {
            url: format!(
                "https://{}/role-aliases/{}/credentials",
                self.endpoint, self.role_alias
            ),
            headers: vec![(IOT_THING_NAME_HEADER.to_string(), self.thing_name.clone())],
            cert_path: self.cert_path.clone(),
            private_key_path: self.private_key_path.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            connection_timeout: self.connection_timeout,
            completion_timeout: self.completion_timeout,
        }
    }
}

/// A fully described mutual-TLS GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotCredentialRequest {
    /// Full HTTPS URL.
    pub url: String,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Client certificate.
    pub cert_path: PathBuf,
    /// Client private key.
    pub private_key_path: PathBuf,
    /// CA bundle.
    pub ca_cert_path: PathBuf,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Completion timeout; the provider gives up after this too.
    pub completion_timeout: Duration,
}

/// Executes credential fetches on behalf of the provider.
#[async_trait]
pub trait IotCredentialTransport: Send + Sync {
    /// Perform the request and return the response body.
    async fn fetch(&self, request: &IotCredentialRequest) -> AuthResult<String>;
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    credentials: CredentialFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialFields {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: String,
}

fn check_len(name: &str, value: &str, max: usize) -> AuthResult<()> {
    if value.len() > max {
        return Err(AuthError::InvalidApiCallReturnJson {
            reason: format!("{} of {} chars exceeds {}", name, value.len(), max),
        });
    }
    Ok(())
}

/// Parse a credential endpoint response as of `now`.
pub fn parse_credential_response(body: &str, now: Timestamp) -> AuthResult<CredentialRecord> {
    let response: CredentialResponse =
        serde_json::from_str(body).map_err(|e| AuthError::InvalidApiCallReturnJson {
            reason: e.to_string(),
        })?;
    let fields = response.credentials;

    check_len("accessKeyId", &fields.access_key_id, MAX_ACCESS_KEY_LEN)?;
    check_len("secretAccessKey", &fields.secret_access_key, MAX_SECRET_KEY_LEN)?;
    check_len("sessionToken", &fields.session_token, MAX_SESSION_TOKEN_LEN)?;
    check_len("expiration", &fields.expiration, MAX_EXPIRATION_LEN)?;

    let expiration = parse_iot_expiration(&fields.expiration, now)?
        .min(now.saturating_add(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION));

    CredentialRecord::new(
        &fields.access_key_id,
        &fields.secret_access_key,
        Some(&fields.session_token),
        expiration,
    )
}

/// Auth provider that trades the device certificate for temporary credentials.
pub struct CertificateExchangeProvider {
    config: IotProviderConfig,
    transport: Arc<dyn IotCredentialTransport>,
    clock: Arc<dyn Clock>,
    credential: Mutex<Option<CredentialRecord>>,
    released: AtomicBool,
}

impl CertificateExchangeProvider {
    /// Validate `config` and build the provider. Nothing is fetched until a
    /// token is requested.
    pub fn new(
        config: IotProviderConfig,
        transport: Arc<dyn IotCredentialTransport>,
        clock: Arc<dyn Clock>,
    ) -> AuthResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            clock,
            credential: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    /// The provider settings.
    pub fn config(&self) -> &IotProviderConfig {
        &self.config
    }

    fn ensure_live(&self) -> AuthResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(AuthError::Released);
        }
        Ok(())
    }

    /// Fetch unless the cached credential stays valid for longer than
    /// `min_validity`.
    async fn refresh(&self, min_validity: Duration) -> AuthResult<CredentialRecord> {
        self.ensure_live()?;
        let mut slot = self.credential.lock().await;
        // A release that lost the race for the lock left its work to us.
        if self.released.load(Ordering::Acquire) {
            CredentialRecord::free(&mut slot);
            return Err(AuthError::Released);
        }
        let now = self.clock.now();
        if let Some(record) = slot.as_ref() {
            if now.saturating_add(min_validity) < record.expiration() {
                return Ok(record.clone());
            }
        }

        let request = self.config.request();
        debug!(url = %request.url, thing = %self.config.thing_name, "fetching iot credentials");
        let body = tokio::time::timeout(request.completion_timeout, self.transport.fetch(&request))
            .await
            .map_err(|_| AuthError::Fetch {
                reason: format!(
                    "no response from {} within {:?}",
                    request.url, request.completion_timeout
                ),
            })??;
        if self.released.load(Ordering::Acquire) {
            CredentialRecord::free(&mut slot);
            return Err(AuthError::Released);
        }
        let record = parse_credential_response(&body, now)?;
        info!(thing = %self.config.thing_name, expiration = %record.expiration(), "fetched iot credentials");
        *slot = Some(record.clone());
        Ok(record)
    }

    async fn certificate_bytes(&self) -> AuthResult<Vec<u8>> {
        self.ensure_live()?;
        Ok(tokio::fs::read(&self.config.cert_path).await?)
    }
}

#[async_trait]
impl AuthProvider for CertificateExchangeProvider {
    fn capabilities(&self) -> AuthCapabilities {
        AuthCapabilities::of(&AuthCapability::ALL)
    }

    async fn get_streaming_token(
        &self,
        stream_name: &str,
        _access_mode: AccessMode,
        sink: Arc<dyn StreamingTokenSink>,
    ) -> AuthResult<()> {
        let result = self
            .refresh(MIN_STREAMING_TOKEN_EXPIRATION_DURATION)
            .await
            .map(|record| {
                AuthToken::credentials(record.as_bytes().to_vec(), record.expiration())
            });
        sink.streaming_token_result(stream_name, result);
        Ok(())
    }

    async fn get_security_token(&self) -> AuthResult<AuthToken> {
        let record = self.refresh(IOT_CREDENTIAL_FETCH_GRACE_PERIOD).await?;
        Ok(AuthToken::credentials(
            record.as_bytes().to_vec(),
            record.expiration(),
        ))
    }

    async fn get_device_certificate(&self) -> AuthResult<AuthToken> {
        let bytes = self.certificate_bytes().await?;
        let expiration = self
            .clock
            .now()
            .saturating_add(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION);
        Ok(AuthToken::certificate(bytes, expiration))
    }

    async fn get_device_fingerprint(&self) -> AuthResult<String> {
        let bytes = self.certificate_bytes().await?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    async fn exchange_certificate(&self, _certificate: &AuthToken) -> AuthResult<AuthToken> {
        self.get_security_token().await
    }

    /// Marks the provider released and frees the cached credential. When a
    /// fetch holds the cache, that fetch frees it instead.
    fn release(&self) {
        self.released.store(true, Ordering::Release);
        if let Ok(mut slot) = self.credential.try_lock() {
            CredentialRecord::free(&mut slot);
        }
    }
}

impl Drop for CertificateExchangeProvider {
    fn drop(&mut self) {
        CredentialRecord::free(self.credential.get_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::io::Write;
    use std::sync::atomic::AtomicU32;

    const NOW_SECS: u64 = 1_548_972_059;
    const BODY: &str = r#"{"credentials":{"accessKeyId":"ASIAEXAMPLE","secretAccessKey":"secret","sessionToken":"session","expiration":"2019-01-31T23:00:59Z"}}"#;

    struct FakeTransport {
        body: String,
        calls: AtomicU32,
        last: parking_lot::Mutex<Option<IotCredentialRequest>>,
    }

    impl FakeTransport {
        fn new(body: &str) -> Arc<Self> {
            Arc::new(Self {
                body: body.to_string(),
                calls: AtomicU32::new(0),
                last: parking_lot::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl IotCredentialTransport for FakeTransport {
        async fn fetch(&self, request: &IotCredentialRequest) -> AuthResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(request.clone());
            Ok(self.body.clone())
        }
    }

    fn config(cert_path: PathBuf) -> IotProviderConfig {
        IotProviderConfig::new(
            "c1.credentials.iot.example.com",
            "video-role",
            cert_path,
            "/etc/iot/private.key",
            "/etc/iot/ca.pem",
            "cam-1",
        )
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Timestamp::from_unix_secs(NOW_SECS)))
    }

    #[test]
    fn test_request_shape() {
        let request = config(PathBuf::from("/etc/iot/cert.pem")).request();
        assert_eq!(
            request.url,
            "https://c1.credentials.iot.example.com/role-aliases/video-role/credentials"
        );
        assert_eq!(
            request.headers,
            vec![("x-amzn-iot-thingname".to_string(), "cam-1".to_string())]
        );
        assert_eq!(request.connection_timeout, Duration::from_secs(3));
        assert_eq!(request.completion_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config(PathBuf::from("/etc/iot/cert.pem"));
        cfg.role_alias = "r".repeat(MAX_ROLE_ALIAS_LEN + 1);
        assert!(matches!(
            cfg.validate(),
            Err(AuthError::RoleAliasTooLong { .. })
        ));

        let cfg = config(PathBuf::from("p".repeat(MAX_PATH_LEN + 1)));
        assert!(matches!(cfg.validate(), Err(AuthError::PathTooLong { .. })));

        let mut cfg = config(PathBuf::from("/etc/iot/cert.pem"));
        cfg.thing_name.clear();
        assert!(matches!(cfg.validate(), Err(AuthError::InvalidArg { .. })));
    }

    #[test]
    fn test_parse_response_clamps_expiration() {
        let now = Timestamp::from_unix_secs(NOW_SECS);
        let record = parse_credential_response(BODY, now).unwrap();
        assert_eq!(record.access_key_id(), b"ASIAEXAMPLE");
        assert_eq!(record.session_token(), Some(&b"session"[..]));
        assert_eq!(
            record.expiration(),
            now.saturating_add(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION)
        );
    }

    #[test]
    fn test_parse_response_rejects_bad_json() {
        let now = Timestamp::from_unix_secs(NOW_SECS);
        assert!(matches!(
            parse_credential_response("{\"credentials\":{}}", now),
            Err(AuthError::InvalidApiCallReturnJson { .. })
        ));

        let long = BODY.replace("ASIAEXAMPLE", &"A".repeat(MAX_ACCESS_KEY_LEN + 1));
        assert!(matches!(
            parse_credential_response(&long, now),
            Err(AuthError::InvalidApiCallReturnJson { .. })
        ));
    }

    #[tokio::test]
    async fn test_security_token_cached_until_grace() {
        let transport = FakeTransport::new(BODY);
        let clock = clock();
        let provider = CertificateExchangeProvider::new(
            config(PathBuf::from("/etc/iot/cert.pem")),
            transport.clone(),
            clock.clone(),
        )
        .unwrap();

        provider.get_security_token().await.unwrap();
        provider.get_security_token().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let request = transport.last.lock().clone().unwrap();
        assert!(request.url.ends_with("/role-aliases/video-role/credentials"));

        clock.advance(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION - Duration::from_secs(4));
        provider.get_security_token().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_streaming_token_refetches_inside_min_validity() {
        struct Sink(parking_lot::Mutex<u32>);
        impl StreamingTokenSink for Sink {
            fn streaming_token_result(&self, _: &str, result: AuthResult<AuthToken>) {
                assert!(result.is_ok());
                *self.0.lock() += 1;
            }
        }

        let transport = FakeTransport::new(BODY);
        let clock = clock();
        let provider = CertificateExchangeProvider::new(
            config(PathBuf::from("/etc/iot/cert.pem")),
            transport.clone(),
            clock.clone(),
        )
        .unwrap();
        let sink = Arc::new(Sink(parking_lot::Mutex::new(0)));

        provider
            .get_streaming_token("cam-1", AccessMode::Write, sink.clone())
            .await
            .unwrap();
        clock.advance(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION - Duration::from_secs(20));
        provider
            .get_streaming_token("cam-1", AccessMode::Write, sink.clone())
            .await
            .unwrap();

        assert_eq!(*sink.0.lock(), 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_certificate_and_fingerprint() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        write!(cert, "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n").unwrap();
        let provider = CertificateExchangeProvider::new(
            config(cert.path().to_path_buf()),
            FakeTransport::new(BODY),
            clock(),
        )
        .unwrap();

        let token = provider.get_device_certificate().await.unwrap();
        assert!(token.bytes.starts_with(b"-----BEGIN CERTIFICATE-----"));

        let fingerprint = provider.get_device_fingerprint().await.unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(
            fingerprint,
            hex::encode(Sha256::digest(std::fs::read(cert.path()).unwrap()))
        );

        let exchanged = provider.exchange_certificate(&token).await.unwrap();
        let view = CredentialRecord::deserialize_in_place(&exchanged.bytes).unwrap();
        assert_eq!(view.access_key_id(), b"ASIAEXAMPLE");
    }

    /// Holds every fetch until released by the test.
    struct GatedTransport {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl IotCredentialTransport for GatedTransport {
        async fn fetch(&self, _request: &IotCredentialRequest) -> AuthResult<String> {
            self.gate.notified().await;
            Ok(BODY.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out() {
        let provider = CertificateExchangeProvider::new(
            config(PathBuf::from("/etc/iot/cert.pem")),
            Arc::new(GatedTransport {
                gate: Arc::new(tokio::sync::Notify::new()),
            }),
            clock(),
        )
        .unwrap();
        assert!(matches!(
            provider.get_security_token().await,
            Err(AuthError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_during_fetch_frees_cache() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let provider = Arc::new(
            CertificateExchangeProvider::new(
                config(PathBuf::from("/etc/iot/cert.pem")),
                Arc::new(GatedTransport { gate: gate.clone() }),
                clock(),
            )
            .unwrap(),
        );

        let fetching = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get_security_token().await }
        });
        while provider.credential.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        provider.release();
        gate.notify_one();
        assert!(matches!(fetching.await.unwrap(), Err(AuthError::Released)));
        assert!(provider.credential.try_lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_blocks_further_use() {
        let provider = CertificateExchangeProvider::new(
            config(PathBuf::from("/etc/iot/cert.pem")),
            FakeTransport::new(BODY),
            clock(),
        )
        .unwrap();
        provider.get_security_token().await.unwrap();
        provider.release();
        provider.release();
        assert!(matches!(
            provider.get_security_token().await,
            Err(AuthError::Released)
        ));
    }
}
