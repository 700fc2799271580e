//! Composition root for every callback category and the active auth source.
//!
//! A [`CallbacksProvider`] is populated during setup through `&mut self`
//! registration calls and then shared (usually behind an `Arc`) with every
//! stream state machine and the health monitor.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};
use vidingest_auth::{
    AuthCapability, AuthProvider, AuthToken, Clock, CredentialRecord, RotatingStaticProvider,
    Timestamp, AUTH_CALLBACKS_CURRENT_VERSION,
};

use crate::callbacks::{
    ApiCallbacks, DefaultPlatform, PlatformCall, PlatformCallbacks, ProducerCallbacks,
    ProducerEvent, ProducerEvents, StreamCallbacks, StreamEvent, StreamEvents,
    API_CALLBACKS_CURRENT_VERSION, PLATFORM_CALLBACKS_CURRENT_VERSION,
    PRODUCER_CALLBACKS_CURRENT_VERSION, STREAM_CALLBACKS_CURRENT_VERSION,
};
use crate::chain::{
    AggregateSlot, CallbackChain, CallbackResult, ChainInvocation, DEFAULT_CALLBACK_CHAIN_COUNT,
};
use crate::config::ClientConfig;
use crate::error::{CallbackCategory, ClientError, ClientResult};
use crate::service::ApiCall;

type PlatformSlot = AggregateSlot<dyn PlatformCallbacks, PlatformCall>;

enum Registration {
    Api(Arc<dyn ApiCallbacks>),
    Stream(Arc<dyn StreamCallbacks>),
    Producer(Arc<dyn ProducerCallbacks>),
    Platform(Arc<dyn PlatformCallbacks>),
}

impl Registration {
    fn release(&self) {
        match self {
            Registration::Api(cb) => cb.release(),
            Registration::Stream(cb) => cb.release(),
            Registration::Producer(cb) => cb.release(),
            Registration::Platform(cb) => cb.release(),
        }
    }
}

fn check_version(category: CallbackCategory, version: u32, supported: u32) -> ClientResult<()> {
    if version > supported {
        return Err(ClientError::InvalidCallbacksVersion {
            category,
            version,
            supported,
        });
    }
    Ok(())
}

/// Every callback category a client dispatches through, plus the auth source.
pub struct CallbacksProvider {
    api: CallbackChain<dyn ApiCallbacks, ApiCall>,
    stream: AggregateSlot<dyn StreamCallbacks, StreamEvent>,
    producer: AggregateSlot<dyn ProducerCallbacks, ProducerEvent>,
    platform: Arc<RwLock<PlatformSlot>>,
    auth: Option<Arc<dyn AuthProvider>>,
    registrations: Vec<Registration>,
    freed: bool,
}

impl CallbacksProvider {
    /// Create a provider whose API chain holds at most `api_chain_capacity`
    /// implementations.
    pub fn new(api_chain_capacity: usize) -> ClientResult<Self> {
        Ok(Self {
            api: CallbackChain::with_capacity(api_chain_capacity)?,
            stream: AggregateSlot::new(),
            producer: AggregateSlot::new(),
            platform: Arc::new(RwLock::new(AggregateSlot::new())),
            auth: None,
            registrations: Vec::new(),
            freed: false,
        })
    }

    /// Provider with the default API chain capacity.
    pub fn with_defaults() -> ClientResult<Self> {
        Self::new(DEFAULT_CALLBACK_CHAIN_COUNT)
    }

    /// Provider whose API chain is sized by
    /// `config.api_callback_chain_capacity`.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        Self::new(config.api_callback_chain_capacity)
    }

    fn ensure_live(&self) -> ClientResult<()> {
        if self.freed {
            return Err(ClientError::invalid_arg("callbacks provider already freed"));
        }
        Ok(())
    }

    /// Append to the API chain. Fails once the chain is full.
    pub fn register_api_callbacks(&mut self, callbacks: Arc<dyn ApiCallbacks>) -> ClientResult<()> {
        self.ensure_live()?;
        check_version(
            CallbackCategory::Api,
            callbacks.version(),
            API_CALLBACKS_CURRENT_VERSION,
        )?;
        if self.api.contains(&callbacks) {
            return Err(ClientError::DuplicateCallbacks {
                category: CallbackCategory::Api,
            });
        }
        let calls = callbacks.supported_calls();
        self.api.push(Arc::clone(&callbacks), calls)?;
        self.registrations.push(Registration::Api(callbacks));
        debug!(?calls, count = self.api.len(), "registered api callbacks");
        Ok(())
    }

    /// Add a partial stream-event implementation.
    pub fn register_stream_callbacks(
        &mut self,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> ClientResult<()> {
        self.ensure_live()?;
        check_version(
            CallbackCategory::Stream,
            callbacks.version(),
            STREAM_CALLBACKS_CURRENT_VERSION,
        )?;
        if self.stream.contains(&callbacks) {
            return Err(ClientError::DuplicateCallbacks {
                category: CallbackCategory::Stream,
            });
        }
        let events = callbacks.supported_events();
        self.stream.register(Arc::clone(&callbacks), events)?;
        self.registrations.push(Registration::Stream(callbacks));
        Ok(())
    }

    /// Add a partial producer-event implementation.
    pub fn register_producer_callbacks(
        &mut self,
        callbacks: Arc<dyn ProducerCallbacks>,
    ) -> ClientResult<()> {
        self.ensure_live()?;
        check_version(
            CallbackCategory::Producer,
            callbacks.version(),
            PRODUCER_CALLBACKS_CURRENT_VERSION,
        )?;
        if self.producer.contains(&callbacks) {
            return Err(ClientError::DuplicateCallbacks {
                category: CallbackCategory::Producer,
            });
        }
        let events = callbacks.supported_events();
        self.producer.register(Arc::clone(&callbacks), events)?;
        self.registrations.push(Registration::Producer(callbacks));
        Ok(())
    }

    /// Add a partial platform implementation.
    pub fn register_platform_callbacks(
        &mut self,
        callbacks: Arc<dyn PlatformCallbacks>,
    ) -> ClientResult<()> {
        self.ensure_live()?;
        check_version(
            CallbackCategory::Platform,
            callbacks.version(),
            PLATFORM_CALLBACKS_CURRENT_VERSION,
        )?;
        {
            let mut platform = self.platform.write();
            if platform.contains(&callbacks) {
                return Err(ClientError::DuplicateCallbacks {
                    category: CallbackCategory::Platform,
                });
            }
            platform.register(Arc::clone(&callbacks), callbacks.supported_calls())?;
        }
        self.registrations.push(Registration::Platform(callbacks));
        Ok(())
    }

    /// Make `auth` the single active auth source.
    ///
    /// Returns the provider it replaced, which is not released: the caller
    /// decides what happens to it. A rejected registration leaves the current
    /// source in place.
    pub fn register_auth_provider(
        &mut self,
        auth: Arc<dyn AuthProvider>,
    ) -> ClientResult<Option<Arc<dyn AuthProvider>>> {
        self.ensure_live()?;
        check_version(
            CallbackCategory::Auth,
            auth.version(),
            AUTH_CALLBACKS_CURRENT_VERSION,
        )?;
        if let Some(current) = &self.auth {
            if Arc::ptr_eq(current, &auth) {
                return Err(ClientError::DuplicateCallbacks {
                    category: CallbackCategory::Auth,
                });
            }
        }
        info!(capabilities = ?auth.capabilities(), "registered auth provider");
        Ok(self.auth.replace(auth))
    }

    /// Install `credential` as the auth source. Streaming tokens are reissued
    /// with `rotation_period` of validity, measured on this provider's clock.
    pub fn register_static_credentials(
        &mut self,
        credential: CredentialRecord,
        rotation_period: Duration,
    ) -> ClientResult<Option<Arc<dyn AuthProvider>>> {
        let rotating = RotatingStaticProvider::new(credential, rotation_period, self.clock())?;
        debug!(?rotation_period, "wrapping static credentials");
        self.register_auth_provider(Arc::new(rotating))
    }

    /// The active auth source, if any.
    pub fn auth(&self) -> Option<&Arc<dyn AuthProvider>> {
        self.auth.as_ref()
    }

    /// Number of API chain members.
    pub fn api_callback_count(&self) -> usize {
        self.api.len()
    }

    /// Maximum number of API chain members.
    pub fn api_chain_capacity(&self) -> usize {
        self.api.capacity()
    }

    /// Whether any API chain member supplies `call`.
    pub fn supports_api_call(&self, call: ApiCall) -> bool {
        self.api.supports(call)
    }

    /// Run `f` over the API chain members supplying `call`.
    pub fn invoke_api<F>(&self, call: ApiCall, f: F) -> ChainInvocation
    where
        F: FnMut(&(dyn ApiCallbacks + 'static)) -> CallbackResult,
    {
        self.api.invoke(call, f)
    }

    /// Dispatcher for stream events.
    pub fn stream_events(&self) -> StreamEvents<'_> {
        StreamEvents::new(&self.stream)
    }

    /// Dispatcher for producer events.
    pub fn producer_events(&self) -> ProducerEvents<'_> {
        ProducerEvents::new(&self.producer)
    }

    /// Current time from the platform slot.
    pub fn current_time(&self) -> Timestamp {
        current_time(&self.platform.read())
    }

    /// Random value from the platform slot.
    pub fn random_u32(&self) -> u32 {
        let platform = self.platform.read();
        platform
            .resolve_or(PlatformCall::Random, &DefaultPlatform)
            .random_u32()
    }

    /// A clock that always reads through the platform slot, including
    /// registrations made after it was handed out.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(PlatformClock {
            platform: Arc::clone(&self.platform),
        })
    }

    /// Auth material for control-plane calls.
    ///
    /// Prefers a security token, then the device certificate (exchanged for a
    /// token when the source can), and falls back to no auth.
    pub async fn security_auth_info(&self) -> ClientResult<AuthToken> {
        let Some(auth) = &self.auth else {
            return Ok(AuthToken::none());
        };
        let capabilities = auth.capabilities();
        if capabilities.contains(AuthCapability::SecurityToken) {
            return Ok(auth.get_security_token().await?);
        }
        if capabilities.contains(AuthCapability::DeviceCertificate) {
            let certificate = auth.get_device_certificate().await?;
            if capabilities.contains(AuthCapability::CertificateExchange) {
                return Ok(auth.exchange_certificate(&certificate).await?);
            }
            return Ok(certificate);
        }
        Ok(AuthToken::none())
    }

    /// The device fingerprint, when the auth source supplies one.
    pub async fn device_fingerprint(&self) -> ClientResult<Option<String>> {
        match &self.auth {
            Some(auth) if auth.capabilities().contains(AuthCapability::DeviceFingerprint) => {
                Ok(Some(auth.get_device_fingerprint().await?))
            }
            _ => Ok(None),
        }
    }

    /// Whether `free` has run.
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// Release every registration in registration order, then the active
    /// auth source. A second call does nothing.
    pub fn free(&mut self) {
        if self.freed {
            return;
        }
        self.freed = true;
        for registration in self.registrations.drain(..) {
            registration.release();
        }
        if let Some(auth) = self.auth.take() {
            auth.release();
        }
        debug!("callbacks provider freed");
    }
}

impl Drop for CallbacksProvider {
    fn drop(&mut self) {
        self.free();
    }
}

fn current_time(platform: &PlatformSlot) -> Timestamp {
    platform
        .resolve_or(PlatformCall::CurrentTime, &DefaultPlatform)
        .current_time()
}

struct PlatformClock {
    platform: Arc<RwLock<PlatformSlot>>,
}

impl Clock for PlatformClock {
    fn now(&self) -> Timestamp {
        current_time(&self.platform.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainFlow, OpSet, MAX_CALLBACK_CHAIN_COUNT};
    use crate::service::ServiceCallContext;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vidingest_auth::{AuthCapabilities, AuthResult, CustomAuthProvider, ManualClock};

    struct Describer {
        id: u32,
        stop: bool,
        version: u32,
        calls: AtomicU32,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl Describer {
        fn new(id: u32, log: &Arc<Mutex<Vec<u32>>>) -> Arc<Self> {
            Self::versioned(id, API_CALLBACKS_CURRENT_VERSION, log)
        }

        fn versioned(id: u32, version: u32, log: &Arc<Mutex<Vec<u32>>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                stop: false,
                version,
                calls: AtomicU32::new(0),
                log: Arc::clone(log),
            })
        }
    }

    impl ApiCallbacks for Describer {
        fn version(&self) -> u32 {
            self.version
        }

        fn supported_calls(&self) -> OpSet<ApiCall> {
            OpSet::of(&[ApiCall::DescribeStream])
        }

        fn describe_stream(
            &self,
            _stream_name: &str,
            _ctx: &ServiceCallContext,
        ) -> crate::chain::CallbackResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.stop {
                ChainFlow::StopChain
            } else {
                ChainFlow::Continue
            })
        }

        fn release(&self) {
            self.log.lock().push(self.id);
        }
    }

    #[test]
    fn test_capacity_must_be_in_range() {
        assert!(CallbacksProvider::new(0).is_err());
        assert!(CallbacksProvider::new(MAX_CALLBACK_CHAIN_COUNT + 1).is_err());
        let provider = CallbacksProvider::with_defaults().unwrap();
        assert_eq!(provider.api_chain_capacity(), DEFAULT_CALLBACK_CHAIN_COUNT);
    }

    #[test]
    fn test_from_config_sizes_api_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = ClientConfig {
            api_callback_chain_capacity: 2,
            ..Default::default()
        };
        let mut provider = CallbacksProvider::from_config(&config).unwrap();
        assert_eq!(provider.api_chain_capacity(), 2);
        provider.register_api_callbacks(Describer::new(1, &log)).unwrap();
        provider.register_api_callbacks(Describer::new(2, &log)).unwrap();
        assert!(provider.register_api_callbacks(Describer::new(3, &log)).is_err());

        let invalid = ClientConfig {
            api_callback_chain_capacity: 0,
            ..Default::default()
        };
        assert!(CallbacksProvider::from_config(&invalid).is_err());
    }

    #[tokio::test]
    async fn test_static_credentials_rotate_on_provider_clock() {
        struct Capture(Mutex<Option<AuthResult<AuthToken>>>);
        impl vidingest_auth::StreamingTokenSink for Capture {
            fn streaming_token_result(&self, _: &str, result: AuthResult<AuthToken>) {
                *self.0.lock() = Some(result);
            }
        }

        let now = Timestamp::from_unix_secs(1_000);
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        provider
            .register_platform_callbacks(Arc::new(FixedTime(now)))
            .unwrap();
        let record =
            CredentialRecord::new("AKID", "SECRET", None, Timestamp::from_unix_secs(90_000))
                .unwrap();
        let config = ClientConfig {
            rotation_period_secs: 600,
            ..Default::default()
        };
        provider
            .register_static_credentials(record.clone(), config.rotation_period())
            .unwrap();

        let auth = provider.auth().unwrap().clone();
        assert!(auth.capabilities().contains(AuthCapability::StreamingToken));
        let sink = Arc::new(Capture(Mutex::new(None)));
        auth.get_streaming_token("cam", vidingest_auth::AccessMode::Write, sink.clone())
            .await
            .unwrap();
        let token = sink.0.lock().take().unwrap().unwrap();
        assert_eq!(token.expiration, now.saturating_add(Duration::from_secs(600)));
        assert_eq!(token.bytes.as_ref(), record.as_bytes());

        let security = provider.security_auth_info().await.unwrap();
        assert_eq!(security.expiration, record.expiration());

        let too_long = Duration::from_secs(config.rotation_period_secs * 100);
        assert!(matches!(
            provider.register_static_credentials(record, too_long),
            Err(ClientError::Auth(_))
        ));
    }

    #[test]
    fn test_api_chain_overflow_keeps_existing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = CallbacksProvider::new(MAX_CALLBACK_CHAIN_COUNT).unwrap();
        for id in 0..MAX_CALLBACK_CHAIN_COUNT as u32 {
            provider.register_api_callbacks(Describer::new(id, &log)).unwrap();
        }
        let overflow = provider.register_api_callbacks(Describer::new(99, &log));
        assert!(matches!(overflow, Err(ClientError::InvalidArg { .. })));
        assert_eq!(provider.api_callback_count(), MAX_CALLBACK_CHAIN_COUNT);
    }

    #[test]
    fn test_duplicate_and_version_rejections() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        let describer = Describer::new(1, &log);
        provider.register_api_callbacks(describer.clone()).unwrap();
        assert!(matches!(
            provider.register_api_callbacks(describer),
            Err(ClientError::DuplicateCallbacks {
                category: CallbackCategory::Api
            })
        ));

        let newer = Describer::versioned(2, API_CALLBACKS_CURRENT_VERSION + 1, &log);
        assert!(matches!(
            provider.register_api_callbacks(newer),
            Err(ClientError::InvalidCallbacksVersion {
                category: CallbackCategory::Api,
                ..
            })
        ));
        assert_eq!(provider.api_callback_count(), 1);
    }

    #[test]
    fn test_auth_registration() {
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        let released = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&released);
        let first: Arc<dyn AuthProvider> = Arc::new(
            CustomAuthProvider::new()
                .on_release(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        assert!(provider.register_auth_provider(first.clone()).unwrap().is_none());

        let newer: Arc<dyn AuthProvider> = Arc::new(
            CustomAuthProvider::new().with_version(AUTH_CALLBACKS_CURRENT_VERSION + 1),
        );
        assert!(matches!(
            provider.register_auth_provider(newer),
            Err(ClientError::InvalidCallbacksVersion {
                category: CallbackCategory::Auth,
                ..
            })
        ));
        assert!(Arc::ptr_eq(provider.auth().unwrap(), &first));

        let second: Arc<dyn AuthProvider> = Arc::new(CustomAuthProvider::new());
        let prior = provider.register_auth_provider(second).unwrap().unwrap();
        assert!(Arc::ptr_eq(&prior, &first));
        assert_eq!(released.load(Ordering::SeqCst), 0);

        provider.free();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_free_releases_in_registration_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        for id in [3, 1, 2] {
            provider.register_api_callbacks(Describer::new(id, &log)).unwrap();
        }
        provider.free();
        provider.free();
        drop(provider);
        assert_eq!(*log.lock(), vec![3, 1, 2]);
    }

    #[test]
    fn test_registration_after_free_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        provider.free();
        assert!(provider.is_freed());
        assert!(provider.register_api_callbacks(Describer::new(1, &log)).is_err());
    }

    struct FixedTime(Timestamp);

    impl PlatformCallbacks for FixedTime {
        fn supported_calls(&self) -> OpSet<PlatformCall> {
            OpSet::of(&[PlatformCall::CurrentTime])
        }

        fn current_time(&self) -> Timestamp {
            self.0
        }
    }

    #[test]
    fn test_platform_clock_follows_later_registrations() {
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        let clock = provider.clock();
        let fixed = Timestamp::from_unix_secs(42);
        provider
            .register_platform_callbacks(Arc::new(FixedTime(fixed)))
            .unwrap();
        assert_eq!(clock.now(), fixed);
        assert_eq!(provider.current_time(), fixed);
        // random still comes from the default
        let _ = provider.random_u32();
    }

    struct CertOnly {
        exchange: bool,
    }

    #[async_trait]
    impl AuthProvider for CertOnly {
        fn capabilities(&self) -> AuthCapabilities {
            let caps = AuthCapabilities::of(&[AuthCapability::DeviceCertificate]);
            if self.exchange {
                caps.with(AuthCapability::CertificateExchange)
            } else {
                caps
            }
        }

        async fn get_device_certificate(&self) -> AuthResult<AuthToken> {
            Ok(AuthToken::certificate(&b"PEM"[..], Timestamp::from_unix_secs(10)))
        }

        async fn exchange_certificate(&self, certificate: &AuthToken) -> AuthResult<AuthToken> {
            assert_eq!(certificate.bytes.as_ref(), b"PEM");
            Ok(AuthToken::credentials(&b"exchanged"[..], Timestamp::from_unix_secs(20)))
        }
    }

    #[tokio::test]
    async fn test_security_auth_resolution() {
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        assert_eq!(provider.security_auth_info().await.unwrap(), AuthToken::none());

        provider
            .register_auth_provider(Arc::new(CertOnly { exchange: false }))
            .unwrap();
        let raw = provider.security_auth_info().await.unwrap();
        assert_eq!(raw.bytes.as_ref(), b"PEM");

        provider
            .register_auth_provider(Arc::new(CertOnly { exchange: true }))
            .unwrap();
        let exchanged = provider.security_auth_info().await.unwrap();
        assert_eq!(exchanged.bytes.as_ref(), b"exchanged");
        assert_eq!(provider.device_fingerprint().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_security_token_preferred() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_unix_secs(100)));
        let record =
            vidingest_auth::CredentialRecord::new("AKID", "secret", None, Timestamp::from_unix_secs(500))
                .unwrap();
        let rotating = vidingest_auth::RotatingStaticProvider::new(
            record,
            std::time::Duration::from_secs(60),
            clock,
        )
        .unwrap();
        let mut provider = CallbacksProvider::with_defaults().unwrap();
        provider.register_auth_provider(Arc::new(rotating)).unwrap();
        let token = provider.security_auth_info().await.unwrap();
        assert_eq!(token.expiration, Timestamp::from_unix_secs(500));
    }
}
