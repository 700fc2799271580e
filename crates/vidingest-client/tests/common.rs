//! Common fixtures for client integration tests: a scriptable remote
//! service, a recording event sink and a platform clock driven by tokio time.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use vidingest_auth::{
    AccessMode, AuthCapabilities, AuthProvider, AuthResult, AuthToken, StreamingTokenSink,
    Timestamp,
};
use vidingest_client::{
    ApiCall, ApiCallbacks, BackoffSettings, CallPayload, CallResultEvent, CallbackResult,
    CallbacksProvider, ChainFlow, ClientConfig, ClientResult, CreateStreamRequest, HealthSettings,
    OpSet, PlatformCall, PlatformCallbacks, PutStreamRequest, ServiceCallContext,
    ServiceCallResult, StreamCallbacks, StreamDescription, StreamEvent, StreamStatus, UploadHandle,
};

pub const START_UNIX_SECS: u64 = 1_700_000_000;

/// Platform time that advances with tokio's (possibly paused) clock.
pub struct TokioClock {
    origin: tokio::time::Instant,
    base: Timestamp,
}

impl TokioClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
            base: Timestamp::from_unix_secs(START_UNIX_SECS),
        })
    }
}

impl PlatformCallbacks for TokioClock {
    fn supported_calls(&self) -> OpSet<PlatformCall> {
        OpSet::of(&[PlatformCall::CurrentTime])
    }

    fn current_time(&self) -> Timestamp {
        self.base.saturating_add(self.origin.elapsed())
    }
}

/// In-process stand-in for the remote service.
///
/// Each call answers from its script first, then from its default result.
/// Silenced calls never deliver a result.
#[derive(Default)]
pub struct FakeService {
    scripts: Mutex<HashMap<ApiCall, VecDeque<ServiceCallResult>>>,
    defaults: Mutex<HashMap<ApiCall, ServiceCallResult>>,
    silenced: Mutex<Vec<ApiCall>>,
    statuses: Mutex<VecDeque<StreamStatus>>,
    default_status: Mutex<StreamStatus>,
    calls: Mutex<HashMap<ApiCall, u32>>,
    creates: Mutex<Vec<CreateStreamRequest>>,
    puts: Mutex<Vec<PutStreamRequest>>,
    tags: Mutex<Vec<Vec<(String, String)>>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the next calls with `results`, in order.
    pub fn script(&self, call: ApiCall, results: impl IntoIterator<Item = ServiceCallResult>) {
        self.scripts
            .lock()
            .entry(call)
            .or_default()
            .extend(results);
    }

    pub fn fail_always(&self, call: ApiCall, result: ServiceCallResult) {
        self.defaults.lock().insert(call, result);
    }

    /// Report `statuses` from the next successful describes, in order.
    pub fn script_status(&self, statuses: impl IntoIterator<Item = StreamStatus>) {
        self.statuses.lock().extend(statuses);
    }

    pub fn status_always(&self, status: StreamStatus) {
        *self.default_status.lock() = status;
    }

    pub fn silence(&self, call: ApiCall) {
        self.silenced.lock().push(call);
    }

    pub fn calls(&self, call: ApiCall) -> u32 {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    pub fn creates(&self) -> Vec<CreateStreamRequest> {
        self.creates.lock().clone()
    }

    pub fn puts(&self) -> Vec<PutStreamRequest> {
        self.puts.lock().clone()
    }

    pub fn tags(&self) -> Vec<Vec<(String, String)>> {
        self.tags.lock().clone()
    }

    fn answer(&self, call: ApiCall, stream_name: &str, ctx: &ServiceCallContext) -> CallbackResult {
        *self.calls.lock().entry(call).or_insert(0) += 1;
        if self.silenced.lock().contains(&call) {
            return Ok(ChainFlow::Continue);
        }
        let result = self
            .scripts
            .lock()
            .get_mut(&call)
            .and_then(|queue| queue.pop_front())
            .or_else(|| self.defaults.lock().get(&call).copied())
            .unwrap_or(ServiceCallResult::Ok);

        let payload = match (call, result) {
            (ApiCall::DescribeStream, ServiceCallResult::Ok) => {
                let status = self
                    .statuses
                    .lock()
                    .pop_front()
                    .unwrap_or(*self.default_status.lock());
                CallPayload::Description(StreamDescription {
                    stream_name: stream_name.to_string(),
                    stream_arn: Some(format!("arn:test:stream/{stream_name}")),
                    status,
                    retention_hours: 0,
                })
            }
            (ApiCall::GetStreamingEndpoint, ServiceCallResult::Ok) => {
                CallPayload::Endpoint("https://ingest.test".to_string())
            }
            _ => CallPayload::None,
        };
        ctx.deliver(CallResultEvent { result, payload });
        Ok(ChainFlow::Continue)
    }
}

impl ApiCallbacks for FakeService {
    fn supported_calls(&self) -> OpSet<ApiCall> {
        OpSet::all()
    }

    fn describe_stream(&self, stream_name: &str, ctx: &ServiceCallContext) -> CallbackResult {
        self.answer(ApiCall::DescribeStream, stream_name, ctx)
    }

    fn create_stream(&self, request: &CreateStreamRequest, ctx: &ServiceCallContext) -> CallbackResult {
        self.creates.lock().push(request.clone());
        self.answer(ApiCall::CreateStream, &request.stream_name, ctx)
    }

    fn tag_resource(
        &self,
        stream_name: &str,
        tags: &[(String, String)],
        ctx: &ServiceCallContext,
    ) -> CallbackResult {
        self.tags.lock().push(tags.to_vec());
        self.answer(ApiCall::TagResource, stream_name, ctx)
    }

    fn get_streaming_endpoint(&self, stream_name: &str, ctx: &ServiceCallContext) -> CallbackResult {
        self.answer(ApiCall::GetStreamingEndpoint, stream_name, ctx)
    }

    fn put_stream(&self, request: &PutStreamRequest, ctx: &ServiceCallContext) -> CallbackResult {
        self.puts.lock().push(request.clone());
        self.answer(ApiCall::PutStream, &request.stream_name, ctx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Ready(String),
    Closed(String),
    Error(String, Option<UploadHandle>, ServiceCallResult),
    Stale(String),
    Latency(String, bool),
}

#[derive(Default)]
pub struct RecordingStreamCallbacks {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingStreamCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn count(&self, f: impl Fn(&Recorded) -> bool) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }

    fn push(&self, event: Recorded) -> ClientResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

impl StreamCallbacks for RecordingStreamCallbacks {
    fn supported_events(&self) -> OpSet<StreamEvent> {
        OpSet::of(&[
            StreamEvent::StreamReady,
            StreamEvent::StreamClosed,
            StreamEvent::StreamError,
            StreamEvent::ConnectionStale,
            StreamEvent::LatencyPressure,
        ])
    }

    fn stream_ready(&self, stream_name: &str) -> ClientResult<()> {
        self.push(Recorded::Ready(stream_name.to_string()))
    }

    fn stream_closed(&self, stream_name: &str, _session: Option<UploadHandle>) -> ClientResult<()> {
        self.push(Recorded::Closed(stream_name.to_string()))
    }

    fn stream_error(
        &self,
        stream_name: &str,
        session: Option<UploadHandle>,
        result: ServiceCallResult,
    ) -> ClientResult<()> {
        self.push(Recorded::Error(stream_name.to_string(), session, result))
    }

    fn connection_stale(&self, stream_name: &str, _since_last_ack: Duration) -> ClientResult<()> {
        self.push(Recorded::Stale(stream_name.to_string()))
    }

    fn latency_pressure(
        &self,
        stream_name: &str,
        _buffer_duration: Duration,
        throttle: bool,
    ) -> ClientResult<()> {
        self.push(Recorded::Latency(stream_name.to_string(), throttle))
    }
}

/// Counts streaming-token requests on the way to a real provider.
pub struct CountingAuth {
    inner: Arc<dyn AuthProvider>,
    pub streaming_tokens: AtomicU32,
}

impl CountingAuth {
    pub fn new(inner: Arc<dyn AuthProvider>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            streaming_tokens: AtomicU32::new(0),
        })
    }

    pub fn streaming_token_count(&self) -> u32 {
        self.streaming_tokens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for CountingAuth {
    fn capabilities(&self) -> AuthCapabilities {
        self.inner.capabilities()
    }

    async fn get_streaming_token(
        &self,
        stream_name: &str,
        access_mode: AccessMode,
        sink: Arc<dyn StreamingTokenSink>,
    ) -> AuthResult<()> {
        self.streaming_tokens.fetch_add(1, Ordering::SeqCst);
        self.inner
            .get_streaming_token(stream_name, access_mode, sink)
            .await
    }

    async fn get_security_token(&self) -> AuthResult<AuthToken> {
        self.inner.get_security_token().await
    }

    fn release(&self) {
        self.inner.release();
    }
}

/// Client config with deterministic backoff and the health monitor off.
pub fn test_config(continuous_retry: bool) -> ClientConfig {
    ClientConfig {
        continuous_retry,
        backoff: BackoffSettings {
            jitter: false,
            ..Default::default()
        },
        health: HealthSettings {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Provider wired to `service`, `events` and a tokio-driven clock.
pub fn provider(
    service: &Arc<FakeService>,
    events: &Arc<RecordingStreamCallbacks>,
) -> CallbacksProvider {
    configured_provider(&ClientConfig::default(), service, events)
}

/// Like [`provider`], with the API chain sized from `config`.
pub fn configured_provider(
    config: &ClientConfig,
    service: &Arc<FakeService>,
    events: &Arc<RecordingStreamCallbacks>,
) -> CallbacksProvider {
    let mut provider = CallbacksProvider::from_config(config).unwrap();
    provider.register_api_callbacks(service.clone()).unwrap();
    provider.register_stream_callbacks(events.clone()).unwrap();
    provider.register_platform_callbacks(TokioClock::new()).unwrap();
    provider
}
