//! Callback categories a host can register.
//!
//! [`ApiCallbacks`] form a chain: every registered implementation that
//! supplies a call is invoked in order. Stream, producer and platform
//! callbacks are aggregate categories: per operation the first registration
//! supplying it wins, and a built-in default covers the rest.

use std::time::Duration;

use tracing::{debug, warn};
use vidingest_auth::{Clock, SystemClock, Timestamp};

use crate::chain::{AggregateSlot, CallbackResult, ChainFlow, OpSet, Operation};
use crate::error::ClientResult;
use crate::service::{
    ApiCall, CreateStreamRequest, PutStreamRequest, ServiceCallContext, ServiceCallResult,
    UploadHandle,
};

/// Version an [`ApiCallbacks`] implementation must report.
pub const API_CALLBACKS_CURRENT_VERSION: u32 = 0;
/// Version a [`StreamCallbacks`] implementation must report.
pub const STREAM_CALLBACKS_CURRENT_VERSION: u32 = 0;
/// Version a [`ProducerCallbacks`] implementation must report.
pub const PRODUCER_CALLBACKS_CURRENT_VERSION: u32 = 0;
/// Version a [`PlatformCallbacks`] implementation must report.
pub const PLATFORM_CALLBACKS_CURRENT_VERSION: u32 = 0;

/// Remote-call implementations.
///
/// Each method starts the call and returns immediately; the outcome is
/// delivered later through `ctx.deliver`. The return value only steers the
/// chain. Only the calls listed in [`supported_calls`](Self::supported_calls)
/// are ever invoked.
pub trait ApiCallbacks: Send + Sync {
    /// Structure version; registration rejects anything else.
    fn version(&self) -> u32 {
        API_CALLBACKS_CURRENT_VERSION
    }

    /// Calls this implementation supplies.
    fn supported_calls(&self) -> OpSet<ApiCall>;

    /// Looks up an existing stream.
    fn describe_stream(&self, stream_name: &str, ctx: &ServiceCallContext) -> CallbackResult {
        let _ = (stream_name, ctx);
        Ok(ChainFlow::Continue)
    }

    /// Creates the stream on the service.
    fn create_stream(&self, request: &CreateStreamRequest, ctx: &ServiceCallContext) -> CallbackResult {
        let _ = (request, ctx);
        Ok(ChainFlow::Continue)
    }

    /// Applies the configured tags to the stream.
    fn tag_resource(
        &self,
        stream_name: &str,
        tags: &[(String, String)],
        ctx: &ServiceCallContext,
    ) -> CallbackResult {
        let _ = (stream_name, tags, ctx);
        Ok(ChainFlow::Continue)
    }

    /// Resolves the upload endpoint for the stream.
    fn get_streaming_endpoint(&self, stream_name: &str, ctx: &ServiceCallContext) -> CallbackResult {
        let _ = (stream_name, ctx);
        Ok(ChainFlow::Continue)
    }

    /// Opens one upload session.
    fn put_stream(&self, request: &PutStreamRequest, ctx: &ServiceCallContext) -> CallbackResult {
        let _ = (request, ctx);
        Ok(ChainFlow::Continue)
    }

    /// Called once when the owning provider is freed.
    fn release(&self) {}
}

/// Operations of [`StreamCallbacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    /// The stream reached the uploading state for the first time.
    StreamReady,
    /// An upload session or the whole stream closed.
    StreamClosed,
    /// A terminal or per-session failure.
    StreamError,
    /// No acknowledgement within the staleness window.
    ConnectionStale,
    /// Buffered duration exceeded the latency ceiling.
    LatencyPressure,
    /// A frame was dropped.
    DroppedFrame,
    /// A fragment was dropped.
    DroppedFragment,
    /// An acknowledgement arrived for an uploaded fragment.
    FragmentAck,
}

impl Operation for StreamEvent {
    const ALL: &'static [Self] = &[
        StreamEvent::StreamReady,
        StreamEvent::StreamClosed,
        StreamEvent::StreamError,
        StreamEvent::ConnectionStale,
        StreamEvent::LatencyPressure,
        StreamEvent::DroppedFrame,
        StreamEvent::DroppedFragment,
        StreamEvent::FragmentAck,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Stage reported by a [`FragmentAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentAckKind {
    /// The service started buffering the fragment.
    Buffering,
    /// The fragment was fully received.
    Received,
    /// The fragment was durably stored.
    Persisted,
    /// The service failed to ingest the fragment.
    Error,
}

/// Acknowledgement of one uploaded fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentAck {
    /// Stage being acknowledged.
    pub kind: FragmentAckKind,
    /// Timestamp of the fragment being acknowledged.
    pub timestamp: Timestamp,
    /// `Ok` unless `kind` is `Error`.
    pub result: ServiceCallResult,
}

impl FragmentAck {
    /// Successful acknowledgement of the given stage.
    pub fn new(kind: FragmentAckKind, timestamp: Timestamp) -> Self {
        Self {
            kind,
            timestamp,
            result: ServiceCallResult::Ok,
        }
    }

    /// Error acknowledgement carrying the failure.
    pub fn error(timestamp: Timestamp, result: ServiceCallResult) -> Self {
        Self {
            kind: FragmentAckKind::Error,
            timestamp,
            result,
        }
    }
}

/// Stream lifecycle notifications raised toward the host.
pub trait StreamCallbacks: Send + Sync {
    /// Structure version; registration rejects anything else.
    fn version(&self) -> u32 {
        STREAM_CALLBACKS_CURRENT_VERSION
    }

    /// Events this implementation handles.
    fn supported_events(&self) -> OpSet<StreamEvent>;

    /// The stream is uploading.
    fn stream_ready(&self, stream_name: &str) -> ClientResult<()> {
        let _ = stream_name;
        Ok(())
    }

    /// A session closed, or the stream when `session` is `None`.
    fn stream_closed(&self, stream_name: &str, session: Option<UploadHandle>) -> ClientResult<()> {
        let _ = (stream_name, session);
        Ok(())
    }

    /// Terminal failure, or a failure of one upload session.
    fn stream_error(
        &self,
        stream_name: &str,
        session: Option<UploadHandle>,
        result: ServiceCallResult,
    ) -> ClientResult<()> {
        let _ = (stream_name, session, result);
        Ok(())
    }

    /// No acknowledgement arrived for `since_last_ack`.
    fn connection_stale(&self, stream_name: &str, since_last_ack: Duration) -> ClientResult<()> {
        let _ = (stream_name, since_last_ack);
        Ok(())
    }

    /// `throttle` asks the host to slow down production.
    fn latency_pressure(
        &self,
        stream_name: &str,
        buffer_duration: Duration,
        throttle: bool,
    ) -> ClientResult<()> {
        let _ = (stream_name, buffer_duration, throttle);
        Ok(())
    }

    /// A frame was dropped before upload.
    fn dropped_frame(&self, stream_name: &str, timestamp: Timestamp) -> ClientResult<()> {
        let _ = (stream_name, timestamp);
        Ok(())
    }

    /// A fragment was dropped before upload.
    fn dropped_fragment(&self, stream_name: &str, timestamp: Timestamp) -> ClientResult<()> {
        let _ = (stream_name, timestamp);
        Ok(())
    }

    /// The service acknowledged a fragment of `session`.
    fn fragment_ack(
        &self,
        stream_name: &str,
        session: UploadHandle,
        ack: &FragmentAck,
    ) -> ClientResult<()> {
        let _ = (stream_name, session, ack);
        Ok(())
    }

    /// Called once when the owning provider is freed.
    fn release(&self) {}
}

/// Operations of [`ProducerCallbacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerEvent {
    /// The client finished starting.
    ClientReady,
    /// Content storage is running out.
    StorageOverflowPressure,
    /// The client shut down.
    ClientShutdown,
    /// One stream finished shutting down.
    StreamShutdown,
}

impl Operation for ProducerEvent {
    const ALL: &'static [Self] = &[
        ProducerEvent::ClientReady,
        ProducerEvent::StorageOverflowPressure,
        ProducerEvent::ClientShutdown,
        ProducerEvent::StreamShutdown,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Client lifecycle notifications raised toward the host.
pub trait ProducerCallbacks: Send + Sync {
    /// Structure version; registration rejects anything else.
    fn version(&self) -> u32 {
        PRODUCER_CALLBACKS_CURRENT_VERSION
    }

    /// Events this implementation handles.
    fn supported_events(&self) -> OpSet<ProducerEvent>;

    /// The client is ready to create streams.
    fn client_ready(&self) -> ClientResult<()> {
        Ok(())
    }

    /// Only `remaining_bytes` of storage are left.
    fn storage_overflow_pressure(&self, remaining_bytes: u64) -> ClientResult<()> {
        let _ = remaining_bytes;
        Ok(())
    }

    /// The client has shut down.
    fn client_shutdown(&self) -> ClientResult<()> {
        Ok(())
    }

    /// The named stream has shut down.
    fn stream_shutdown(&self, stream_name: &str) -> ClientResult<()> {
        let _ = stream_name;
        Ok(())
    }

    /// Called once when the owning provider is freed.
    fn release(&self) {}
}

/// Operations of [`PlatformCallbacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCall {
    /// Wall-clock reads.
    CurrentTime,
    /// Random number generation.
    Random,
}

impl Operation for PlatformCall {
    const ALL: &'static [Self] = &[PlatformCall::CurrentTime, PlatformCall::Random];

    fn index(self) -> usize {
        self as usize
    }
}

/// Primitives the runtime takes from its host platform.
pub trait PlatformCallbacks: Send + Sync {
    /// Structure version; registration rejects anything else.
    fn version(&self) -> u32 {
        PLATFORM_CALLBACKS_CURRENT_VERSION
    }

    /// Primitives this implementation supplies.
    fn supported_calls(&self) -> OpSet<PlatformCall>;

    /// Current wall-clock time.
    fn current_time(&self) -> Timestamp {
        SystemClock.now()
    }

    /// Uniformly random 32-bit value.
    fn random_u32(&self) -> u32 {
        rand::random()
    }

    /// Called once when the owning provider is freed.
    fn release(&self) {}
}

pub(crate) struct NoopStreamCallbacks;

impl StreamCallbacks for NoopStreamCallbacks {
    fn supported_events(&self) -> OpSet<StreamEvent> {
        OpSet::all()
    }
}

pub(crate) struct NoopProducerCallbacks;

impl ProducerCallbacks for NoopProducerCallbacks {
    fn supported_events(&self) -> OpSet<ProducerEvent> {
        OpSet::all()
    }
}

/// System clock and `rand`.
pub struct DefaultPlatform;

impl PlatformCallbacks for DefaultPlatform {
    fn supported_calls(&self) -> OpSet<PlatformCall> {
        OpSet::all()
    }
}

static NOOP_STREAM: NoopStreamCallbacks = NoopStreamCallbacks;
static NOOP_PRODUCER: NoopProducerCallbacks = NoopProducerCallbacks;

fn report(event: &str, result: ClientResult<()>) {
    if let Err(err) = result {
        warn!(event, error = %err, "event callback failed");
    }
}

/// Raises stream events through the resolved stream slot.
///
/// Handler failures are logged and never change the caller's control flow.
pub struct StreamEvents<'a> {
    slot: &'a AggregateSlot<dyn StreamCallbacks, StreamEvent>,
}

impl<'a> StreamEvents<'a> {
    pub(crate) fn new(slot: &'a AggregateSlot<dyn StreamCallbacks, StreamEvent>) -> Self {
        Self { slot }
    }

    fn target(&self, event: StreamEvent) -> &'a dyn StreamCallbacks {
        self.slot.resolve_or(event, &NOOP_STREAM)
    }

    /// Raises [`StreamEvent::StreamReady`].
    pub fn stream_ready(&self, stream_name: &str) {
        debug!(stream = %stream_name, "stream ready");
        report(
            "stream_ready",
            self.target(StreamEvent::StreamReady).stream_ready(stream_name),
        );
    }

    /// Raises [`StreamEvent::StreamClosed`].
    pub fn stream_closed(&self, stream_name: &str, session: Option<UploadHandle>) {
        report(
            "stream_closed",
            self.target(StreamEvent::StreamClosed)
                .stream_closed(stream_name, session),
        );
    }

    /// Raises [`StreamEvent::StreamError`].
    pub fn stream_error(
        &self,
        stream_name: &str,
        session: Option<UploadHandle>,
        result: ServiceCallResult,
    ) {
        report(
            "stream_error",
            self.target(StreamEvent::StreamError)
                .stream_error(stream_name, session, result),
        );
    }

    /// Raises [`StreamEvent::ConnectionStale`].
    pub fn connection_stale(&self, stream_name: &str, since_last_ack: Duration) {
        report(
            "connection_stale",
            self.target(StreamEvent::ConnectionStale)
                .connection_stale(stream_name, since_last_ack),
        );
    }

    /// Raises [`StreamEvent::LatencyPressure`].
    pub fn latency_pressure(&self, stream_name: &str, buffer_duration: Duration, throttle: bool) {
        report(
            "latency_pressure",
            self.target(StreamEvent::LatencyPressure).latency_pressure(
                stream_name,
                buffer_duration,
                throttle,
            ),
        );
    }

    /// Raises [`StreamEvent::DroppedFrame`].
    pub fn dropped_frame(&self, stream_name: &str, timestamp: Timestamp) {
        report(
            "dropped_frame",
            self.target(StreamEvent::DroppedFrame)
                .dropped_frame(stream_name, timestamp),
        );
    }

    /// Raises [`StreamEvent::DroppedFragment`].
    pub fn dropped_fragment(&self, stream_name: &str, timestamp: Timestamp) {
        report(
            "dropped_fragment",
            self.target(StreamEvent::DroppedFragment)
                .dropped_fragment(stream_name, timestamp),
        );
    }

    /// Raises [`StreamEvent::FragmentAck`].
    pub fn fragment_ack(&self, stream_name: &str, session: UploadHandle, ack: &FragmentAck) {
        report(
            "fragment_ack",
            self.target(StreamEvent::FragmentAck)
                .fragment_ack(stream_name, session, ack),
        );
    }
}

/// Raises producer events through the resolved producer slot.
pub struct ProducerEvents<'a> {
    slot: &'a AggregateSlot<dyn ProducerCallbacks, ProducerEvent>,
}

impl<'a> ProducerEvents<'a> {
    pub(crate) fn new(slot: &'a AggregateSlot<dyn ProducerCallbacks, ProducerEvent>) -> Self {
        Self { slot }
    }

    fn target(&self, event: ProducerEvent) -> &'a dyn ProducerCallbacks {
        self.slot.resolve_or(event, &NOOP_PRODUCER)
    }

    /// Raises [`ProducerEvent::ClientReady`].
    pub fn client_ready(&self) {
        report(
            "client_ready",
            self.target(ProducerEvent::ClientReady).client_ready(),
        );
    }

    /// Raises [`ProducerEvent::StorageOverflowPressure`].
    pub fn storage_overflow_pressure(&self, remaining_bytes: u64) {
        report(
            "storage_overflow_pressure",
            self.target(ProducerEvent::StorageOverflowPressure)
                .storage_overflow_pressure(remaining_bytes),
        );
    }

    /// Raises [`ProducerEvent::ClientShutdown`].
    pub fn client_shutdown(&self) {
        report(
            "client_shutdown",
            self.target(ProducerEvent::ClientShutdown).client_shutdown(),
        );
    }

    /// Raises [`ProducerEvent::StreamShutdown`].
    pub fn stream_shutdown(&self, stream_name: &str) {
        report(
            "stream_shutdown",
            self.target(ProducerEvent::StreamShutdown)
                .stream_shutdown(stream_name),
        );
    }
}
