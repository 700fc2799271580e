//! Remote-call vocabulary shared by the API callback chain and the
//! service-call state machine.
//!
//! A call goes out through the registered API chain with a
//! [`ServiceCallContext`]; its outcome comes back later as a
//! [`CallResultEvent`] delivered to the context's result sink.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;
use vidingest_auth::{AuthToken, Timestamp};

use crate::chain::Operation;

/// How long a call may take to deliver its result.
pub const SERVICE_CALL_DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Retries allowed after the first attempt in bounded mode.
pub const SERVICE_CALL_MAX_RETRY_COUNT: u32 = 5;

/// HTTP-like outcome classification of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCallResult {
    /// Success.
    Ok,
    /// Malformed request; never retried.
    BadRequest,
    /// Credentials rejected.
    NotAuthorized,
    /// Credentials lack permission.
    Forbidden,
    /// The stream does not exist.
    ResourceNotFound,
    /// Invalid input; never retried.
    InvalidArg,
    /// No result within the call timeout.
    RequestTimeout,
    /// Service-side failure.
    InternalError,
    /// No registered implementation supplies the call.
    NotImplemented,
    /// Upstream timeout.
    GatewayTimeout,
    /// Read timed out on an established connection.
    NetworkReadTimeout,
    /// Connection could not be established in time.
    NetworkConnectionTimeout,
    /// Account device limit reached.
    DeviceLimit,
    /// Account stream limit reached.
    StreamLimit,
    /// The stream exists but is not ready for use.
    ResourceInUse,
    /// Any code not listed here.
    Unknown,
    /// The stream has been or is being deleted.
    ResourceDeleted,
}

impl ServiceCallResult {
    /// Numeric wire code.
    pub fn code(self) -> u32 {
        match self {
            ServiceCallResult::Ok => 200,
            ServiceCallResult::BadRequest => 400,
            ServiceCallResult::NotAuthorized => 401,
            ServiceCallResult::Forbidden => 403,
            ServiceCallResult::ResourceNotFound => 404,
            ServiceCallResult::InvalidArg => 406,
            ServiceCallResult::RequestTimeout => 408,
            ServiceCallResult::InternalError => 500,
            ServiceCallResult::NotImplemented => 501,
            ServiceCallResult::GatewayTimeout => 504,
            ServiceCallResult::NetworkReadTimeout => 598,
            ServiceCallResult::NetworkConnectionTimeout => 599,
            ServiceCallResult::DeviceLimit => 10001,
            ServiceCallResult::StreamLimit => 10002,
            ServiceCallResult::ResourceInUse => 10003,
            ServiceCallResult::Unknown => 10006,
            ServiceCallResult::ResourceDeleted => 10400,
        }
    }

    /// Whether this is [`ServiceCallResult::Ok`].
    pub fn is_ok(self) -> bool {
        self == ServiceCallResult::Ok
    }

    /// Any of the request, gateway or network timeouts.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            ServiceCallResult::RequestTimeout
                | ServiceCallResult::GatewayTimeout
                | ServiceCallResult::NetworkReadTimeout
                | ServiceCallResult::NetworkConnectionTimeout
        )
    }

    /// Credentials rejected or insufficient.
    pub fn is_auth_failure(self) -> bool {
        matches!(
            self,
            ServiceCallResult::NotAuthorized | ServiceCallResult::Forbidden
        )
    }
}

impl From<u32> for ServiceCallResult {
    fn from(code: u32) -> Self {
        match code {
            200 => ServiceCallResult::Ok,
            400 => ServiceCallResult::BadRequest,
            401 => ServiceCallResult::NotAuthorized,
            403 => ServiceCallResult::Forbidden,
            404 => ServiceCallResult::ResourceNotFound,
            406 => ServiceCallResult::InvalidArg,
            408 => ServiceCallResult::RequestTimeout,
            500 => ServiceCallResult::InternalError,
            501 => ServiceCallResult::NotImplemented,
            504 => ServiceCallResult::GatewayTimeout,
            598 => ServiceCallResult::NetworkReadTimeout,
            599 => ServiceCallResult::NetworkConnectionTimeout,
            10001 => ServiceCallResult::DeviceLimit,
            10002 => ServiceCallResult::StreamLimit,
            10003 => ServiceCallResult::ResourceInUse,
            10400 => ServiceCallResult::ResourceDeleted,
            _ => ServiceCallResult::Unknown,
        }
    }
}

impl From<ServiceCallResult> for u32 {
    fn from(result: ServiceCallResult) -> Self {
        result.code()
    }
}

/// The remote calls a stream needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    /// Look up the stream.
    DescribeStream,
    /// Create the stream.
    CreateStream,
    /// Apply tags to the stream.
    TagResource,
    /// Resolve the data-plane endpoint.
    GetStreamingEndpoint,
    /// Open an upload session.
    PutStream,
}

impl Operation for ApiCall {
    const ALL: &'static [Self] = &[
        ApiCall::DescribeStream,
        ApiCall::CreateStream,
        ApiCall::TagResource,
        ApiCall::GetStreamingEndpoint,
        ApiCall::PutStream,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Identifier of one upload session opened by `PutStream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadHandle(pub u64);

impl fmt::Display for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload-{}", self.0)
    }
}

/// Lifecycle status reported by `DescribeStream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamStatus {
    /// Being created.
    Creating,
    /// Ready for use.
    #[default]
    Active,
    /// Being reconfigured.
    Updating,
    /// Being deleted.
    Deleting,
}

impl StreamStatus {
    /// How a successful describe of a stream in this status is treated:
    /// only an active stream may proceed, a deleting one is gone, anything
    /// else is still settling and is described again.
    pub fn describe_result(self) -> ServiceCallResult {
        match self {
            StreamStatus::Active => ServiceCallResult::Ok,
            StreamStatus::Deleting => ServiceCallResult::ResourceDeleted,
            StreamStatus::Creating | StreamStatus::Updating => ServiceCallResult::ResourceInUse,
        }
    }
}

/// What `DescribeStream` reports about an existing stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamDescription {
    /// Stream name.
    pub stream_name: String,
    /// Resource name, when reported.
    pub stream_arn: Option<String>,
    /// Lifecycle status.
    pub status: StreamStatus,
    /// Data retention, zero for none.
    pub retention_hours: u32,
}

/// Call-specific data returned with a result event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CallPayload {
    /// No data.
    #[default]
    None,
    /// Result of `DescribeStream`.
    Description(StreamDescription),
    /// Result of `GetStreamingEndpoint`.
    Endpoint(String),
}

/// Asynchronous outcome of one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResultEvent {
    /// Outcome code.
    pub result: ServiceCallResult,
    /// Call-specific data.
    pub payload: CallPayload,
}

impl CallResultEvent {
    /// Event with `result` and no payload.
    pub fn new(result: ServiceCallResult) -> Self {
        Self {
            result,
            payload: CallPayload::None,
        }
    }

    /// Successful event carrying `payload`.
    pub fn ok(payload: CallPayload) -> Self {
        Self {
            result: ServiceCallResult::Ok,
            payload,
        }
    }
}

/// Receiver of call result events.
pub trait CallResultSink: Send + Sync {
    /// Accept the result of the call.
    fn deliver(&self, event: CallResultEvent);
}

/// Sink that completes a oneshot; only the first delivery counts.
pub(crate) struct PendingResult {
    tx: Mutex<Option<oneshot::Sender<CallResultEvent>>>,
}

impl PendingResult {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<CallResultEvent>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl CallResultSink for PendingResult {
    fn deliver(&self, event: CallResultEvent) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(event);
        }
    }
}

/// Sink for fire-and-forget calls: results are only logged.
pub(crate) struct LoggedResult {
    pub(crate) call: ApiCall,
    pub(crate) stream_name: String,
}

impl CallResultSink for LoggedResult {
    fn deliver(&self, event: CallResultEvent) {
        debug!(stream = %self.stream_name, call = ?self.call, result = ?event.result, "fire-and-forget call completed");
    }
}

/// Everything an API callback needs to perform one call.
#[derive(Clone)]
pub struct ServiceCallContext {
    /// Correlation id for logs.
    pub call_id: Uuid,
    /// Auth material to sign the call with.
    pub auth: AuthToken,
    /// How long the caller waits for the result.
    pub timeout: Duration,
    /// Earliest instant the call should be executed.
    pub call_after: Timestamp,
    /// Where the result must be delivered.
    pub result_sink: Arc<dyn CallResultSink>,
}

impl ServiceCallContext {
    /// Deliver `event` to the result sink.
    pub fn deliver(&self, event: CallResultEvent) {
        self.result_sink.deliver(event);
    }
}

impl fmt::Debug for ServiceCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCallContext")
            .field("call_id", &self.call_id)
            .field("auth", &self.auth)
            .field("timeout", &self.timeout)
            .field("call_after", &self.call_after)
            .finish()
    }
}

/// Arguments of `CreateStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateStreamRequest {
    /// Stream name.
    pub stream_name: String,
    /// Device name; the device fingerprint when none is configured.
    pub device_name: String,
    /// MIME type of the media.
    pub content_type: String,
    /// Encryption key, service default when `None`.
    pub kms_key_id: Option<String>,
    /// Data retention, zero for none.
    pub retention_hours: u32,
}

/// Arguments of `PutStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutStreamRequest {
    /// Stream name.
    pub stream_name: String,
    /// Data-plane endpoint from `GetStreamingEndpoint`.
    pub endpoint: String,
    /// Handle of the session being opened.
    pub session: UploadHandle,
    /// Token authorizing the upload.
    pub streaming_token: AuthToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes() {
        for result in [
            ServiceCallResult::Ok,
            ServiceCallResult::NotAuthorized,
            ServiceCallResult::NetworkConnectionTimeout,
            ServiceCallResult::StreamLimit,
            ServiceCallResult::ResourceDeleted,
        ] {
            assert_eq!(ServiceCallResult::from(result.code()), result);
        }
        assert_eq!(ServiceCallResult::from(12345), ServiceCallResult::Unknown);
        assert_eq!(u32::from(ServiceCallResult::GatewayTimeout), 504);
    }

    #[test]
    fn test_classification_helpers() {
        assert!(ServiceCallResult::RequestTimeout.is_timeout());
        assert!(ServiceCallResult::NetworkReadTimeout.is_timeout());
        assert!(!ServiceCallResult::NotAuthorized.is_timeout());
        assert!(ServiceCallResult::Forbidden.is_auth_failure());
        assert!(!ServiceCallResult::InvalidArg.is_auth_failure());
    }

    #[tokio::test]
    async fn test_pending_result_first_delivery_wins() {
        let (sink, rx) = PendingResult::new();
        sink.deliver(CallResultEvent::new(ServiceCallResult::NotAuthorized));
        sink.deliver(CallResultEvent::ok(CallPayload::None));
        let event = rx.await.unwrap();
        assert_eq!(event.result, ServiceCallResult::NotAuthorized);
    }

    #[tokio::test]
    async fn test_pending_result_dropped_without_delivery() {
        let (sink, rx) = PendingResult::new();
        drop(sink);
        assert!(rx.await.is_err());
    }
}
