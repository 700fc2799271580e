//! Per-stream sequencing of remote calls.
//!
//! [`ServiceCallStateMachine::start`] spawns one task per stream that walks
//! describe, create, tag, endpoint resolution and upload, consulting the
//! injected [`RetryPolicy`] on every failure. The host and the health monitor
//! talk to the task through a cloneable [`StreamController`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vidingest_auth::provider::{
    MIN_STREAMING_TOKEN_EXPIRATION_DURATION, STREAMING_TOKEN_EXPIRATION_GRACE_PERIOD,
};
use vidingest_auth::{
    AccessMode, AuthCapability, AuthResult, AuthToken, AuthTokenKind, StreamingTokenSink,
    Timestamp,
};

use crate::callbacks::{FragmentAck, FragmentAckKind};
use crate::chain::ChainInvocation;
use crate::config::StreamConfig;
use crate::health::StreamHealth;
use crate::provider::CallbacksProvider;
use crate::retry::{classify, route_upload_failure, FailureClass, RetryDecision, RetryPolicy, UploadRecovery};
use crate::service::{
    ApiCall, CallPayload, CallResultEvent, CreateStreamRequest, LoggedResult, PendingResult,
    PutStreamRequest, ServiceCallContext, ServiceCallResult, UploadHandle,
};

/// Where a stream is in its control-plane lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCallState {
    /// Created, not yet started.
    Idle,
    /// Looking up the stream.
    DescribingResource,
    /// Creating the missing stream.
    CreatingResource,
    /// Applying configured tags.
    Tagging,
    /// Resolving the upload endpoint.
    ResolvingEndpoint,
    /// An upload session is open.
    Uploading,
    /// Stopping; `stream_closed` is raised next.
    Closing,
    /// Raising `stream_error` before restarting or failing.
    Erroring,
    /// Stopped on request.
    Closed,
    /// Gave up after a terminal or exhausted failure.
    Failed,
}

impl ServiceCallState {
    /// Whether the stream task has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceCallState::Closed | ServiceCallState::Failed)
    }
}

impl fmt::Display for ServiceCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-stream knobs taken from the client configuration.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Completion timeout of each control-plane call.
    pub service_call_timeout: Duration,
    /// Policy for retriable call failures.
    pub retry: Arc<dyn RetryPolicy>,
    /// Staleness window for the health monitor.
    pub connection_staleness: Duration,
    /// Latency ceiling for the health monitor.
    pub max_latency: Duration,
}

#[derive(Debug)]
enum Command {
    ResetConnection,
    UploadTerminated {
        session: UploadHandle,
        result: ServiceCallResult,
    },
    FragmentAck {
        session: UploadHandle,
        ack: FragmentAck,
    },
}

/// Handle to one running stream.
#[derive(Clone)]
pub struct StreamController {
    name: Arc<str>,
    state: watch::Receiver<ServiceCallState>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    health: Arc<StreamHealth>,
    provider: Arc<CallbacksProvider>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StreamController {
    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> ServiceCallState {
        *self.state.borrow()
    }

    /// Wait until the stream is in `target` or has terminated, returning the
    /// state it was found in.
    pub async fn wait_for_state(&self, target: ServiceCallState) -> ServiceCallState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s);
        match reached {
            Ok(s) => s,
            Err(_) => *state.borrow(),
        }
    }

    /// Ask the stream to close. Backoff waits end immediately; an in-flight
    /// call is allowed to finish.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Recycle the upload session: resolve the endpoint again and open a new
    /// session. Ignored unless the stream is uploading.
    pub fn reset_connection(&self) {
        let _ = self.commands.send(Command::ResetConnection);
    }

    /// Report the end of an upload session opened by `put_stream`.
    pub fn upload_terminated(&self, session: UploadHandle, result: ServiceCallResult) {
        let _ = self
            .commands
            .send(Command::UploadTerminated { session, result });
    }

    /// Deliver a fragment ack for `session`. Error acks raise `stream_error`.
    pub fn fragment_ack(&self, session: UploadHandle, ack: FragmentAck) {
        let events = self.provider.stream_events();
        events.fragment_ack(&self.name, session, &ack);
        if ack.kind == FragmentAckKind::Error {
            warn!(stream = %self.name, %session, result = ?ack.result, "fragment ack error");
            events.stream_error(&self.name, Some(session), ack.result);
        } else {
            self.health.record_ack(self.provider.current_time());
        }
        let _ = self.commands.send(Command::FragmentAck { session, ack });
    }

    /// Latest buffered-but-unacknowledged duration, sampled by the health
    /// monitor.
    pub fn report_buffer_duration(&self, duration: Duration) {
        self.health.record_buffer_duration(duration);
    }

    /// Raise `dropped_frame` for this stream.
    pub fn dropped_frame(&self, timestamp: Timestamp) {
        self.provider
            .stream_events()
            .dropped_frame(&self.name, timestamp);
    }

    /// Raise `dropped_fragment` for this stream.
    pub fn dropped_fragment(&self, timestamp: Timestamp) {
        self.provider
            .stream_events()
            .dropped_fragment(&self.name, timestamp);
    }

    /// The open upload session, if any.
    pub fn current_session(&self) -> Option<UploadHandle> {
        self.health.session()
    }

    /// Health signals sampled by the monitor.
    pub fn health(&self) -> &Arc<StreamHealth> {
        &self.health
    }

    /// Wait for the stream task to finish. Only the first caller waits.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(stream = %self.name, error = %err, "stream task panicked");
            }
        }
    }
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of a control-plane call after retries.
enum CallStep {
    Done(CallPayload),
    Advance,
    Failed(ServiceCallResult),
    Cancelled,
}

enum Request<'a> {
    Describe,
    Create(&'a CreateStreamRequest),
    Tag(&'a [(String, String)]),
    Endpoint,
    Put(&'a PutStreamRequest),
}

impl Request<'_> {
    fn call(&self) -> ApiCall {
        match self {
            Request::Describe => ApiCall::DescribeStream,
            Request::Create(_) => ApiCall::CreateStream,
            Request::Tag(_) => ApiCall::TagResource,
            Request::Endpoint => ApiCall::GetStreamingEndpoint,
            Request::Put(_) => ApiCall::PutStream,
        }
    }
}

struct TokenSlot {
    tx: Mutex<Option<oneshot::Sender<AuthResult<AuthToken>>>>,
}

impl StreamingTokenSink for TokenSlot {
    fn streaming_token_result(&self, _stream_name: &str, result: AuthResult<AuthToken>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

/// Task driving one stream through describe, create, tag, endpoint and upload.
pub struct ServiceCallStateMachine {
    provider: Arc<CallbacksProvider>,
    stream: StreamConfig,
    options: StreamOptions,
    state_tx: watch::Sender<ServiceCallState>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    health: Arc<StreamHealth>,
    security: Option<AuthToken>,
    endpoint: String,
    next_session: u64,
    upload_failures: u32,
    last_result: ServiceCallResult,
    last_session: Option<UploadHandle>,
    restart_after_error: bool,
    ready_raised: bool,
}

impl ServiceCallStateMachine {
    /// Spawn the state machine for `stream` and return its controller.
    pub fn start(
        provider: Arc<CallbacksProvider>,
        stream: StreamConfig,
        options: StreamOptions,
    ) -> StreamController {
        let (state_tx, state_rx) = watch::channel(ServiceCallState::Idle);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let health = Arc::new(StreamHealth::new(
            stream.name.clone(),
            options.connection_staleness,
            options.max_latency,
        ));
        let name: Arc<str> = Arc::from(stream.name.as_str());

        let machine = ServiceCallStateMachine {
            provider: Arc::clone(&provider),
            stream,
            options,
            state_tx,
            commands: command_rx,
            cancel: cancel.clone(),
            health: Arc::clone(&health),
            security: None,
            endpoint: String::new(),
            next_session: 1,
            upload_failures: 0,
            last_result: ServiceCallResult::Ok,
            last_session: None,
            restart_after_error: false,
            ready_raised: false,
        };
        let task = tokio::spawn(machine.run());

        StreamController {
            name,
            state: state_rx,
            commands: command_tx,
            cancel,
            health,
            provider,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    fn name(&self) -> &str {
        &self.stream.name
    }

    fn set_state(&self, next: ServiceCallState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(stream = %self.name(), from = %previous, to = %next, "state transition");
        }
    }

    async fn run(mut self) {
        let mut state = ServiceCallState::DescribingResource;
        loop {
            self.set_state(state);
            state = match state {
                ServiceCallState::Idle | ServiceCallState::DescribingResource => {
                    self.describe().await
                }
                ServiceCallState::CreatingResource => self.create().await,
                ServiceCallState::Tagging => self.tag().await,
                ServiceCallState::ResolvingEndpoint => self.resolve_endpoint().await,
                ServiceCallState::Uploading => self.upload().await,
                ServiceCallState::Erroring => self.report_error(),
                ServiceCallState::Closing => {
                    self.provider
                        .stream_events()
                        .stream_closed(self.name(), self.last_session);
                    ServiceCallState::Closed
                }
                ServiceCallState::Closed | ServiceCallState::Failed => break,
            };
        }
        self.health.close_session();
        let finished = *self.state_tx.borrow();
        info!(stream = %self.name(), state = %finished, "stream finished");
    }

    fn after_failure(&mut self, result: ServiceCallResult) -> ServiceCallState {
        self.last_result = result;
        self.restart_after_error = false;
        ServiceCallState::Erroring
    }

    fn report_error(&mut self) -> ServiceCallState {
        error!(stream = %self.name(), result = ?self.last_result, code = self.last_result.code(), "stream error");
        self.provider
            .stream_events()
            .stream_error(self.name(), self.last_session, self.last_result);
        if self.restart_after_error && !self.cancel.is_cancelled() {
            self.restart_after_error = false;
            ServiceCallState::DescribingResource
        } else if self.cancel.is_cancelled() {
            ServiceCallState::Closing
        } else {
            ServiceCallState::Failed
        }
    }

    async fn describe(&mut self) -> ServiceCallState {
        match self.call_with_retry(&Request::Describe).await {
            CallStep::Done(payload) => {
                if let CallPayload::Description(description) = payload {
                    debug!(stream = %self.name(), arn = ?description.stream_arn, "stream exists");
                }
                self.after_resource_ready()
            }
            CallStep::Advance => ServiceCallState::CreatingResource,
            CallStep::Failed(result) => self.after_failure(result),
            CallStep::Cancelled => ServiceCallState::Closing,
        }
    }

    /// Existing and freshly created streams alike are tagged when tags are
    /// configured.
    fn after_resource_ready(&self) -> ServiceCallState {
        if self.stream.tags.is_empty() {
            ServiceCallState::ResolvingEndpoint
        } else {
            ServiceCallState::Tagging
        }
    }

    async fn device_name(&self) -> String {
        if !self.stream.device_name.is_empty() {
            return self.stream.device_name.clone();
        }
        match self.provider.device_fingerprint().await {
            Ok(Some(fingerprint)) => fingerprint,
            Ok(None) => String::new(),
            Err(err) => {
                warn!(stream = %self.name(), error = %err, "device fingerprint unavailable");
                String::new()
            }
        }
    }

    async fn create(&mut self) -> ServiceCallState {
        let request = CreateStreamRequest {
            stream_name: self.stream.name.clone(),
            device_name: self.device_name().await,
            content_type: self.stream.content_type.clone(),
            kms_key_id: self.stream.kms_key_id.clone(),
            retention_hours: self.stream.retention_hours,
        };
        match self.call_with_retry(&Request::Create(&request)).await {
            CallStep::Done(_) | CallStep::Advance => self.after_resource_ready(),
            CallStep::Failed(result) => self.after_failure(result),
            CallStep::Cancelled => ServiceCallState::Closing,
        }
    }

    /// Fire and forget: results are only logged and never block progress.
    async fn tag(&mut self) -> ServiceCallState {
        let tags = self.stream.tag_list();
        if tags.is_empty() || !self.provider.supports_api_call(ApiCall::TagResource) {
            return ServiceCallState::ResolvingEndpoint;
        }
        let auth = match self.security_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(stream = %self.name(), error = %err, "skipping tagging without credentials");
                return ServiceCallState::ResolvingEndpoint;
            }
        };
        let ctx = ServiceCallContext {
            call_id: Uuid::new_v4(),
            auth,
            timeout: self.options.service_call_timeout,
            call_after: self.provider.current_time(),
            result_sink: Arc::new(LoggedResult {
                call: ApiCall::TagResource,
                stream_name: self.stream.name.clone(),
            }),
        };
        let invocation = self.dispatch(&Request::Tag(&tags), &ctx);
        if let Some(err) = invocation.first_error {
            warn!(stream = %self.name(), error = %err, "tagging failed");
        }
        ServiceCallState::ResolvingEndpoint
    }

    async fn resolve_endpoint(&mut self) -> ServiceCallState {
        match self.call_with_retry(&Request::Endpoint).await {
            CallStep::Done(payload) => {
                match payload {
                    CallPayload::Endpoint(endpoint) => self.endpoint = endpoint,
                    other => {
                        warn!(stream = %self.name(), payload = ?other, "endpoint call returned no endpoint");
                    }
                }
                ServiceCallState::Uploading
            }
            CallStep::Advance => ServiceCallState::Uploading,
            CallStep::Failed(result) => self.after_failure(result),
            CallStep::Cancelled => ServiceCallState::Closing,
        }
    }

    async fn security_token(&mut self) -> crate::error::ClientResult<AuthToken> {
        let now = self.provider.current_time();
        if let Some(token) = &self.security {
            let expired = token.kind != AuthTokenKind::None && token.expiration <= now;
            if !expired {
                return Ok(token.clone());
            }
        }
        let token = self.provider.security_auth_info().await?;
        self.security = Some(token.clone());
        Ok(token)
    }

    fn dispatch(&self, request: &Request<'_>, ctx: &ServiceCallContext) -> ChainInvocation {
        let name = self.stream.name.as_str();
        let call = request.call();
        match request {
            Request::Describe => self
                .provider
                .invoke_api(call, |cb| cb.describe_stream(name, ctx)),
            Request::Create(req) => self.provider.invoke_api(call, |cb| cb.create_stream(req, ctx)),
            Request::Tag(tags) => self
                .provider
                .invoke_api(call, |cb| cb.tag_resource(name, tags, ctx)),
            Request::Endpoint => self
                .provider
                .invoke_api(call, |cb| cb.get_streaming_endpoint(name, ctx)),
            Request::Put(req) => self.provider.invoke_api(call, |cb| cb.put_stream(req, ctx)),
        }
    }

    /// One attempt: invoke the chain and wait for the delivered result.
    async fn call_once(&self, request: &Request<'_>, auth: AuthToken) -> CallResultEvent {
        let call = request.call();
        let (sink, mut rx) = PendingResult::new();
        let ctx = ServiceCallContext {
            call_id: Uuid::new_v4(),
            auth,
            timeout: self.options.service_call_timeout,
            call_after: self.provider.current_time(),
            result_sink: sink,
        };
        debug!(stream = %self.name(), ?call, call_id = %ctx.call_id, "invoking");
        let invocation = self.dispatch(request, &ctx);
        drop(ctx);

        if let Some(err) = invocation.first_error {
            warn!(stream = %self.name(), ?call, error = %err, "api callback failed");
            return rx
                .try_recv()
                .unwrap_or_else(|_| CallResultEvent::new(ServiceCallResult::Unknown));
        }
        match tokio::time::timeout(self.options.service_call_timeout, rx).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => {
                warn!(stream = %self.name(), ?call, "result sink dropped without delivery");
                CallResultEvent::new(ServiceCallResult::Unknown)
            }
            Err(_) => CallResultEvent::new(ServiceCallResult::RequestTimeout),
        }
    }

    /// Sleep for `backoff` unless the stream is stopped first.
    async fn backoff(&self, backoff: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(backoff) => true,
        }
    }

    async fn call_with_retry(&mut self, request: &Request<'_>) -> CallStep {
        let call = request.call();
        if !self.provider.supports_api_call(call) {
            error!(stream = %self.name(), ?call, "no api callbacks supply this call");
            return CallStep::Failed(ServiceCallResult::NotImplemented);
        }

        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return CallStep::Cancelled;
            }
            let event = match self.security_token().await {
                Ok(auth) => self.call_once(request, auth).await,
                Err(err) => {
                    warn!(stream = %self.name(), ?call, error = %err, "security token unavailable");
                    CallResultEvent::new(ServiceCallResult::NotAuthorized)
                }
            };
            let result = match &event.payload {
                CallPayload::Description(description) if event.result.is_ok() => {
                    description.status.describe_result()
                }
                _ => event.result,
            };
            if result.is_ok() {
                return CallStep::Done(event.payload);
            }
            self.last_result = result;

            match classify(call, result) {
                FailureClass::Advance => return CallStep::Advance,
                FailureClass::Terminal => {
                    warn!(stream = %self.name(), ?call, ?result, "terminal failure");
                    return CallStep::Failed(result);
                }
                FailureClass::Retriable => {}
            }

            failures += 1;
            match self.options.retry.on_failure(failures) {
                RetryDecision::GiveUp => {
                    warn!(stream = %self.name(), ?call, ?result, attempts = failures, "retries exhausted");
                    return CallStep::Failed(result);
                }
                RetryDecision::Retry {
                    backoff,
                    refresh_credentials,
                } => {
                    info!(stream = %self.name(), ?call, ?result, attempt = failures, ?backoff, "retrying");
                    if refresh_credentials || result.is_auth_failure() {
                        self.security = None;
                    }
                    if !self.backoff(backoff).await {
                        return CallStep::Cancelled;
                    }
                }
            }
        }
    }

    /// Streaming token for a new session. Tokens already inside the minimum
    /// validity window count as an auth failure.
    async fn streaming_token(&mut self) -> Result<AuthToken, ServiceCallResult> {
        let Some(auth) = self.provider.auth().cloned() else {
            return Ok(AuthToken::none());
        };
        if !auth.capabilities().contains(AuthCapability::StreamingToken) {
            return self.security_token().await.map_err(|err| {
                warn!(stream = %self.name(), error = %err, "no credentials for upload");
                ServiceCallResult::NotAuthorized
            });
        }

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(TokenSlot {
            tx: Mutex::new(Some(tx)),
        });
        if let Err(err) = auth
            .get_streaming_token(self.name(), AccessMode::Write, slot)
            .await
        {
            warn!(stream = %self.name(), error = %err, "streaming token request failed");
            return Err(ServiceCallResult::NotAuthorized);
        }
        let token = match tokio::time::timeout(self.options.service_call_timeout, rx).await {
            Ok(Ok(Ok(token))) => token,
            Ok(Ok(Err(err))) => {
                warn!(stream = %self.name(), error = %err, "streaming token rejected");
                return Err(ServiceCallResult::NotAuthorized);
            }
            Ok(Err(_)) => return Err(ServiceCallResult::Unknown),
            Err(_) => return Err(ServiceCallResult::RequestTimeout),
        };

        let now = self.provider.current_time();
        if token.kind != AuthTokenKind::None
            && token.expiration < now.saturating_add(MIN_STREAMING_TOKEN_EXPIRATION_DURATION)
        {
            warn!(stream = %self.name(), expiration = %token.expiration, "streaming token expires too soon");
            return Err(ServiceCallResult::NotAuthorized);
        }
        Ok(token)
    }

    /// Route an upload failure. `None` means "open a new session here".
    async fn upload_failed(&mut self, result: ServiceCallResult) -> Option<ServiceCallState> {
        self.health.close_session();
        self.last_result = result;
        self.upload_failures += 1;
        let recovery = route_upload_failure(result);
        match self.options.retry.on_failure(self.upload_failures) {
            RetryDecision::GiveUp => {
                warn!(stream = %self.name(), ?result, attempts = self.upload_failures, "upload retries exhausted");
                Some(self.after_failure(result))
            }
            RetryDecision::Retry {
                backoff,
                refresh_credentials,
            } => {
                info!(stream = %self.name(), ?result, ?recovery, attempt = self.upload_failures, "upload failed");
                if refresh_credentials {
                    self.security = None;
                }
                if !self.backoff(backoff).await {
                    return Some(ServiceCallState::Closing);
                }
                match recovery {
                    UploadRecovery::ResolveEndpoint => Some(ServiceCallState::ResolvingEndpoint),
                    UploadRecovery::NewSession => None,
                    UploadRecovery::RestartViaError => {
                        self.restart_after_error = true;
                        Some(ServiceCallState::Erroring)
                    }
                    UploadRecovery::Restart => Some(ServiceCallState::DescribingResource),
                }
            }
        }
    }

    async fn upload(&mut self) -> ServiceCallState {
        loop {
            if self.cancel.is_cancelled() {
                return ServiceCallState::Closing;
            }

            let token = match self.streaming_token().await {
                Ok(token) => token,
                Err(result) => match self.upload_failed(result).await {
                    Some(next) => return next,
                    None => continue,
                },
            };

            while self.commands.try_recv().is_ok() {}
            let session = UploadHandle(self.next_session);
            self.next_session += 1;
            let request = PutStreamRequest {
                stream_name: self.stream.name.clone(),
                endpoint: self.endpoint.clone(),
                session,
                streaming_token: token.clone(),
            };
            let event = self.call_once(&Request::Put(&request), token.clone()).await;
            if !event.result.is_ok() {
                self.last_session = Some(session);
                match self.upload_failed(event.result).await {
                    Some(next) => return next,
                    None => continue,
                }
            }

            self.last_session = Some(session);
            self.health
                .open_session(session, self.provider.current_time());
            info!(stream = %self.name(), %session, expiration = %token.expiration, "upload session open");
            if !self.ready_raised {
                self.ready_raised = true;
                self.provider.stream_events().stream_ready(self.name());
            }

            let rotate_at = (token.kind != AuthTokenKind::None)
                .then(|| token.expiration.saturating_sub(STREAMING_TOKEN_EXPIRATION_GRACE_PERIOD));
            match self.session_loop(session, rotate_at).await {
                SessionEnd::Rotate => {
                    self.health.close_session();
                    info!(stream = %self.name(), %session, "rotating upload session");
                }
                SessionEnd::Next(next) => {
                    self.health.close_session();
                    return next;
                }
                SessionEnd::Failed(result) => match self.upload_failed(result).await {
                    Some(next) => return next,
                    None => continue,
                },
            }
        }
    }

    async fn session_loop(&mut self, session: UploadHandle, rotate_at: Option<Timestamp>) -> SessionEnd {
        loop {
            let wait = rotate_at.map(|at| at.duration_since(self.provider.current_time()));
            let rotation = async move {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Next(ServiceCallState::Closing),
                _ = rotation => return SessionEnd::Rotate,
                command = self.commands.recv() => match command {
                    None => return SessionEnd::Next(ServiceCallState::Closing),
                    Some(Command::ResetConnection) => {
                        info!(stream = %self.name(), %session, "connection reset requested");
                        return SessionEnd::Next(ServiceCallState::ResolvingEndpoint);
                    }
                    Some(Command::UploadTerminated { session: ended, result }) if ended == session => {
                        if result.is_ok() {
                            return SessionEnd::Rotate;
                        }
                        return SessionEnd::Failed(result);
                    }
                    Some(Command::FragmentAck { session: acked, ack }) if acked == session => {
                        if ack.kind != FragmentAckKind::Error {
                            self.upload_failures = 0;
                        }
                    }
                    Some(other) => {
                        debug!(stream = %self.name(), ?other, "ignoring command for a previous session");
                    }
                },
            }
        }
    }
}

enum SessionEnd {
    Rotate,
    Next(ServiceCallState),
    Failed(ServiceCallResult),
}
