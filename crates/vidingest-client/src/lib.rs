#![warn(missing_docs)]

//! vidingest client runtime: callback chains, per-stream service-call state machine, connection health monitoring

pub mod callbacks;
pub mod chain;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod provider;
pub mod retry;
pub mod service;
pub mod state_machine;

pub use callbacks::{
    ApiCallbacks, DefaultPlatform, FragmentAck, FragmentAckKind, PlatformCall, PlatformCallbacks,
    ProducerCallbacks, ProducerEvent, StreamCallbacks, StreamEvent,
};
pub use chain::{
    AggregateSlot, CallbackChain, CallbackResult, ChainFlow, ChainInvocation, OpSet, Operation,
    DEFAULT_CALLBACK_CHAIN_COUNT, MAX_CALLBACK_CHAIN_COUNT,
};
pub use client::IngestClient;
pub use config::{BackoffSettings, ClientConfig, HealthSettings, StreamConfig};
pub use error::{CallbackCategory, ClientError, ClientResult};
pub use health::{ConnectionHealthMonitor, HealthAction, HealthConfig, StreamHealth};
pub use provider::CallbacksProvider;
pub use retry::{BackoffConfig, BoundedRetry, RetryDecision, RetryPolicy, UnboundedRetry};
pub use service::{
    ApiCall, CallPayload, CallResultEvent, CallResultSink, CreateStreamRequest, PutStreamRequest,
    ServiceCallContext, ServiceCallResult, StreamDescription, StreamStatus, UploadHandle,
};
pub use state_machine::{ServiceCallState, ServiceCallStateMachine, StreamController, StreamOptions};
