//! Retry policy and remote-call failure classification.
//!
//! The state machine never branches on "continuous retry" itself: every call
//! site reports its consecutive failure count to a [`RetryPolicy`] and acts on
//! the returned [`RetryDecision`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::service::{ApiCall, ServiceCallResult, SERVICE_CALL_MAX_RETRY_COUNT};

/// Shape of the delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Upper bound on any single delay (default: 10 seconds).
    pub max_backoff: Duration,
    /// Growth factor per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter (default: true).
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// `initial_backoff * backoff_multiplier^attempt`, capped at `max_backoff`,
    /// plus jitter when enabled.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let capped = (base_ms * self.backoff_multiplier.powi(exponent)).min(max_ms) as u64;

        if self.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `backoff`.
    Retry {
        /// Delay before the next attempt.
        backoff: Duration,
        /// Fetch fresh credentials before the next attempt.
        refresh_credentials: bool,
    },
    /// Stop and surface the last failure.
    GiveUp,
}

/// How many times, and how fast, a retriable failure is retried.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Decide after the `failures`-th consecutive failure (starting at 1).
    fn on_failure(&self, failures: u32) -> RetryDecision;

    /// Whether this policy ever gives up on retriable failures.
    fn is_continuous(&self) -> bool;
}

/// Gives up after `max_retries` retries, so a call runs at most
/// `max_retries + 1` times.
#[derive(Debug, Clone)]
pub struct BoundedRetry {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay growth between attempts.
    pub backoff: BackoffConfig,
}

impl Default for BoundedRetry {
    fn default() -> Self {
        Self {
            max_retries: SERVICE_CALL_MAX_RETRY_COUNT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy for BoundedRetry {
    fn on_failure(&self, failures: u32) -> RetryDecision {
        if failures > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            backoff: self.backoff.compute_backoff(failures.saturating_sub(1)),
            refresh_credentials: false,
        }
    }

    fn is_continuous(&self) -> bool {
        false
    }
}

/// Never gives up. Past `refresh_after` failures every retry first refreshes
/// credentials and the delay stops growing.
#[derive(Debug, Clone)]
pub struct UnboundedRetry {
    /// Failures after which credentials are refreshed and the delay is capped.
    pub refresh_after: u32,
    /// Delay growth between attempts.
    pub backoff: BackoffConfig,
}

impl Default for UnboundedRetry {
    fn default() -> Self {
        Self {
            refresh_after: SERVICE_CALL_MAX_RETRY_COUNT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy for UnboundedRetry {
    fn on_failure(&self, failures: u32) -> RetryDecision {
        let attempt = failures.saturating_sub(1).min(self.refresh_after);
        RetryDecision::Retry {
            backoff: self.backoff.compute_backoff(attempt),
            refresh_credentials: failures > self.refresh_after,
        }
    }

    fn is_continuous(&self) -> bool {
        true
    }
}

/// Continuous or bounded policy sharing `max_retries` and `backoff`.
pub fn retry_policy(continuous: bool, max_retries: u32, backoff: BackoffConfig) -> Arc<dyn RetryPolicy> {
    if continuous {
        Arc::new(UnboundedRetry {
            refresh_after: max_retries,
            backoff,
        })
    } else {
        Arc::new(BoundedRetry {
            max_retries,
            backoff,
        })
    }
}

/// What a failed control-plane call means for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Not really a failure for this call: move to the next state.
    Advance,
    /// Ask the retry policy.
    Retriable,
    /// Never retried, whatever the policy.
    Terminal,
}

/// How `call` failing with `result` affects the stream.
pub fn classify(call: ApiCall, result: ServiceCallResult) -> FailureClass {
    use ServiceCallResult as R;
    match (call, result) {
        (_, R::InvalidArg) | (_, R::BadRequest) => FailureClass::Terminal,
        (ApiCall::DescribeStream, R::ResourceNotFound) => FailureClass::Advance,
        (ApiCall::DescribeStream, R::ResourceDeleted) => FailureClass::Terminal,
        (ApiCall::CreateStream, R::StreamLimit) | (ApiCall::CreateStream, R::DeviceLimit) => {
            FailureClass::Terminal
        }
        (ApiCall::TagResource, _) => FailureClass::Advance,
        _ => FailureClass::Retriable,
    }
}

/// Where an upload session failure sends the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRecovery {
    /// Connection-level trouble: resolve the endpoint again.
    ResolveEndpoint,
    /// Credentials rejected: open a new session with a fresh token.
    NewSession,
    /// The resource or session is gone: restart from describe, reporting the
    /// error first.
    RestartViaError,
    /// Anything else: restart from describe.
    Restart,
}

/// Recovery path for a failed upload session.
pub fn route_upload_failure(result: ServiceCallResult) -> UploadRecovery {
    if result.is_timeout() {
        UploadRecovery::ResolveEndpoint
    } else if result.is_auth_failure() {
        UploadRecovery::NewSession
    } else if matches!(
        result,
        ServiceCallResult::ResourceNotFound | ServiceCallResult::ResourceDeleted
    ) {
        UploadRecovery::RestartViaError
    } else {
        UploadRecovery::Restart
    }
}
