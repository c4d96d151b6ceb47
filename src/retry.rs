//! Decides whether, when and how a failed operation is retried.

use crate::backoff::ExponentialBackoff;
use crate::policy::RetryConfig;
use crate::status::{Failure, StatusCode, TransportStatus};

use tokio::time::Duration;
use tracing::{event, Level};

/// The shape of the call being retried.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OperationKind {
    #[default]
    Unary,

    /// Streaming operations are never retried: part of the stream may
    /// already have been consumed.
    Streaming,
}

/// How long to wait before retrying a class of failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Not retryable.
    None,
    /// Retry right away.
    Instant,
    /// Retry with [RetryConfig::fast] backoff.
    Fast,
    /// Retry with [RetryConfig::slow] backoff.
    Slow,
}

/// What a failure says about how to retry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub backoff: Backoff,

    /// The session used by the failed attempt should be replaced.
    pub recreate_session: bool,

    /// The endpoint used by the failed attempt should be avoided.
    pub reset_transport: bool,

    /// The retry may race a duplicate attempt.
    pub hedge: bool,

    /// The failed attempt may have taken effect, so only idempotent
    /// operations may be retried.
    pub idempotent_only: bool,
}

impl Classification {
    pub const NOT_RETRYABLE: Self = Self::new(Backoff::None);

    const fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            recreate_session: false,
            reset_transport: false,
            hedge: false,
            idempotent_only: false,
        }
    }

    const fn recreate_session(mut self) -> Self {
        self.recreate_session = true;
        self
    }

    const fn reset_transport(mut self) -> Self {
        self.reset_transport = true;
        self
    }

    const fn hedge(mut self) -> Self {
        self.hedge = true;
        self
    }

    const fn idempotent_only(mut self) -> Self {
        self.idempotent_only = true;
        self
    }
}

/// Classifies a failure by its server status and transport status.
///
/// Only statuses which break the session (see
/// [StatusCode::invalidates_session]) ask for a new one. In particular,
/// `Undetermined` keeps the session: the server answered on it, so it is
/// still usable, but whether the operation took effect is unknown, so it is
/// only retried when idempotent.
pub fn classify(failure: &Failure) -> Classification {
    use StatusCode as S;
    use TransportStatus as T;

    match (failure.status, failure.transport) {
        (Some(S::BadSession | S::SessionExpired), _) => {
            Classification::new(Backoff::Instant).recreate_session()
        }
        (Some(S::SessionBusy), _) => Classification::new(Backoff::Fast).recreate_session(),
        (Some(S::Aborted), _) => Classification::new(Backoff::Fast),
        (Some(S::Unavailable), _) => Classification::new(Backoff::Fast)
            .recreate_session()
            .hedge(),
        (Some(S::Overloaded | S::ClientTransportResourceExhausted), _)
        | (None, Some(T::ResourceExhausted)) => Classification::new(Backoff::Slow),
        (Some(S::Undetermined), _) => Classification::new(Backoff::Fast).idempotent_only(),
        (Some(S::Cancelled), _) => Classification::new(Backoff::Fast)
            .recreate_session()
            .idempotent_only(),
        (Some(S::ClientTransportUnavailable | S::ClientTransportTimeout), _)
        | (None, Some(T::Unavailable | T::DeadlineExceeded)) => {
            Classification::new(Backoff::Fast)
                .recreate_session()
                .reset_transport()
                .hedge()
                .idempotent_only()
        }
        (Some(S::ClientTransportUnknown), _) | (None, Some(T::Unknown | T::Internal)) => {
            Classification::new(Backoff::Fast)
                .reset_transport()
                .idempotent_only()
        }
        _ => Classification::NOT_RETRYABLE,
    }
}

/// Everything known about an operation when one of its attempts fails.
#[derive(Clone, Debug)]
pub struct RetryContext {
    /// Attempts made so far, including the one which just failed.
    pub attempt: u32,
    pub elapsed: Duration,

    /// Time left until the operation's deadline, if it has one.
    pub deadline_left: Option<Duration>,
    pub is_idempotent: bool,
    pub operation_kind: OperationKind,
    pub last_failure: Failure,
}

/// The verdict on a failed attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    /// How long to wait before the next attempt, or `None` to give up.
    pub delay: Option<Duration>,
    pub recreate_session: bool,
    pub reset_transport: bool,
    pub hedge: bool,
}

impl RetryDecision {
    pub const DONT_RETRY: Self = Self {
        delay: None,
        recreate_session: false,
        reset_transport: false,
        hedge: false,
    };

    pub fn should_retry(&self) -> bool {
        self.delay.is_some()
    }
}

pub trait RetryPolicy: Send + Sync {
    fn decide(&self, ctx: &RetryContext) -> RetryDecision;

    /// Called once an operation succeeds.
    fn report_success(&self, _attempts: u32, _elapsed: Duration) {}
}

/// Retries by the classification table, with decorrelated jitter.
#[derive(Clone, Debug, Default)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
}

impl DefaultRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn delay(&self, backoff: Backoff, attempt: u32) -> Option<Duration> {
        let settings = match backoff {
            Backoff::None => return None,
            Backoff::Instant => return Some(Duration::ZERO),
            Backoff::Fast => self.config.fast,
            Backoff::Slow => self.config.slow,
        };
        Some(settings.base.decorrelated_jitter(settings.cap, attempt))
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        if ctx.operation_kind == OperationKind::Streaming {
            return RetryDecision::DONT_RETRY;
        }
        if ctx.attempt >= self.config.max_attempts {
            event!(Level::DEBUG, attempt = ctx.attempt, "Retry budget exhausted");
            return RetryDecision::DONT_RETRY;
        }
        if ctx.deadline_left.is_some_and(|left| left.is_zero()) {
            return RetryDecision::DONT_RETRY;
        }

        let class = classify(&ctx.last_failure);
        if class.idempotent_only && !ctx.is_idempotent {
            return RetryDecision::DONT_RETRY;
        }
        let Some(delay) = self.delay(class.backoff, ctx.attempt) else {
            return RetryDecision::DONT_RETRY;
        };
        if ctx.deadline_left.is_some_and(|left| delay > left) {
            event!(
                Level::DEBUG,
                ?delay,
                deadline_left = ?ctx.deadline_left,
                "Retry delay would overrun the deadline"
            );
            return RetryDecision::DONT_RETRY;
        }

        RetryDecision {
            delay: Some(delay),
            recreate_session: class.recreate_session,
            reset_transport: class.reset_transport,
            hedge: class.hedge
                && ctx.is_idempotent
                && ctx.attempt >= self.config.hedge_min_attempt,
        }
    }
}
