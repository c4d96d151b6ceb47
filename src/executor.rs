//! Runs operations, retrying them as a [RetryPolicy] decides.

use crate::policy::RetryConfig;
use crate::pool::{self, Pool};
#[cfg(feature = "probes")]
use crate::probes;
use crate::retry::{DefaultRetryPolicy, OperationKind, RetryContext, RetryPolicy};
use crate::session::Session;
use crate::status::{Classifier, Failure};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error<E> {
    /// The error of the last attempt, exactly as the operation returned it.
    #[error(transparent)]
    Operation(E),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl<E> Error<E> {
    /// Returns the operation's own error, if that is why the run ended.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Error::Operation(err) => Some(err),
            Error::Cancelled => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RunOptions {
    /// Whether running the operation twice is as good as running it once.
    pub is_idempotent: bool,
    pub operation_kind: OperationKind,

    /// Overrides the executor's default deadline.
    pub deadline: Option<Duration>,
}

impl RunOptions {
    pub fn idempotent() -> Self {
        Self {
            is_idempotent: true,
            ..Default::default()
        }
    }
}

/// Side effects of a retry decision.
///
/// Invoked after a failed attempt, before the next one starts.
#[async_trait]
pub trait RetryHooks: Send + Sync {
    async fn recreate_session(&self, _failure: &Failure) {}
    async fn reset_transport(&self, _failure: &Failure) {}
}

/// Hooks which do nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoHooks;

impl RetryHooks for NoHooks {}

/// Identifies one invocation of an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Attempt {
    /// Starts at 1. Both sides of a hedged race share a number.
    pub number: u32,

    /// True for the duplicate started by hedging.
    pub hedged: bool,
}

pub struct RetryExecutor {
    policy: Arc<dyn RetryPolicy>,
    hedge_delay: Duration,
    default_deadline: Option<Duration>,
}

impl RetryExecutor {
    pub fn new(policy: Arc<dyn RetryPolicy>, hedge_delay: Duration) -> Self {
        Self {
            policy,
            hedge_delay,
            default_deadline: None,
        }
    }

    /// Uses a [DefaultRetryPolicy] with the given configuration.
    pub fn from_config(config: RetryConfig) -> Self {
        let hedge_delay = config.hedge_delay;
        let default_deadline = config.default_deadline;
        Self {
            policy: Arc::new(DefaultRetryPolicy::new(config)),
            hedge_delay,
            default_deadline,
        }
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    /// Runs `operation` until it succeeds, or the policy gives up.
    ///
    /// After each failure, `classifier` describes the error to the policy,
    /// and `hooks` carry out the side effects of its decision. When the
    /// policy asks for hedging, the next attempt is raced against a
    /// duplicate started after the hedge delay; the first success wins and
    /// the other attempt is dropped.
    ///
    /// When the policy gives up, the last error is returned unchanged in
    /// [Error::Operation].
    pub async fn run<T, E, F, Fut, C, H>(
        &self,
        options: RunOptions,
        classifier: &C,
        hooks: &H,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, Error<E>>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
        H: RetryHooks + ?Sized,
    {
        let start = Instant::now();
        let deadline = options
            .deadline
            .or(self.default_deadline)
            .map(|deadline| start + deadline);

        let mut attempt = 1;
        let mut hedge = false;
        loop {
            let round = async {
                if hedge {
                    self.race(&mut operation, attempt).await
                } else {
                    operation(Attempt {
                        number: attempt,
                        hedged: false,
                    })
                    .await
                }
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = round => result,
            };

            let err = match result {
                Ok(value) => {
                    self.policy.report_success(attempt, start.elapsed());
                    return Ok(value);
                }
                Err(err) => err,
            };

            let failure = classifier.classify(&err);
            let now = Instant::now();
            let ctx = RetryContext {
                attempt,
                elapsed: now - start,
                deadline_left: deadline.map(|deadline| deadline.saturating_duration_since(now)),
                is_idempotent: options.is_idempotent,
                operation_kind: options.operation_kind,
                last_failure: failure,
            };
            let decision = self.policy.decide(&ctx);
            let Some(delay) = decision.delay else {
                event!(Level::DEBUG, attempt, ?failure, "Not retrying operation");
                return Err(Error::Operation(err));
            };

            if decision.recreate_session {
                hooks.recreate_session(&failure).await;
            }
            if decision.reset_transport {
                hooks.reset_transport(&failure).await;
            }

            #[cfg(feature = "probes")]
            probes::retry__attempt!(|| (attempt, delay.as_millis() as u64));
            event!(
                Level::DEBUG,
                attempt,
                ?delay,
                ?failure,
                hedge = decision.hedge,
                "Retrying operation"
            );

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => (),
                }
            }
            hedge = decision.hedge;
            attempt += 1;
        }
    }

    // Races a primary attempt against a duplicate which starts once the
    // primary has run for the hedge delay, or has failed.
    //
    // The first success is returned. If both fail, the error of the one
    // which failed last is returned.
    async fn race<T, E, F, Fut>(&self, operation: &mut F, number: u32) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let primary = operation(Attempt {
            number,
            hedged: false,
        });
        tokio::pin!(primary);

        let early = tokio::select! {
            result = &mut primary => Some(result),
            _ = tokio::time::sleep(self.hedge_delay) => None,
        };
        let primary_failed = match early {
            Some(Ok(value)) => return Ok(value),
            Some(Err(_)) => true,
            None => false,
        };

        #[cfg(feature = "probes")]
        probes::hedge__start!(|| number);
        event!(Level::DEBUG, attempt = number, primary_failed, "Starting hedged attempt");

        let backup = operation(Attempt {
            number,
            hedged: true,
        });
        if primary_failed {
            return backup.await;
        }
        tokio::pin!(backup);

        tokio::select! {
            result = &mut primary => match result {
                Ok(value) => Ok(value),
                Err(_) => backup.await,
            },
            result = &mut backup => match result {
                Ok(value) => Ok(value),
                Err(_) => primary.await,
            },
        }
    }

    /// Runs `operation` with a session leased from `pool` for each attempt.
    ///
    /// A failing attempt reports its status to its session before the
    /// session goes back to the pool, so sessions invalidated by the failure
    /// are replaced rather than reused.
    pub async fn run_with_session<S, T, E, F, Fut, C, H>(
        &self,
        pool: &Pool<S>,
        options: RunOptions,
        classifier: &C,
        hooks: &H,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, Error<E>>
    where
        S: Session,
        E: From<pool::Error>,
        F: Fn(Arc<S>, Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
        H: RetryHooks + ?Sized,
    {
        let operation = &operation;
        self.run(options, classifier, hooks, cancel, move |attempt| async move {
            let handle = pool.get_session(cancel).await.map_err(E::from)?;
            let result = operation(handle.session().clone(), attempt).await;
            if let Err(err) = &result {
                if let Some(status) = classifier.classify(err).effective_status() {
                    handle.on_not_success_status_code(status);
                }
            }
            result
        })
        .await
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::from_config(RetryConfig::default())
    }
}
