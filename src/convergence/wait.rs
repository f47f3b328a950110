//! Bounded, cancellable polling

use metrics::{histogram, increment_counter};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Minimum interval between two attempts of a check
pub const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// CiliumEndpoint objects appear slowly, poll them less often
pub const CILIUM_ENDPOINT_PACING: Duration = Duration::from_secs(2);

/// Why a [`WaitContext`] stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

impl Interrupt {
    fn into_error(self, what: &str, last: Option<Error>) -> Error {
        let what = what.to_string();
        match self {
            Interrupt::DeadlineExceeded => Error::DeadlineExceeded {
                what,
                source: Box::new(last.unwrap_or_else(|| {
                    Error::Interrupted("probe still running when deadline reached".to_string())
                })),
            },
            Interrupt::Cancelled => Error::Cancelled {
                what,
                source: Box::new(last.unwrap_or_else(|| {
                    Error::Interrupted("cancelled before any attempt completed".to_string())
                })),
            },
        }
    }
}

/// Cancellation plus an optional deadline, threaded through every wait.
///
/// Children derived with [`WaitContext::with_timeout`] are cancelled with
/// their parent and never outlive its deadline.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl WaitContext {
    /// Root context without a deadline
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Run a single remote call unless the context ends first.
    ///
    /// The call is not polled at all when the context has already ended.
    pub async fn race<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            interrupt = self.done() => Err(interrupt.into_error(what, None)),
            result = call => result,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> Interrupt {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Interrupt::Cancelled,
            _ = deadline => Interrupt::DeadlineExceeded,
        }
    }
}

/// Run `probe` until it succeeds, the context ends, or it fails fatally.
///
/// Retryable failures are remembered and retried once `pacing` has elapsed
/// since the start of the failed attempt. Each attempt is raced against the
/// context. When the context ends the returned error wraps the last probe
/// failure.
pub async fn poll_until<T, F, Fut>(
    ctx: &WaitContext,
    pacing: Duration,
    what: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut last: Option<Error> = None;

    loop {
        let next_attempt = Instant::now() + pacing;

        let outcome = tokio::select! {
            biased;
            interrupt = ctx.done() => return Err(interrupt.into_error(what, last)),
            outcome = probe() => outcome,
        };

        match outcome {
            Ok(value) => {
                histogram!("conncheck_wait_seconds", started.elapsed().as_secs_f64());
                trace!(what, "Wait finished");
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                increment_counter!("conncheck_probe_failures_total");
                debug!(what, error = %e, "Probe failed, retrying");
                last = Some(e);
            }
        }

        tokio::select! {
            biased;
            interrupt = ctx.done() => return Err(interrupt.into_error(what, last)),
            _ = sleep_until(next_attempt) => {}
        }
    }
}
