//! Level-triggered reconcile driver
//!
//! A [`Driver`] runs one [`Reconcile`] implementation against a stream of
//! [`Trigger`]s. It never runs two passes of the same reconciler at once,
//! folds every trigger that queued up during a pass into a single follow-up
//! pass, and schedules its own passes for requeues, periodic resyncs and
//! error backoff. Passes re-read the world, so a missed or duplicated trigger
//! is harmless.

use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::{Backoff, RetryConfig};
use crate::Result;

/// When the driver should run the next pass after a successful one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Only when a trigger arrives (or the resync interval elapses)
    AwaitChange,
    /// After the given delay, or earlier if a trigger arrives
    After(Duration),
}

/// Why a pass runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Synthetic trigger injected once at startup
    Bootstrap,
    /// A watched resource changed
    Changed {
        /// Kind of the changed resource
        kind: String,
        /// Name (`namespace/name` for namespaced kinds)
        name: String,
    },
    /// A scheduled pass (requeue, resync or backoff)
    Scheduled,
}

/// One reconcile pass over a single identity
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Identity used in logs
    fn name(&self) -> String;

    /// Re-derive desired state from observed state and apply the difference
    async fn reconcile(&self) -> Result<Requeue>;
}

/// Prepend exactly one [`Trigger::Bootstrap`] to `triggers`
///
/// Guarantees a first pass even when nothing changes after startup.
pub fn bootstrap<S>(triggers: S) -> impl Stream<Item = Trigger> + Send
where
    S: Stream<Item = Trigger> + Send,
{
    futures::stream::once(async { Trigger::Bootstrap }).chain(triggers)
}

/// Scheduling parameters for a [`Driver`]
#[derive(Clone, Debug)]
pub struct Driver {
    resync: Option<Duration>,
    backoff: RetryConfig,
}

impl Default for Driver {
    fn default() -> Self {
        Self {
            resync: None,
            backoff: RetryConfig::reconcile(),
        }
    }
}

impl Driver {
    /// Driver that re-runs the reconciler at least every `interval`
    pub fn with_resync(interval: Duration) -> Self {
        Self {
            resync: Some(interval),
            ..Default::default()
        }
    }

    /// Override the error backoff
    pub fn backoff(mut self, config: RetryConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Run `reconciler` until `cancel` fires
    ///
    /// An in-flight pass is abandoned at its next await point on
    /// cancellation.
    pub async fn run<R, S>(&self, reconciler: &R, triggers: S, cancel: CancellationToken)
    where
        R: Reconcile + ?Sized,
        S: Stream<Item = Trigger> + Send,
    {
        let name = reconciler.name();
        let mut triggers = Box::pin(triggers);
        let mut triggers_open = true;
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut deadline = self.resync.map(|r| Instant::now() + r);

        info!(reconciler = %name, "reconciler started");

        loop {
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = triggers.next(), if triggers_open => match next {
                    Some(trigger) => trigger,
                    None => {
                        debug!(reconciler = %name, "trigger stream ended");
                        triggers_open = false;
                        continue;
                    }
                },
                _ = sleep_until(deadline) => Trigger::Scheduled,
            };

            // Fold everything already queued into this pass
            let mut coalesced = 0usize;
            while triggers_open {
                match triggers.next().now_or_never() {
                    Some(Some(_)) => coalesced += 1,
                    Some(None) => triggers_open = false,
                    None => break,
                }
            }
            debug!(reconciler = %name, trigger = ?trigger, coalesced, "reconcile pass");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = reconciler.reconcile() => result,
            };

            let now = Instant::now();
            deadline = match result {
                Ok(requeue) => {
                    backoff.reset();
                    let requeue_at = match requeue {
                        Requeue::After(delay) => Some(now + delay),
                        Requeue::AwaitChange => None,
                    };
                    let resync_at = self.resync.map(|r| now + r);
                    match (requeue_at, resync_at) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    }
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(
                        reconciler = %name,
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis(),
                        "reconcile failed, retrying"
                    );
                    Some(now + delay)
                }
                Err(e) => {
                    error!(
                        reconciler = %name,
                        error = %e,
                        "reconcile failed with a permanent error"
                    );
                    self.resync.map(|r| now + r)
                }
            };
        }

        info!(reconciler = %name, "reconciler stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
