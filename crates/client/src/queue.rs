//! Queue admission control.
//!
//! ComfyUI executes one prompt at a time and queues the rest. Before
//! submitting more work, callers poll the server's queue depth and wait
//! until it is at or below a threshold, so a batch producer does not
//! flood the server queue.

use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, ComfyApi};
use crate::backoff::{next_delay, BackoffConfig};

/// Default poll budget: ten minutes at the default poll interval.
pub const DEFAULT_MAX_POLLS: u32 = 600;

/// Source of the server's current queue depth.
///
/// Abstracted so admission logic is testable without a live server.
#[async_trait]
pub trait QueueStatusSource: Send + Sync {
    /// Total outstanding work on the server: running plus pending.
    async fn queue_depth(&self) -> Result<usize, ApiError>;
}

#[async_trait]
impl QueueStatusSource for ComfyApi {
    async fn queue_depth(&self) -> Result<usize, ApiError> {
        Ok(self.queue_info().await?.depth())
    }
}

/// Admission policy for [`QueueController::wait_for_capacity`].
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Admit a submission while the queue depth is at or below this.
    /// Zero means wait for a fully idle server.
    pub max_outstanding: usize,
    /// Interval between queue polls while the server is busy.
    pub poll_interval: Duration,
    /// Give up after this many polls without capacity. `None` waits
    /// forever and is an explicit opt-in; the default budget is
    /// [`DEFAULT_MAX_POLLS`] so an admission wait always terminates.
    pub max_polls: Option<u32>,
    /// Consecutive poll failures tolerated before giving up.
    pub max_poll_failures: u32,
    /// Backoff schedule for retrying failed polls.
    pub failure_backoff: BackoffConfig,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_outstanding: 0,
            poll_interval: Duration::from_secs(1),
            max_polls: Some(DEFAULT_MAX_POLLS),
            max_poll_failures: 5,
            failure_backoff: BackoffConfig::default(),
        }
    }
}

/// Errors from admission control.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Capacity did not open up within the poll budget.
    #[error("queue still busy after {polls} polls")]
    Timeout { polls: u32 },

    /// Queue status polling kept failing.
    #[error("queue status poll failed after {attempts} attempts: {source}")]
    PollFailed {
        attempts: u32,
        #[source]
        source: ApiError,
    },
}

/// Polls a [`QueueStatusSource`] until the admission policy is met.
pub struct QueueController<S> {
    source: S,
    policy: QueuePolicy,
}

impl<S: QueueStatusSource> QueueController<S> {
    pub fn new(source: S, policy: QueuePolicy) -> Self {
        Self { source, policy }
    }

    /// Block until the queue depth is at or below the threshold.
    ///
    /// Returns the depth observed at admission. Transient poll failures
    /// are retried with exponential backoff; a successful poll resets
    /// the failure count.
    pub async fn wait_for_capacity(&self) -> Result<usize, QueueError> {
        let mut polls = 0u32;
        let mut failures = 0u32;
        let mut retry_delay = self.policy.failure_backoff.initial_delay;

        loop {
            if let Some(max) = self.policy.max_polls {
                if polls >= max {
                    tracing::warn!(
                        polls,
                        threshold = self.policy.max_outstanding,
                        "Gave up waiting for queue capacity",
                    );
                    return Err(QueueError::Timeout { polls });
                }
            }
            polls += 1;

            match self.source.queue_depth().await {
                Ok(depth) => {
                    failures = 0;
                    retry_delay = self.policy.failure_backoff.initial_delay;

                    if depth <= self.policy.max_outstanding {
                        tracing::debug!(depth, polls, "Queue has capacity");
                        return Ok(depth);
                    }
                    tracing::debug!(
                        depth,
                        threshold = self.policy.max_outstanding,
                        "Queue busy, waiting",
                    );
                    tokio::time::sleep(self.policy.poll_interval).await;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.policy.max_poll_failures {
                        return Err(QueueError::PollFailed {
                            attempts: failures,
                            source: e,
                        });
                    }
                    tracing::warn!(
                        error = %e,
                        failures,
                        retry_in_ms = retry_delay.as_millis() as u64,
                        "Queue poll failed, retrying",
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = next_delay(retry_delay, &self.policy.failure_backoff);
                }
            }
        }
    }
}
