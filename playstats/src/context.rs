//! Deadline and cancellation for external calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Bounds every external call made during one job run.
///
/// Each call gets its own deadline; the cancellation token is shared by the
/// whole run so a Ctrl-C aborts whichever call is in flight.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    call_timeout: Duration,
}

impl RunContext {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            call_timeout,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` under the call deadline, failing early if the run is cancelled.
    pub async fn bound<F>(&self, operation: &str, fut: F) -> Result<F::Output, JobError>
    where
        F: Future,
    {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled {
                operation: operation.to_string(),
            });
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(JobError::Cancelled {
                operation: operation.to_string(),
            }),
            res = tokio::time::timeout(self.call_timeout, fut) => res.map_err(|_| JobError::Timeout {
                operation: operation.to_string(),
                timeout: self.call_timeout,
            }),
        }
    }
}
