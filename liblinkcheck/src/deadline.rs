use crate::types::ProbeError;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A point in time after which a batch gives up, plus a token that can
/// end it early.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self::with_cancel(timeout, CancellationToken::new())
    }

    pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            at: Instant::now() + timeout,
            cancel,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails fast if the budget is already spent.
    pub fn check(&self) -> Result<(), ProbeError> {
        if self.cancel.is_cancelled() {
            Err(ProbeError::Cancelled)
        } else if Instant::now() >= self.at {
            Err(ProbeError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ProbeError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProbeError::Cancelled),
            res = tokio::time::timeout_at(self.at, fut) => {
                res.map_err(|_| ProbeError::DeadlineExceeded)
            }
        }
    }
}
