use std::time::Duration;

use {
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
};

/// Why a bounded wait was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    Cancelled,
}

/// A timer joined with the caller's cancellation token.
///
/// Every suspension point in the engine races its work against
/// [`Deadline::expired`], so timeout and cancellation share one code path and
/// differ only in the reported [`StopReason`].
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn after(budget: Duration, cancel: &CancellationToken) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
            cancel: cancel.clone(),
        }
    }

    /// The total time this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Resolves once the timer fires or the token is cancelled, whichever
    /// comes first. Cancellation wins a tie.
    pub async fn expired(&self) -> StopReason {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => StopReason::Cancelled,
            () = tokio::time::sleep_until(self.at) => StopReason::Timeout,
        }
    }
}
