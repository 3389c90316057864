//! Owned periodic background task with a stop signal and a join on shutdown.

use std::{future::Future, time::Duration};

use {
    tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

/// Runs `tick` once immediately and then every `interval` until stopped.
///
/// A tick in progress is allowed to finish; no tick starts after
/// [`Sweeper::shutdown`] has been called.
pub struct Sweeper {
    name: &'static str,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(sweeper = name, "sweeper stopped");
        });
        debug!(sweeper = name, interval_ms = interval.as_millis() as u64, "sweeper started");
        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(sweeper = self.name, error = %e, "sweeper task did not exit cleanly");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        // Without a join the task still exits at its next select.
        self.cancel.cancel();
    }
}
