//! Background jobs owned by a service.
//!
//! A [`ScheduledTask`] is either periodic ([`ScheduledTask::every`]) or
//! one-shot after a delay ([`ScheduledTask::after`]). All timing goes through
//! `tokio::time`, so a paused test clock drives it deterministically.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shortest period a periodic job may run at. `tokio::time::interval`
/// rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a spawned background job. Dropping it cancels the job.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `job` every `period`, starting one period from now.
    ///
    /// A zero `period` is raised to one millisecond.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = if period.is_zero() {
            warn!(task = name, "Zero period requested, running every {MIN_PERIOD:?}");
            MIN_PERIOD
        } else {
            period
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = timer.tick() => job().await,
                    () = token.cancelled() => {
                        debug!(task = name, "Periodic task stopped");
                        return;
                    }
                }
            }
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Run `job` once after `delay`, unless stopped first.
    pub fn after<Fut>(name: &'static str, delay: Duration, job: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    debug!(task = name, "Delayed task cancelled before start");
                    return;
                }
            }
            // The job itself observes cancellation through its own token.
            job.await;
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the job has run to completion (or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the job and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
            && e.is_panic()
        {
            warn!(task = self.name, error = %e, "Scheduled task panicked");
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
