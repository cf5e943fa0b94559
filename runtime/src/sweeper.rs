//! Periodic outbox sweeping on a tokio interval.

use crate::outbox::{OutboxProducerMediator, SweepOptions};
use courier_core::outbox::OutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs [`OutboxProducerMediator::sweep`] every `interval` until cancelled.
///
/// # Example
///
/// ```no_run
/// # use courier_runtime::outbox::OutboxProducerMediator;
/// # use courier_runtime::sweeper::TimedOutboxSweeper;
/// # use courier_core::outbox::OutboxStore;
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use tokio_util::sync::CancellationToken;
/// # async fn example<S: OutboxStore + 'static>(mediator: Arc<OutboxProducerMediator<S>>) {
/// let shutdown = CancellationToken::new();
/// let options = mediator.sweep_options();
/// let interval = Duration::from_secs(5);
/// let sweeper = TimedOutboxSweeper::spawn(mediator, interval, options, shutdown.clone());
///
/// // later
/// shutdown.cancel();
/// let _ = sweeper.await;
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TimedOutboxSweeper;

impl TimedOutboxSweeper {
    /// Spawn the sweep loop on the current runtime.
    ///
    /// Sweep errors are logged and the loop carries on. A zero `interval` is raised to one
    /// millisecond.
    #[must_use = "dropping the handle detaches the sweeper; cancel the token to stop it"]
    pub fn spawn<S>(
        mediator: Arc<OutboxProducerMediator<S>>,
        interval: Duration,
        options: SweepOptions,
        cancellation: CancellationToken,
    ) -> JoinHandle<()>
    where
        S: OutboxStore + 'static,
    {
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval = ?period, "Outbox sweeper started");

            loop {
                tokio::select! {
                    biased;
                    () = cancellation.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = mediator.sweep(&options).await {
                            tracing::error!(error = %err, "Outbox sweep failed");
                        }
                    }
                }
            }
            tracing::info!("Outbox sweeper stopped");
        })
    }
}
