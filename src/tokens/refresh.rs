//! Background Refresh Loop
//!
//! One long-lived task re-derives the pool on a fixed interval. The wait is
//! cancellable through a `watch` channel so shutdown does not have to sit out
//! the rest of the interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::TokenPool;

/// Spawn the refresh loop
///
/// The startup refresh is expected to have run already, so the first cycle
/// fires one `interval` after spawning. The task exits when `shutdown`
/// becomes `true` or its sender is dropped.
pub fn spawn_refresh_loop(
    pool: Arc<TokenPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Token refresh loop started, interval {:?}", interval);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            // A cycle only publishes through one atomic replace, so dropping
            // it mid-flight leaves the previous pool in place.
            tokio::select! {
                biased;
                _ = stop_requested(&mut shutdown) => {
                    tracing::info!("Shutdown requested, abandoning refresh cycle in flight");
                    break;
                }
                outcome = pool.refresh() => {
                    tracing::debug!("Scheduled refresh finished: {:?}", outcome);
                }
            }
        }

        tracing::info!("Token refresh loop stopped");
    })
}

/// Resolves once `shutdown` holds `true` or its sender is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
