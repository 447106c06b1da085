use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::Engine;

/// Periodically closes open attempts whose deadline has passed, so expiry
/// does not depend on the client coming back.
pub fn spawn(engine: Engine, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.sweep_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(expired = n, "expired exam attempts finalized"),
                Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
            }
        }
    })
}
