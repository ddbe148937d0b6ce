//! The one-second scheduler loop.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tideway_common::METRIC_INTERVAL;

use crate::session::SessionRegistry;

/// Wake every [`METRIC_INTERVAL`] and run one broadcast → reap → tune pass
/// under the session mutex. Actuator calls run while the lock is held; the
/// fleet driver's short per-host timeouts keep one dead host from stalling
/// the loop for long.
pub async fn run_ticker(session: Arc<Mutex<SessionRegistry>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRIC_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("tick loop stopping");
                return;
            }
            _ = interval.tick() => {
                session.lock().await.tick().await;
            }
        }
    }
}
