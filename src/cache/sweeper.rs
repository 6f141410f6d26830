//! Background expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tiered::TieredCache;

/// Sweep `cache` every `interval` until `cancel` fires.
pub async fn run(cache: Arc<TieredCache>, interval: Duration, cancel: CancellationToken) {
    info!(interval = ?interval, "Cache sweeper started");
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    timer.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cache sweeper stopped");
                break;
            }
            _ = timer.tick() => {
                let report = cache.sweep();
                if report.demoted > 0 || report.dropped > 0 {
                    let sizes = cache.sizes();
                    debug!(
                        demoted = report.demoted,
                        dropped = report.dropped,
                        hot = sizes.hot,
                        warm = sizes.warm,
                        cold = sizes.cold,
                        "Swept expired cache entries"
                    );
                }
            }
        }
    }
}
