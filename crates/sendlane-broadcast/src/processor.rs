//! Pending-row processor — the dispatch loop that keeps pools and workers
//! alive for whatever the schedulers materialized.
//!
//! The store is the queue: this loop only asks "which (device, broadcast)
//! pairs have due pending rows" and makes sure a worker exists for each.
//! Workers do the draining themselves.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;

use sendlane_core::config::SchedulerConfig;
use sendlane_core::error::{Result, SendlaneError};
use sendlane_core::traits::MessageStore;

use crate::manager::BroadcastManager;

/// How often the dispatch loop looks for new pending work.
const DISPATCH_INTERVAL_SECS: u64 = 15;

/// How often the stale-message sweep runs.
const EXPIRY_SWEEP_SECS: u64 = 3600;

/// One dispatch pass: resolve every pending assignment to a pool and a
/// worker. Capacity rejections are logged and skipped; the rows stay
/// pending and a later pass retries them.
pub async fn dispatch_once(
    manager: &Arc<BroadcastManager>,
    store: &Arc<dyn MessageStore>,
) -> Result<usize> {
    let assignments = store.pending_assignments().await?;
    let mut dispatched = 0;
    for assignment in assignments {
        let pool = match manager.get_or_create_pool(&assignment.key, &assignment.user_id) {
            Ok(pool) => pool,
            Err(SendlaneError::CapacityExceeded(msg)) => {
                tracing::warn!("Deferring {}: {msg}", assignment.key);
                continue;
            }
            Err(e) => return Err(e),
        };
        match pool.get_or_create_worker(&assignment.device_id) {
            Ok(_) => dispatched += 1,
            Err(SendlaneError::CapacityExceeded(msg)) => {
                tracing::warn!("Deferring device {}: {msg}", assignment.device_id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(dispatched)
}

/// Spawn the dispatch loop plus the hourly sweep that fails messages stuck
/// pending/queued beyond the expiry window.
pub fn start_broadcast_processor(
    manager: Arc<BroadcastManager>,
    store: Arc<dyn MessageStore>,
    config: SchedulerConfig,
) -> JoinHandle<()> {
    tracing::info!(
        "🚚 Broadcast processor started (dispatch every {}s, expiry {}h)",
        DISPATCH_INTERVAL_SECS,
        config.message_expiry_hours
    );
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(DISPATCH_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_sweep = std::time::Instant::now();
        loop {
            interval.tick().await;
            if let Err(e) = dispatch_once(&manager, &store).await {
                tracing::error!("Dispatch pass failed: {e}");
            }

            if last_sweep.elapsed().as_secs() >= EXPIRY_SWEEP_SECS {
                last_sweep = std::time::Instant::now();
                let cutoff =
                    Utc::now() - Duration::hours(i64::from(config.message_expiry_hours));
                match store.expire_stale(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => tracing::warn!("⌛ Expired {} undeliverable messages", n),
                    Err(e) => tracing::error!("Expiry sweep failed: {e}"),
                }
            }
        }
    })
}
