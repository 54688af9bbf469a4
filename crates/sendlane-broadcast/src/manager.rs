//! Broadcast manager — the process-wide registry of device pools.
//!
//! Pools exist only while their broadcast has work: creation is lazy and
//! double-checked, completion is monitored per pool, and teardown removes
//! the key and cancels the workers under one write lock so no caller can
//! grab a half-dead pool. The drain itself happens after the lock drops.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use sendlane_core::config::PoolConfig;
use sendlane_core::error::{Result, SendlaneError};
use sendlane_core::types::{BroadcastKind, PoolKey};

use crate::pool::{DevicePool, PoolStatus};
use crate::worker::WorkerContext;

static MANAGER: OnceLock<Arc<BroadcastManager>> = OnceLock::new();

/// Registry of live pools plus the shared worker context they all run on.
pub struct BroadcastManager {
    pools: RwLock<HashMap<PoolKey, Arc<DevicePool>>>,
    ctx: Arc<WorkerContext>,
    config: PoolConfig,
}

impl BroadcastManager {
    /// Build a manager after verifying the coordination store answers.
    /// There is no degraded single-process mode: an unreachable
    /// coordination store at startup is fatal.
    pub async fn connect(ctx: Arc<WorkerContext>, config: PoolConfig) -> Result<Arc<Self>> {
        ctx.coord.ping().await.map_err(|e| {
            SendlaneError::Coordination(format!(
                "refusing to start without shared coordination: {e}"
            ))
        })?;
        Ok(Arc::new(Self { pools: RwLock::new(HashMap::new()), ctx, config }))
    }

    /// Connect and install as the process-wide instance. Must be called
    /// exactly once, before anything asks for [`BroadcastManager::global`].
    pub async fn initialize(ctx: Arc<WorkerContext>, config: PoolConfig) -> Result<Arc<Self>> {
        let manager = Self::connect(ctx, config).await?;
        MANAGER
            .set(manager.clone())
            .map_err(|_| SendlaneError::Config("broadcast manager already initialized".into()))?;
        tracing::info!("📡 Broadcast manager initialized");
        Ok(manager)
    }

    /// The process-wide instance, if initialized.
    pub fn global() -> Option<Arc<Self>> {
        MANAGER.get().cloned()
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PoolKey, Arc<DevicePool>>> {
        self.pools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_pools(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PoolKey, Arc<DevicePool>>> {
        self.pools.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Pool for one broadcast, creating it on first sight. Double-checked:
    /// the common hit path takes only the read lock.
    pub fn get_or_create_pool(
        self: &Arc<Self>,
        key: &PoolKey,
        user_id: &str,
    ) -> Result<Arc<DevicePool>> {
        if let Some(pool) = self.read_pools().get(key) {
            return Ok(pool.clone());
        }

        let mut pools = self.write_pools();
        if let Some(pool) = pools.get(key) {
            return Ok(pool.clone());
        }

        let owned = pools.values().filter(|p| p.user_id() == user_id).count();
        if owned >= self.config.max_pools_per_user as usize {
            return Err(SendlaneError::CapacityExceeded(format!(
                "user {user_id} already runs {owned} pools"
            )));
        }

        let pool =
            Arc::new(DevicePool::new(key.clone(), user_id, self.ctx.clone(), &self.config));
        pools.insert(key.clone(), pool.clone());
        tracing::info!("🏊 Pool {} created for user {}", key, user_id);
        self.spawn_completion_monitor(key.clone());
        Ok(pool)
    }

    /// Watches one broadcast until every row is terminal, logs progress
    /// along the way, then tears the pool down after a grace window.
    fn spawn_completion_monitor(self: &Arc<Self>, key: PoolKey) {
        let manager = self.clone();
        let check_secs = self.config.completion_check_secs.max(1);
        let progress_secs = self.config.progress_log_secs.max(1);
        let grace_secs = self.config.pool_cleanup_grace_secs;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(check_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_progress = std::time::Instant::now();
            loop {
                interval.tick().await;
                if !manager.read_pools().contains_key(&key) {
                    break;
                }
                let counts = match manager.ctx.store.broadcast_counts(&key).await {
                    Ok(counts) => counts,
                    Err(e) => {
                        tracing::warn!("Completion check for {} failed: {e}", key);
                        continue;
                    }
                };
                if counts.total > 0 && last_progress.elapsed().as_secs() >= progress_secs {
                    last_progress = std::time::Instant::now();
                    tracing::info!(
                        "📊 {} progress: {:.1}% ({} sent, {} failed, {} remaining)",
                        key,
                        counts.completion_percent(),
                        counts.sent,
                        counts.failed,
                        counts.pending + counts.queued
                    );
                }
                if counts.is_terminal() {
                    tracing::info!(
                        "✅ Broadcast {} complete, tearing down in {}s",
                        key,
                        grace_secs
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(grace_secs)).await;
                    // a retry reschedule may have re-opened rows during the
                    // grace window
                    match manager.ctx.store.broadcast_counts(&key).await {
                        Ok(counts) if counts.is_terminal() => {
                            manager.teardown_pool(&key).await;
                            break;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!("Completion re-check for {} failed: {e}", key);
                            continue;
                        }
                    }
                }
            }
        });
    }

    /// Remove the pool and stop its workers. Returns whether a pool was
    /// actually registered. A completed campaign is flipped to sent here —
    /// the pool's end is the campaign's end.
    pub async fn teardown_pool(&self, key: &PoolKey) -> bool {
        let removed = {
            let mut pools = self.write_pools();
            let pool = pools.remove(key);
            // cancel inside the lock: nobody can re-fetch this pool while
            // its workers are being stopped
            if let Some(pool) = &pool {
                pool.signal_shutdown();
            }
            pool
        };
        let Some(pool) = removed else {
            return false;
        };
        // the drain happens outside the lock, so other pools stay reachable
        // while these workers finish their in-flight sends
        pool.shutdown().await;

        if key.kind == BroadcastKind::Campaign {
            match self.ctx.store.broadcast_counts(key).await {
                Ok(counts) if counts.is_terminal() => {
                    if let Err(e) = self.ctx.store.mark_campaign_sent(&key.broadcast_id).await {
                        tracing::warn!("Could not finalize campaign {}: {e}", key.broadcast_id);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Count check for {} failed: {e}", key),
            }
        }
        tracing::info!("🗑️ Pool {} torn down", key);
        true
    }

    /// Operator escape hatch: same as teardown, regardless of completion.
    pub async fn force_cleanup(&self, key: &PoolKey) -> bool {
        tracing::warn!("Force cleanup requested for pool {}", key);
        self.teardown_pool(key).await
    }

    /// Live message counts for one broadcast, for the operator surface
    /// (completion percentage comes from the counts).
    pub async fn broadcast_progress(
        &self,
        key: &PoolKey,
    ) -> Result<sendlane_core::types::BroadcastCounts> {
        self.ctx.store.broadcast_counts(key).await
    }

    pub fn list_pools(&self) -> Vec<PoolStatus> {
        self.read_pools().values().map(|p| p.status()).collect()
    }

    pub fn pool_status(&self, key: &PoolKey) -> Option<PoolStatus> {
        self.read_pools().get(key).map(|p| p.status())
    }

    pub fn pool_count(&self) -> usize {
        self.read_pools().len()
    }

    /// Stop every pool; used on process shutdown. Cancellation goes out to
    /// all workers up front, then each pool drains in turn.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(PoolKey, Arc<DevicePool>)> = {
            let mut pools = self.write_pools();
            let drained: Vec<_> = pools.drain().collect();
            for (_, pool) in &drained {
                pool.signal_shutdown();
            }
            drained
        };
        for (key, pool) in drained {
            pool.shutdown().await;
            tracing::debug!("Pool {} stopped during shutdown", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::TemplateComposer;
    use crate::transport::DryRunTransport;
    use async_trait::async_trait;
    use sendlane_core::config::DeliveryConfig;
    use sendlane_core::traits::{CoordinationStore, MessageStore};
    use sendlane_core::types::{
        BroadcastMessage, Campaign, CampaignStatus, Recipient, TargetFilter,
    };
    use sendlane_scheduler::SequenceStateMachine;
    use sendlane_store::MemoryStore;

    fn context() -> (Arc<MemoryStore>, Arc<WorkerContext>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            coord: store.clone(),
            transport: Arc::new(DryRunTransport::new()),
            composer: Arc::new(TemplateComposer::new()),
            state_machine: Arc::new(SequenceStateMachine::new(store.clone())),
            delivery: DeliveryConfig::default(),
            process_id: "proc-test".into(),
        });
        (store, ctx)
    }

    #[tokio::test]
    async fn test_pool_registry_converges() {
        let (_, ctx) = context();
        let manager = BroadcastManager::connect(ctx, PoolConfig::default()).await.unwrap();
        let key = PoolKey::campaign("c1");
        let a = manager.get_or_create_pool(&key, "user-1").unwrap();
        let b = manager.get_or_create_pool(&key, "user-1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.pool_count(), 1);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_per_user_pool_ceiling() {
        let (_, ctx) = context();
        let config = PoolConfig { max_pools_per_user: 2, ..PoolConfig::default() };
        let manager = BroadcastManager::connect(ctx, config).await.unwrap();
        manager.get_or_create_pool(&PoolKey::campaign("c1"), "user-1").unwrap();
        manager.get_or_create_pool(&PoolKey::campaign("c2"), "user-1").unwrap();

        let err = manager.get_or_create_pool(&PoolKey::campaign("c3"), "user-1").unwrap_err();
        assert!(matches!(err, SendlaneError::CapacityExceeded(_)));
        // a different user is unaffected
        manager.get_or_create_pool(&PoolKey::campaign("c3"), "user-2").unwrap();
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_teardown_removes_key_and_next_create_is_fresh() {
        let (_, ctx) = context();
        let manager = BroadcastManager::connect(ctx, PoolConfig::default()).await.unwrap();
        let key = PoolKey::sequence("s1");
        let first = manager.get_or_create_pool(&key, "user-1").unwrap();
        assert!(manager.teardown_pool(&key).await);
        assert!(!manager.teardown_pool(&key).await);

        let second = manager.get_or_create_pool(&key, "user-1").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_teardown_finalizes_completed_campaign() {
        let (store, ctx) = context();
        store.add_campaign(Campaign {
            id: "c1".into(),
            user_id: "user-1".into(),
            title: "promo".into(),
            content: "hi".into(),
            media_url: None,
            target: TargetFilter { audience: "all".into(), stage: None },
            scheduled_at: chrono::Utc::now(),
            min_delay_secs: 1,
            max_delay_secs: 2,
            status: CampaignStatus::Processing,
        });
        let msg = BroadcastMessage::new(
            "dev-1",
            BroadcastKind::Campaign,
            "c1",
            Recipient::new("+60100", "Ana"),
            "hi",
        );
        store.insert_message(&msg).await.unwrap();
        store.mark_sent(&msg.id).await.unwrap();

        let manager = BroadcastManager::connect(ctx, PoolConfig::default()).await.unwrap();
        let key = PoolKey::campaign("c1");
        manager.get_or_create_pool(&key, "user-1").unwrap();
        assert!(manager.teardown_pool(&key).await);
        assert_eq!(store.campaign_status("c1"), Some(CampaignStatus::Sent));
    }

    struct DeadCoordination;

    #[async_trait]
    impl CoordinationStore for DeadCoordination {
        async fn ping(&self) -> sendlane_core::error::Result<()> {
            Err(SendlaneError::Coordination("connection refused".into()))
        }
        async fn try_acquire(
            &self,
            _key: &str,
            _owner: &str,
            _ttl_secs: u64,
        ) -> sendlane_core::error::Result<bool> {
            Ok(false)
        }
        async fn release(&self, _key: &str, _owner: &str) -> sendlane_core::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dead_coordination_store_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            coord: Arc::new(DeadCoordination),
            transport: Arc::new(DryRunTransport::new()),
            composer: Arc::new(TemplateComposer::new()),
            state_machine: Arc::new(SequenceStateMachine::new(store)),
            delivery: DeliveryConfig::default(),
            process_id: "proc-test".into(),
        });
        let result = BroadcastManager::connect(ctx, PoolConfig::default()).await;
        assert!(matches!(result, Err(SendlaneError::Coordination(_))));
    }
}
