//! Device pool — the workers of one broadcast.
//!
//! A pool owns one worker per device, each with its own cancellation
//! channel, so teardown and eviction can stop a worker without cutting off
//! an in-flight send. Worker creation is read-fast-path / write-escalation
//! with a recheck, the same shape the manager uses for pools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sendlane_core::config::PoolConfig;
use sendlane_core::error::{Result, SendlaneError};
use sendlane_core::types::PoolKey;

use crate::worker::{DeviceWorker, WorkerContext};

/// How long a cancelled worker gets to finish its current message before
/// the task is aborted outright.
const DRAIN_TIMEOUT_SECS: u64 = 30;

/// Delivery tallies for one pool, bumped by its workers.
pub struct PoolCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    last_activity: AtomicI64,
}

impl PoolCounters {
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

impl Default for PoolCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Unix-timestamp activity marker for one worker, used to pick an eviction
/// victim when the pool hits its worker ceiling.
pub struct WorkerActivity(AtomicI64);

impl WorkerActivity {
    pub fn new() -> Self {
        Self(AtomicI64::new(Utc::now().timestamp()))
    }

    pub fn touch(&self) {
        self.0.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for WorkerActivity {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkerHandle {
    task: JoinHandle<()>,
    activity: Arc<WorkerActivity>,
    cancel: watch::Sender<bool>,
}

/// Operator-facing pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub key: String,
    pub user_id: String,
    pub workers: usize,
    pub sent: u64,
    pub failed: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: i64,
}

/// Workers for one broadcast, keyed by device id.
pub struct DevicePool {
    key: PoolKey,
    user_id: String,
    ctx: Arc<WorkerContext>,
    counters: Arc<PoolCounters>,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    max_workers: u32,
    idle_threshold_secs: u64,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("key", &self.key)
            .field("user_id", &self.user_id)
            .field("max_workers", &self.max_workers)
            .field("idle_threshold_secs", &self.idle_threshold_secs)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl DevicePool {
    pub fn new(
        key: PoolKey,
        user_id: impl Into<String>,
        ctx: Arc<WorkerContext>,
        config: &PoolConfig,
    ) -> Self {
        let idle_threshold_secs = ctx.delivery.idle_worker_secs;
        Self {
            key,
            user_id: user_id.into(),
            ctx,
            counters: Arc::new(PoolCounters::new()),
            workers: RwLock::new(HashMap::new()),
            max_workers: config.max_workers_per_pool,
            idle_threshold_secs,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    fn read_workers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_workers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Ensure a worker exists for `device_id`. Returns whether one was
    /// created. At the ceiling, the longest-idle worker beyond the idle
    /// threshold is recycled; with no such victim the request is rejected.
    pub fn get_or_create_worker(&self, device_id: &str) -> Result<bool> {
        if self.read_workers().contains_key(device_id) {
            return Ok(false);
        }

        let mut workers = self.write_workers();
        // recheck under the write lock
        if workers.contains_key(device_id) {
            return Ok(false);
        }
        workers.retain(|_, handle| !handle.task.is_finished());

        if workers.len() >= self.max_workers as usize {
            let cutoff = Utc::now().timestamp() - self.idle_threshold_secs as i64;
            let victim = workers
                .iter()
                .filter(|(_, h)| h.activity.last() <= cutoff)
                .min_by_key(|(_, h)| h.activity.last())
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    if let Some(WorkerHandle { task, cancel, .. }) = workers.remove(&id) {
                        // cancel and reap off to the side; the victim is
                        // idle, so it exits at its next poll boundary
                        let _ = cancel.send(true);
                        let abort = task.abort_handle();
                        tokio::spawn(async move {
                            let drain = Duration::from_secs(DRAIN_TIMEOUT_SECS);
                            if tokio::time::timeout(drain, task).await.is_err() {
                                abort.abort();
                            }
                        });
                        tracing::info!("🧹 Recycled idle worker {} in pool {}", id, self.key);
                    }
                }
                None => {
                    return Err(SendlaneError::CapacityExceeded(format!(
                        "pool {} already runs {} busy workers",
                        self.key, self.max_workers
                    )));
                }
            }
        }

        let activity = Arc::new(WorkerActivity::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let worker = DeviceWorker::new(
            device_id,
            self.ctx.clone(),
            self.counters.clone(),
            activity.clone(),
            cancel_rx,
        );
        let task = tokio::spawn(worker.run());
        workers.insert(device_id.to_string(), WorkerHandle { task, activity, cancel });
        tracing::info!("➕ Worker {} joined pool {}", device_id, self.key);
        Ok(true)
    }

    pub fn worker_count(&self) -> usize {
        self.read_workers().len()
    }

    /// Cancel every worker without waiting. Idle workers wake from their
    /// sleeps immediately; busy ones exit after the current message.
    pub fn signal_shutdown(&self) {
        for handle in self.read_workers().values() {
            let _ = handle.cancel.send(true);
        }
    }

    /// Stop every worker. Cancellation goes out first so loops exit at
    /// their next boundary, then each task gets a bounded drain window to
    /// finish an in-flight send before the abort.
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let drained: Vec<(String, JoinHandle<()>)> = self
            .write_workers()
            .drain()
            .map(|(device_id, handle)| (device_id, handle.task))
            .collect();
        for (device_id, task) in drained {
            let abort = task.abort_handle();
            let drain = Duration::from_secs(DRAIN_TIMEOUT_SECS);
            if tokio::time::timeout(drain, task).await.is_err() {
                tracing::warn!("Worker {} did not drain in time, aborting", device_id);
                abort.abort();
            }
            tracing::debug!("Worker {} detached from pool {}", device_id, self.key);
        }
        tracing::info!("🛑 Pool {} shut down", self.key);
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            key: self.key.to_string(),
            user_id: self.user_id.clone(),
            workers: self.worker_count(),
            sent: self.counters.sent(),
            failed: self.counters.failed(),
            created_at: self.created_at,
            last_activity: self.counters.last_activity(),
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
    use sendlane_core::error::SendFailure;
    use sendlane_core::traits::{MessageStore, Transport};
    use sendlane_core::types::{BroadcastKind, BroadcastMessage, MessageStatus, Recipient};
    use sendlane_scheduler::SequenceStateMachine;
    use sendlane_store::MemoryStore;

    fn context_with(
        transport: Arc<dyn Transport>,
        idle_worker_secs: u64,
    ) -> (Arc<MemoryStore>, Arc<WorkerContext>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            coord: store.clone(),
            transport,
            composer: Arc::new(TemplateComposer::new()),
            state_machine: Arc::new(SequenceStateMachine::new(store.clone())),
            delivery: DeliveryConfig {
                idle_worker_secs,
                min_delay_secs: 0,
                max_delay_secs: 0,
                ..DeliveryConfig::default()
            },
            process_id: "proc-test".into(),
        });
        (store, ctx)
    }

    fn context(idle_worker_secs: u64) -> Arc<WorkerContext> {
        context_with(Arc::new(DryRunTransport::new()), idle_worker_secs).1
    }

    fn pool_config(max_workers: u32) -> PoolConfig {
        PoolConfig { max_workers_per_pool: max_workers, ..PoolConfig::default() }
    }

    #[tokio::test]
    async fn test_worker_creation_is_idempotent() {
        let pool = DevicePool::new(PoolKey::campaign("c1"), "user-1", context(300), &pool_config(5));
        assert!(pool.get_or_create_worker("dev-a").unwrap());
        assert!(!pool.get_or_create_worker("dev-a").unwrap());
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_ceiling_recycles_idle_worker() {
        // idle threshold 0: any worker is immediately evictable
        let pool = DevicePool::new(PoolKey::campaign("c1"), "user-1", context(0), &pool_config(1));
        assert!(pool.get_or_create_worker("dev-a").unwrap());
        assert!(pool.get_or_create_worker("dev-b").unwrap());
        assert_eq!(pool.worker_count(), 1);
        assert!(pool.read_workers().contains_key("dev-b"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_ceiling_with_busy_workers_rejects() {
        // large idle threshold: nobody qualifies for eviction
        let pool =
            DevicePool::new(PoolKey::campaign("c1"), "user-1", context(3600), &pool_config(1));
        assert!(pool.get_or_create_worker("dev-a").unwrap());
        let err = pool.get_or_create_worker("dev-b").unwrap_err();
        assert!(matches!(err, SendlaneError::CapacityExceeded(_)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_empties_pool() {
        let pool = DevicePool::new(PoolKey::campaign("c1"), "user-1", context(300), &pool_config(5));
        pool.get_or_create_worker("dev-a").unwrap();
        pool.get_or_create_worker("dev-b").unwrap();
        pool.shutdown().await;
        assert_eq!(pool.worker_count(), 0);
    }

    /// Transport that takes a while per send, long enough for shutdown to
    /// land mid-delivery.
    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(
            &self,
            _device_id: &str,
            _recipient: &Recipient,
            _content: &str,
            _media_url: Option<&str>,
        ) -> std::result::Result<(), SendFailure> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }

        async fn is_connected(&self, _device_id: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_delivery() {
        let (store, ctx) = context_with(Arc::new(SlowTransport), 300);
        let msg = BroadcastMessage::new(
            "dev-a",
            BroadcastKind::Campaign,
            "c1",
            Recipient::new("+60100", "Ana"),
            "hi",
        );
        store.insert_message(&msg).await.unwrap();

        let pool = DevicePool::new(PoolKey::campaign("c1"), "user-1", ctx, &pool_config(5));
        pool.get_or_create_worker("dev-a").unwrap();

        // wait until the worker has flipped the row to queued, meaning the
        // slow send is underway
        let mut queued = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.message_status(&msg.id).await.unwrap() == Some(MessageStatus::Queued) {
                queued = true;
                break;
            }
        }
        assert!(queued);

        // shutdown must let the in-flight send finish instead of dropping
        // the row in queued
        pool.shutdown().await;
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(store.message_status(&msg.id).await.unwrap(), Some(MessageStatus::Sent));
    }
}
