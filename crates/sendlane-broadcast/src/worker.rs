//! Device worker — the only code path that actually transmits.
//!
//! One worker per (pool, device), sending strictly serially with a random
//! human-like pause between messages. Before every transmit the worker
//! re-verifies the row against the store and takes a per-message send lock
//! in the coordination store, so two processes draining the same device
//! cannot double-send.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use sendlane_core::config::DeliveryConfig;
use sendlane_core::error::Result;
use sendlane_core::traits::{Composer, CoordinationStore, MessageStore, Transport};
use sendlane_core::types::{BroadcastKind, BroadcastMessage, MessageStatus};
use sendlane_scheduler::SequenceStateMachine;

use crate::pool::{PoolCounters, WorkerActivity};

/// TTL on the per-message send lock; generously above any single send.
const SEND_LOCK_TTL_SECS: u64 = 300;

/// Poll interval when the device has no due work.
const IDLE_POLL_SECS: u64 = 5;

/// Everything a worker needs, shared across all workers of all pools.
pub struct WorkerContext {
    pub store: Arc<dyn MessageStore>,
    pub coord: Arc<dyn CoordinationStore>,
    pub transport: Arc<dyn Transport>,
    pub composer: Arc<dyn Composer>,
    pub state_machine: Arc<SequenceStateMachine>,
    pub delivery: DeliveryConfig,
    /// Lock owner identity for this engine process.
    pub process_id: String,
}

/// Serial sender for one device.
pub struct DeviceWorker {
    device_id: String,
    ctx: Arc<WorkerContext>,
    counters: Arc<PoolCounters>,
    activity: Arc<WorkerActivity>,
    cancel: watch::Receiver<bool>,
}

impl DeviceWorker {
    pub fn new(
        device_id: impl Into<String>,
        ctx: Arc<WorkerContext>,
        counters: Arc<PoolCounters>,
        activity: Arc<WorkerActivity>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self { device_id: device_id.into(), ctx, counters, activity, cancel }
    }

    /// Main loop: fetch a batch, send one by one with pacing, repeat.
    pub async fn run(mut self) {
        tracing::info!("👷 Worker started for device {}", self.device_id);
        let batch_size = self.ctx.delivery.batch_size.min(self.ctx.delivery.worker_queue_size);
        let mut since_backoff = 0u32;

        'outer: loop {
            if *self.cancel.borrow() {
                break;
            }
            let batch = match self.ctx.store.pending_for_device(&self.device_id, batch_size).await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!("Worker {} failed to fetch batch: {e}", self.device_id);
                    if self.wait(IDLE_POLL_SECS).await {
                        break;
                    }
                    continue;
                }
            };
            if batch.is_empty() {
                if self.wait(IDLE_POLL_SECS).await {
                    break;
                }
                continue;
            }

            for msg in &batch {
                if *self.cancel.borrow() {
                    break 'outer;
                }
                self.process_message(msg).await;
                self.counters.touch();
                self.activity.touch();

                since_backoff += 1;
                let backoff_every = self.ctx.delivery.batch_backoff_every;
                let pause = if backoff_every > 0 && since_backoff >= backoff_every {
                    since_backoff = 0;
                    tracing::debug!(
                        "😴 Device {} batch backoff ({}s)",
                        self.device_id,
                        self.ctx.delivery.batch_backoff_secs
                    );
                    self.ctx.delivery.batch_backoff_secs
                } else {
                    self.pacing_delay(msg)
                };
                if self.wait(pause).await {
                    break 'outer;
                }
            }
        }
        tracing::info!("👋 Worker for device {} stopped", self.device_id);
    }

    /// Random per-message pause, using the message's own bounds when it
    /// carries any and the configured fallback otherwise.
    fn pacing_delay(&self, msg: &BroadcastMessage) -> u64 {
        use rand::Rng;
        let (min, max) = if msg.max_delay_secs > 0 {
            (msg.min_delay_secs, msg.max_delay_secs)
        } else {
            (self.ctx.delivery.min_delay_secs, self.ctx.delivery.max_delay_secs)
        };
        if max <= min {
            return u64::from(min);
        }
        u64::from(rand::thread_rng().gen_range(min..=max))
    }

    /// Sleep `secs`, returning early with true if cancellation arrives.
    async fn wait(&mut self, secs: u64) -> bool {
        if secs == 0 {
            return *self.cancel.borrow();
        }
        tokio::select! {
            changed = self.cancel.changed() => {
                // a dropped sender means the pool is gone; stop either way
                changed.is_err() || *self.cancel.borrow()
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(secs)) => false,
        }
    }

    /// One message, end to end. Errors are logged, never fatal to the loop:
    /// the row stays in whatever state the store last agreed to and a later
    /// pass resolves it.
    async fn process_message(&self, msg: &BroadcastMessage) {
        // Re-verify against the shared store: another process may have
        // already delivered this row
        match self.ctx.store.message_status(&msg.id).await {
            Ok(Some(MessageStatus::Pending)) => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("Status check failed for message {}: {e}", msg.id);
                return;
            }
        }

        let lock_key = format!("send:{}", msg.id);
        match self.ctx.coord.try_acquire(&lock_key, &self.ctx.process_id, SEND_LOCK_TTL_SECS).await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Message {} locked by another process", msg.id);
                return;
            }
            Err(e) => {
                tracing::warn!("Send lock unavailable for message {}: {e}", msg.id);
                return;
            }
        }

        if let Err(e) = self.deliver(msg).await {
            tracing::error!("Delivery of message {} errored: {e}", msg.id);
        }
        if let Err(e) = self.ctx.coord.release(&lock_key, &self.ctx.process_id).await {
            tracing::warn!("Failed to release send lock for message {}: {e}", msg.id);
        }
    }

    async fn deliver(&self, msg: &BroadcastMessage) -> Result<()> {
        // Conditional flip to queued; losing it means someone else got here
        // between our status check and now
        if !self.ctx.store.mark_queued(&msg.id).await? {
            return Ok(());
        }

        if !self.ctx.transport.is_connected(&self.device_id).await {
            return self.handle_transient(msg, "device not connected").await;
        }

        let content = self.ctx.composer.render(&msg.content, &msg.recipient);
        match self
            .ctx
            .transport
            .send(&self.device_id, &msg.recipient, &content, msg.media_url.as_deref())
            .await
        {
            Ok(()) => {
                if self.ctx.store.mark_sent(&msg.id).await? {
                    self.counters.record_sent();
                    tracing::debug!("✅ {} → {}", self.device_id, msg.recipient.address);
                    if msg.kind == BroadcastKind::Sequence
                        && let Err(e) = self
                            .ctx
                            .state_machine
                            .advance_on_sent(&msg.reference_id, &msg.recipient.address, Utc::now())
                            .await
                    {
                        tracing::warn!(
                            "Sent but could not advance contact {} in sequence {}: {e}",
                            msg.recipient.address,
                            msg.reference_id
                        );
                    }
                }
                Ok(())
            }
            Err(failure) if failure.is_transient() => {
                self.handle_transient(msg, &failure.to_string()).await
            }
            Err(failure) => {
                self.ctx.store.mark_failed(&msg.id, &failure.to_string()).await?;
                self.counters.record_failed();
                tracing::warn!("🚫 Message {} failed permanently: {failure}", msg.id);
                if msg.kind == BroadcastKind::Sequence {
                    self.ctx
                        .state_machine
                        .pause_on_failure(&msg.reference_id, &msg.recipient.address)
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Retry with linear backoff until the attempt ceiling, then go
    /// terminal.
    async fn handle_transient(&self, msg: &BroadcastMessage, reason: &str) -> Result<()> {
        let attempts = msg.retry_count + 1;
        if attempts >= self.ctx.delivery.retry_attempts {
            self.ctx
                .store
                .mark_failed(&msg.id, &format!("retry budget exhausted: {reason}"))
                .await?;
            self.counters.record_failed();
            tracing::warn!("🚫 Message {} exhausted retries: {reason}", msg.id);
            if msg.kind == BroadcastKind::Sequence {
                self.ctx
                    .state_machine
                    .pause_on_failure(&msg.reference_id, &msg.recipient.address)
                    .await?;
            }
        } else {
            let backoff = self.ctx.delivery.retry_delay_secs * u64::from(attempts);
            let not_before = Utc::now() + Duration::seconds(backoff as i64);
            self.ctx.store.schedule_retry(&msg.id, not_before).await?;
            tracing::debug!(
                "🔁 Message {} retry {}/{} in {}s ({reason})",
                msg.id,
                attempts,
                self.ctx.delivery.retry_attempts,
                backoff
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sendlane_core::error::SendFailure;
    use sendlane_core::types::{ContactStatus, Recipient, Sequence, SequenceStep};
    use sendlane_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Mode {
        Succeed,
        FailTransient,
        FailPermanent,
    }

    struct RecordingTransport {
        sends: AtomicU32,
        mode: Mode,
    }

    impl RecordingTransport {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self { sends: AtomicU32::new(0), mode })
        }
        fn send_count(&self) -> u32 {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            _device_id: &str,
            _recipient: &Recipient,
            _content: &str,
            _media_url: Option<&str>,
        ) -> std::result::Result<(), SendFailure> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Succeed => Ok(()),
                Mode::FailTransient => Err(SendFailure::Transient("timeout".into())),
                Mode::FailPermanent => Err(SendFailure::Permanent("bad recipient".into())),
            }
        }

        async fn is_connected(&self, _device_id: &str) -> bool {
            true
        }
    }

    fn sequence() -> Sequence {
        Sequence {
            id: "seq-1".into(),
            user_id: "user-1".into(),
            name: "warmup".into(),
            active: true,
            steps: vec![
                SequenceStep {
                    trigger: "day1".into(),
                    next_trigger: "day2".into(),
                    delay_hours: 24,
                    entry_point: true,
                    content: "welcome {name}".into(),
                    media_url: None,
                    min_delay_secs: 0,
                    max_delay_secs: 0,
                },
                SequenceStep {
                    trigger: "day2".into(),
                    next_trigger: String::new(),
                    delay_hours: 0,
                    entry_point: false,
                    content: "followup".into(),
                    media_url: None,
                    min_delay_secs: 0,
                    max_delay_secs: 0,
                },
            ],
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        transport: Arc<RecordingTransport>,
        worker: DeviceWorker,
        _cancel_tx: watch::Sender<bool>,
    }

    fn rig_with_delivery(mode: Mode, delivery: DeliveryConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let transport = RecordingTransport::new(mode);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            coord: store.clone(),
            transport: transport.clone(),
            composer: Arc::new(crate::composer::TemplateComposer::new()),
            state_machine: Arc::new(SequenceStateMachine::new(store.clone())),
            delivery,
            process_id: "proc-test".into(),
        });
        let counters = Arc::new(PoolCounters::new());
        let activity = Arc::new(WorkerActivity::new());
        let worker = DeviceWorker::new("dev-1", ctx, counters, activity, cancel_rx);
        Rig { store, transport, worker, _cancel_tx: cancel_tx }
    }

    fn rig(mode: Mode, retry_attempts: u32) -> Rig {
        rig_with_delivery(
            mode,
            DeliveryConfig {
                min_delay_secs: 0,
                max_delay_secs: 0,
                retry_attempts,
                ..DeliveryConfig::default()
            },
        )
    }

    fn seq_message(retry_count: u32) -> BroadcastMessage {
        let mut msg = BroadcastMessage::new(
            "dev-1",
            BroadcastKind::Sequence,
            "seq-1",
            Recipient::new("+60123", "Ana"),
            "welcome {name}",
        );
        msg.retry_count = retry_count;
        msg
    }

    async fn enroll(store: &Arc<MemoryStore>) {
        store.add_sequence(sequence());
        store
            .enroll_contact("seq-1", &Recipient::new("+60123", "Ana"), "day1", Utc::now())
            .await
            .unwrap();
    }

    #[test]
    fn test_pacing_honors_message_bounds() {
        let rig = rig(Mode::Succeed, 3);
        let mut msg = seq_message(0);
        msg.min_delay_secs = 5;
        msg.max_delay_secs = 15;
        for _ in 0..200 {
            let delay = rig.worker.pacing_delay(&msg);
            assert!((5..=15).contains(&delay), "delay {delay} outside message bounds");
        }
    }

    #[test]
    fn test_pacing_falls_back_to_config_bounds() {
        let rig = rig_with_delivery(
            Mode::Succeed,
            DeliveryConfig { min_delay_secs: 20, max_delay_secs: 40, ..DeliveryConfig::default() },
        );
        // message carries no bounds of its own
        let msg = seq_message(0);
        for _ in 0..200 {
            let delay = rig.worker.pacing_delay(&msg);
            assert!((20..=40).contains(&delay), "delay {delay} outside config bounds");
        }
    }

    #[test]
    fn test_pacing_degenerate_range_yields_min() {
        let rig = rig(Mode::Succeed, 3);
        let mut msg = seq_message(0);
        msg.min_delay_secs = 30;
        msg.max_delay_secs = 30;
        assert_eq!(rig.worker.pacing_delay(&msg), 30);
    }

    #[tokio::test]
    async fn test_send_marks_sent_and_advances_contact() {
        let rig = rig(Mode::Succeed, 3);
        enroll(&rig.store).await;
        let msg = seq_message(0);
        rig.store.insert_message(&msg).await.unwrap();

        rig.worker.process_message(&msg).await;

        assert_eq!(rig.transport.send_count(), 1);
        assert_eq!(rig.store.message_status(&msg.id).await.unwrap(), Some(MessageStatus::Sent));
        let contact = rig.store.find_contact("seq-1", "+60123").await.unwrap().unwrap();
        assert_eq!(contact.current_trigger, "day2");
    }

    #[tokio::test]
    async fn test_foreign_send_lock_blocks_transmit() {
        let rig = rig(Mode::Succeed, 3);
        let msg = seq_message(0);
        rig.store.insert_message(&msg).await.unwrap();
        // another engine process holds the send lock for this row
        assert!(rig
            .store
            .try_acquire(&format!("send:{}", msg.id), "proc-other", 60)
            .await
            .unwrap());

        rig.worker.process_message(&msg).await;

        assert_eq!(rig.transport.send_count(), 0);
        assert_eq!(rig.store.message_status(&msg.id).await.unwrap(), Some(MessageStatus::Pending));
    }

    #[tokio::test]
    async fn test_terminal_row_short_circuits() {
        let rig = rig(Mode::Succeed, 3);
        let msg = seq_message(0);
        rig.store.insert_message(&msg).await.unwrap();
        rig.store.mark_sent(&msg.id).await.unwrap();

        rig.worker.process_message(&msg).await;
        assert_eq!(rig.transport.send_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let rig = rig(Mode::FailTransient, 3);
        let msg = seq_message(0);
        rig.store.insert_message(&msg).await.unwrap();

        rig.worker.process_message(&msg).await;

        let stored = rig.store.messages().into_iter().find(|m| m.id == msg.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.scheduled_at > Utc::now());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_and_pauses_contact() {
        let rig = rig(Mode::FailTransient, 2);
        enroll(&rig.store).await;
        // already retried once; this attempt is the last allowed
        let msg = seq_message(1);
        rig.store.insert_message(&msg).await.unwrap();

        rig.worker.process_message(&msg).await;

        assert_eq!(rig.store.message_status(&msg.id).await.unwrap(), Some(MessageStatus::Failed));
        let contact = rig.store.find_contact("seq-1", "+60123").await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Paused);
    }

    #[tokio::test]
    async fn test_permanent_failure_pauses_contact_immediately() {
        let rig = rig(Mode::FailPermanent, 3);
        enroll(&rig.store).await;
        let msg = seq_message(0);
        rig.store.insert_message(&msg).await.unwrap();

        rig.worker.process_message(&msg).await;

        assert_eq!(rig.transport.send_count(), 1);
        assert_eq!(rig.store.message_status(&msg.id).await.unwrap(), Some(MessageStatus::Failed));
        let contact = rig.store.find_contact("seq-1", "+60123").await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Paused);
    }
}
