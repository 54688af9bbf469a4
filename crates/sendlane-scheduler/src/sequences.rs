//! Sequence triggering: due contacts become pending message rows, one per
//! (contact, step), under a per-contact claim that keeps concurrent
//! scheduler instances from double-sending.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use sendlane_core::config::SchedulerConfig;
use sendlane_core::error::Result;
use sendlane_core::traits::MessageStore;
use sendlane_core::types::{BroadcastKind, BroadcastMessage, DueContact};

/// Materializes due sequence steps. The claim taken here is held until the
/// device worker advances the contact after delivery (or the lease expires
/// and the reclaim pass frees it).
pub struct SequenceTrigger {
    store: Arc<dyn MessageStore>,
    claim_lease_secs: u64,
    batch_size: u32,
}

impl SequenceTrigger {
    pub fn new(store: Arc<dyn MessageStore>, config: &SchedulerConfig) -> Self {
        Self { store, claim_lease_secs: config.claim_lease_secs, batch_size: config.batch_size }
    }

    /// One scheduler tick. Returns how many messages were materialized.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u64> {
        // Free claims abandoned by crashed workers first, so their contacts
        // show up as due again in this same tick
        let stale = now - Duration::seconds(self.claim_lease_secs as i64);
        let reclaimed = self.store.reclaim_expired(stale).await?;
        if reclaimed > 0 {
            tracing::warn!("♻️ Reclaimed {} expired contact claims", reclaimed);
        }

        let due = self.store.due_contacts(now, self.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::debug!("⏰ {} sequence contacts due", due.len());

        // Connected-device lookups are per user; cache them for the batch
        let mut devices_by_user: HashMap<String, Vec<String>> = HashMap::new();
        let mut materialized = 0u64;
        for item in due {
            let devices = match devices_by_user.get(&item.user_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.store.connected_devices(&item.user_id).await?;
                    devices_by_user.insert(item.user_id.clone(), fetched.clone());
                    fetched
                }
            };
            if devices.is_empty() {
                // Contact stays due; a later tick picks it up once a device
                // reconnects
                continue;
            }

            let device = self.select_device(&item, &devices).await?;
            if !self.store.claim_contact(&item.contact.id, &device, now).await? {
                // Another scheduler instance claimed it between the due
                // query and now — silent loss
                continue;
            }

            if let Err(e) = self.materialize(&item, &device).await {
                tracing::warn!("Failed to enqueue step for contact {}: {e}", item.contact.id);
                self.store.release_claim(&item.contact.id).await?;
                continue;
            }
            materialized += 1;
        }

        if materialized > 0 {
            tracing::info!("📨 Materialized {} sequence messages", materialized);
        }
        Ok(materialized)
    }

    /// Stick to the device that already talked to this recipient when it is
    /// still connected; otherwise take the least-loaded connected device.
    async fn select_device(&self, item: &DueContact, devices: &[String]) -> Result<String> {
        if let Some(preferred) = &item.preferred_device
            && devices.contains(preferred)
        {
            return Ok(preferred.clone());
        }
        let mut best = devices[0].clone();
        let mut best_depth = self.store.pending_depth(&best).await?;
        for device in &devices[1..] {
            let depth = self.store.pending_depth(device).await?;
            if depth < best_depth {
                best = device.clone();
                best_depth = depth;
            }
        }
        Ok(best)
    }

    async fn materialize(&self, item: &DueContact, device: &str) -> Result<()> {
        let mut msg = BroadcastMessage::new(
            device,
            BroadcastKind::Sequence,
            &item.contact.sequence_id,
            item.contact.recipient.clone(),
            &item.step.content,
        );
        msg.media_url = item.step.media_url.clone();
        msg.min_delay_secs = item.step.min_delay_secs;
        msg.max_delay_secs = item.step.max_delay_secs;
        // One row per (contact, step) no matter how often triggering races
        msg.dedup_key = Some(format!("{}:{}", item.contact.id, item.step.trigger));
        self.store.insert_message(&msg).await
    }
}
