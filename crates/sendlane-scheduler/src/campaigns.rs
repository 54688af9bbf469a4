//! Campaign triggering: due campaigns fan out into pending message rows,
//! spread round-robin across the owner's connected devices.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use sendlane_core::error::Result;
use sendlane_core::traits::MessageStore;
use sendlane_core::types::{BroadcastKind, BroadcastMessage, Campaign};

/// Materializes due campaigns. Safe to run concurrently in several
/// processes: the processing-status flip is the idempotency guard, and the
/// loser of that race skips the campaign entirely.
pub struct CampaignTrigger {
    store: Arc<dyn MessageStore>,
}

impl CampaignTrigger {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// One scheduler tick. Returns how many messages were materialized.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u64> {
        let due = self.store.due_campaigns(now).await?;
        let mut materialized = 0;
        for campaign in due {
            materialized += self.trigger(&campaign).await?;
        }
        Ok(materialized)
    }

    async fn trigger(&self, campaign: &Campaign) -> Result<u64> {
        // Conditional flip to processing; the losing scheduler instance
        // sees false and walks away
        if !self.store.mark_campaign_processing(&campaign.id).await? {
            tracing::debug!("Campaign {} already claimed elsewhere", campaign.id);
            return Ok(0);
        }

        let audience = self.store.campaign_audience(campaign).await?;
        if audience.is_empty() {
            tracing::warn!(
                "📭 Campaign '{}' matched no recipients, marking sent",
                campaign.title
            );
            self.store.mark_campaign_sent(&campaign.id).await?;
            return Ok(0);
        }

        let devices = self.store.connected_devices(&campaign.user_id).await?;
        if devices.is_empty() {
            // Nothing can deliver right now; put the campaign back so the
            // next tick retries once a device reconnects
            tracing::warn!(
                "🔌 No connected devices for campaign '{}', deferring",
                campaign.title
            );
            self.store.reset_campaign_pending(&campaign.id).await?;
            return Ok(0);
        }

        let mut inserted = 0u64;
        for (i, recipient) in audience.iter().enumerate() {
            let device = &devices[i % devices.len()];
            let mut msg = BroadcastMessage::new(
                device,
                BroadcastKind::Campaign,
                &campaign.id,
                recipient.clone(),
                &campaign.content,
            );
            msg.media_url = campaign.media_url.clone();
            msg.min_delay_secs = campaign.min_delay_secs;
            msg.max_delay_secs = campaign.max_delay_secs;
            // A re-run after a partial failure re-inserts only the missing rows
            msg.dedup_key = Some(format!("{}:{}", campaign.id, recipient.address));
            if let Err(e) = self.store.insert_message(&msg).await {
                // Put the campaign back to pending before surfacing the
                // error: the next tick re-runs the fan-out and the dedup
                // keys skip the rows that already landed
                tracing::warn!(
                    "Fan-out of campaign '{}' interrupted after {} rows, deferring: {e}",
                    campaign.title,
                    inserted
                );
                self.store.reset_campaign_pending(&campaign.id).await?;
                return Err(e);
            }
            inserted += 1;
        }

        tracing::info!(
            "📢 Campaign '{}' materialized: {} messages across {} devices",
            campaign.title,
            inserted,
            devices.len()
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sendlane_core::types::{CampaignStatus, Recipient, TargetFilter};
    use sendlane_store::MemoryStore;
    use std::collections::HashMap;

    fn campaign() -> Campaign {
        Campaign {
            id: "c1".into(),
            user_id: "user-1".into(),
            title: "spring promo".into(),
            content: "hello {name}".into(),
            media_url: None,
            target: TargetFilter { audience: "fitness".into(), stage: None },
            scheduled_at: Utc::now() - Duration::minutes(1),
            min_delay_secs: 5,
            max_delay_secs: 15,
            status: CampaignStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_round_robin_across_devices() {
        let store = Arc::new(MemoryStore::new());
        store.add_campaign(campaign());
        for i in 0..3 {
            store.add_audience_member("fitness", "", Recipient::new(format!("+601{i}"), "x"));
        }
        store.add_device("user-1", "dev-a", true);
        store.add_device("user-1", "dev-b", true);
        store.add_device("user-1", "dev-offline", false);

        let trigger = CampaignTrigger::new(store.clone());
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 3);
        assert_eq!(store.campaign_status("c1"), Some(CampaignStatus::Processing));

        let mut per_device: HashMap<String, usize> = HashMap::new();
        for msg in store.messages() {
            *per_device.entry(msg.device_id).or_default() += 1;
        }
        // 3 recipients over 2 connected devices: 2 + 1, offline one unused
        assert_eq!(per_device.get("dev-a"), Some(&2));
        assert_eq!(per_device.get("dev-b"), Some(&1));
        assert!(!per_device.contains_key("dev-offline"));
    }

    #[tokio::test]
    async fn test_retrigger_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        store.add_campaign(campaign());
        store.add_audience_member("fitness", "", Recipient::new("+60100", "x"));
        store.add_device("user-1", "dev-a", true);

        let trigger = CampaignTrigger::new(store.clone());
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 1);
        // already processing: the next tick does not see the campaign as due
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_audience_goes_straight_to_sent() {
        let store = Arc::new(MemoryStore::new());
        store.add_campaign(campaign());
        store.add_device("user-1", "dev-a", true);

        let trigger = CampaignTrigger::new(store.clone());
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.campaign_status("c1"), Some(CampaignStatus::Sent));
    }

    #[tokio::test]
    async fn test_no_devices_defers_to_next_tick() {
        let store = Arc::new(MemoryStore::new());
        store.add_campaign(campaign());
        store.add_audience_member("fitness", "", Recipient::new("+60100", "x"));
        store.add_device("user-1", "dev-a", false);

        let trigger = CampaignTrigger::new(store.clone());
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 0);
        // back to pending so a later tick retries
        assert_eq!(store.campaign_status("c1"), Some(CampaignStatus::Pending));

        store.set_device_connected("dev-a", true);
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fanout_error_defers_campaign_without_losing_rows() {
        let store = Arc::new(MemoryStore::new());
        store.add_campaign(campaign());
        for i in 0..3 {
            store.add_audience_member("fitness", "", Recipient::new(format!("+601{i}"), "x"));
        }
        store.add_device("user-1", "dev-a", true);

        // the second insert of the fan-out hits a store outage
        store.fail_insert(2);
        let trigger = CampaignTrigger::new(store.clone());
        assert!(trigger.tick(Utc::now()).await.is_err());
        // back to pending with only the first row landed
        assert_eq!(store.campaign_status("c1"), Some(CampaignStatus::Pending));
        assert_eq!(store.messages().len(), 1);

        // next tick re-runs the fan-out; dedup keys keep the landed row
        // from doubling up
        trigger.tick(Utc::now()).await.unwrap();
        assert_eq!(store.messages().len(), 3);
        assert_eq!(store.campaign_status("c1"), Some(CampaignStatus::Processing));
    }

    #[tokio::test]
    async fn test_stage_filter_narrows_audience() {
        let store = Arc::new(MemoryStore::new());
        let mut c = campaign();
        c.target.stage = Some("lead".into());
        store.add_campaign(c);
        store.add_audience_member("fitness", "lead", Recipient::new("+60100", "x"));
        store.add_audience_member("fitness", "customer", Recipient::new("+60101", "y"));
        store.add_device("user-1", "dev-a", true);

        let trigger = CampaignTrigger::new(store.clone());
        assert_eq!(trigger.tick(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.messages()[0].recipient.address, "+60100");
    }
}
