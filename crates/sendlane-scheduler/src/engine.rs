//! Trigger scheduler — the interval loops that drive campaign and sequence
//! ticks. Uses tokio::interval so an idle deployment costs nothing between
//! checks.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use sendlane_core::config::SchedulerConfig;
use sendlane_core::traits::MessageStore;

use crate::campaigns::CampaignTrigger;
use crate::sequences::SequenceTrigger;

/// Owns the two trigger loops. A tick that fails logs and waits for the
/// next interval; one bad tick never kills the scheduler.
pub struct TriggerScheduler {
    campaigns: Arc<CampaignTrigger>,
    sequences: Arc<SequenceTrigger>,
    config: SchedulerConfig,
}

impl TriggerScheduler {
    pub fn new(store: Arc<dyn MessageStore>, config: SchedulerConfig) -> Self {
        Self {
            campaigns: Arc::new(CampaignTrigger::new(store.clone())),
            sequences: Arc::new(SequenceTrigger::new(store, &config)),
            config,
        }
    }

    /// Spawn both loops. The handles run until aborted or the runtime shuts
    /// down.
    pub fn spawn(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        tracing::info!(
            "🗓️ Trigger scheduler started (campaigns every {}s, sequences every {}s)",
            self.config.campaign_tick_secs,
            self.config.sequence_tick_secs
        );

        let campaigns = self.campaigns.clone();
        let campaign_tick = self.config.campaign_tick_secs;
        let campaign_loop = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(campaign_tick.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = campaigns.tick(Utc::now()).await {
                    tracing::error!("Campaign tick failed: {e}");
                }
            }
        });

        let sequences = self.sequences.clone();
        let sequence_tick = self.config.sequence_tick_secs;
        let sequence_loop = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(sequence_tick.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = sequences.tick(Utc::now()).await {
                    tracing::error!("Sequence tick failed: {e}");
                }
            }
        });

        (campaign_loop, sequence_loop)
    }

    /// Run both ticks once, immediately. Useful for tests and for the CLI
    /// "tick once" path.
    pub async fn tick_once(&self) -> sendlane_core::error::Result<(u64, u64)> {
        let now = Utc::now();
        let from_campaigns = self.campaigns.tick(now).await?;
        let from_sequences = self.sequences.tick(now).await?;
        Ok((from_campaigns, from_sequences))
    }
}

/// Convenience entry point: build the scheduler and start both loops.
pub fn start_trigger_scheduler(
    store: Arc<dyn MessageStore>,
    config: SchedulerConfig,
) -> (JoinHandle<()>, JoinHandle<()>) {
    TriggerScheduler::new(store, config).spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sendlane_core::types::{Campaign, CampaignStatus, Recipient, TargetFilter};
    use sendlane_store::MemoryStore;

    #[tokio::test]
    async fn test_tick_once_materializes_due_campaign() {
        let store = Arc::new(MemoryStore::new());
        store.add_campaign(Campaign {
            id: "c1".into(),
            user_id: "user-1".into(),
            title: "promo".into(),
            content: "hi {name}".into(),
            media_url: None,
            target: TargetFilter { audience: "all".into(), stage: None },
            scheduled_at: Utc::now() - Duration::minutes(1),
            min_delay_secs: 1,
            max_delay_secs: 2,
            status: CampaignStatus::Pending,
        });
        store.add_audience_member("all", "", Recipient::new("+60100", "Ana"));
        store.add_device("user-1", "dev-a", true);

        let scheduler = TriggerScheduler::new(store.clone(), SchedulerConfig::default());
        let (from_campaigns, from_sequences) = scheduler.tick_once().await.unwrap();
        assert_eq!(from_campaigns, 1);
        assert_eq!(from_sequences, 0);
        assert_eq!(store.messages().len(), 1);
    }
}
