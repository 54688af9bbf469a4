//! In-memory store for unit tests and local development.
//!
//! Mirrors the conditional-update semantics of the SQLite store exactly —
//! tests that race two workers against one row exercise the same
//! winner/loser contract the durable store provides.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sendlane_core::error::{Result, SendlaneError};
use sendlane_core::traits::{CoordinationStore, MessageStore};
use sendlane_core::types::{
    BroadcastCounts, BroadcastKind, BroadcastMessage, Campaign, CampaignStatus, ContactStatus,
    DueContact, MessageStatus, PendingAssignment, PoolKey, Recipient, Sequence, SequenceContact,
    SequenceStep,
};

#[derive(Debug, Clone)]
struct AudienceMember {
    audience: String,
    stage: String,
    recipient: Recipient,
}

#[derive(Debug, Clone)]
struct DeviceRow {
    user_id: String,
    connected: bool,
}

#[derive(Default)]
struct Inner {
    messages: Vec<BroadcastMessage>,
    campaigns: HashMap<String, Campaign>,
    sequences: HashMap<String, Sequence>,
    contacts: HashMap<String, SequenceContact>,
    audience: Vec<AudienceMember>,
    devices: HashMap<String, DeviceRow>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
    fail_insert_in: u32,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Mutex poisoning only happens if a panicking test held the lock;
        // recover with the inner data either way.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Seeding (inherent, not part of the consumed capability) ───

    pub fn add_campaign(&self, campaign: Campaign) {
        self.lock().campaigns.insert(campaign.id.clone(), campaign);
    }

    pub fn add_sequence(&self, sequence: Sequence) {
        self.lock().sequences.insert(sequence.id.clone(), sequence);
    }

    pub fn add_audience_member(&self, audience: &str, stage: &str, recipient: Recipient) {
        self.lock().audience.push(AudienceMember {
            audience: audience.to_string(),
            stage: stage.to_string(),
            recipient,
        });
    }

    pub fn add_device(&self, user_id: &str, device_id: &str, connected: bool) {
        self.lock().devices.insert(
            device_id.to_string(),
            DeviceRow { user_id: user_id.to_string(), connected },
        );
    }

    /// Arrange for the nth upcoming insert to return a store error, for
    /// error-path tests. One-shot: later inserts succeed again.
    pub fn fail_insert(&self, nth: u32) {
        self.lock().fail_insert_in = nth;
    }

    pub fn set_device_connected(&self, device_id: &str, connected: bool) {
        if let Some(row) = self.lock().devices.get_mut(device_id) {
            row.connected = connected;
        }
    }

    /// Campaign status as stored, for assertions.
    pub fn campaign_status(&self, id: &str) -> Option<CampaignStatus> {
        self.lock().campaigns.get(id).map(|c| c.status)
    }

    /// Contact row as stored, for assertions.
    pub fn contact(&self, id: &str) -> Option<SequenceContact> {
        self.lock().contacts.get(id).cloned()
    }

    /// Snapshot of every message row, for assertions.
    pub fn messages(&self) -> Vec<BroadcastMessage> {
        self.lock().messages.clone()
    }

    fn user_for_reference(inner: &Inner, kind: BroadcastKind, reference: &str) -> String {
        match kind {
            BroadcastKind::Campaign => inner
                .campaigns
                .get(reference)
                .map(|c| c.user_id.clone())
                .unwrap_or_default(),
            BroadcastKind::Sequence => inner
                .sequences
                .get(reference)
                .map(|s| s.user_id.clone())
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, msg: &BroadcastMessage) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_insert_in > 0 {
            inner.fail_insert_in -= 1;
            if inner.fail_insert_in == 0 {
                return Err(SendlaneError::store("simulated store outage"));
            }
        }
        if let Some(key) = &msg.dedup_key
            && inner.messages.iter().any(|m| m.dedup_key.as_ref() == Some(key))
        {
            return Ok(());
        }
        inner.messages.push(msg.clone());
        Ok(())
    }

    async fn pending_for_device(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<BroadcastMessage>> {
        let now = Utc::now();
        let inner = self.lock();
        let mut batch: Vec<BroadcastMessage> = inner
            .messages
            .iter()
            .filter(|m| {
                m.device_id == device_id
                    && m.status == MessageStatus::Pending
                    && m.scheduled_at <= now
            })
            .cloned()
            .collect();
        batch.sort_by(|a, b| {
            (a.group_id.clone().unwrap_or_default(), a.group_order, a.created_at).cmp(&(
                b.group_id.clone().unwrap_or_default(),
                b.group_order,
                b.created_at,
            ))
        });
        batch.truncate(limit as usize);
        Ok(batch)
    }

    async fn message_status(&self, id: &str) -> Result<Option<MessageStatus>> {
        Ok(self.lock().messages.iter().find(|m| m.id == id).map(|m| m.status))
    }

    async fn mark_queued(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.messages.iter_mut().find(|m| m.id == id) {
            Some(m) if m.status == MessageStatus::Pending => {
                m.status = MessageStatus::Queued;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.messages.iter_mut().find(|m| m.id == id) {
            Some(m) if matches!(m.status, MessageStatus::Pending | MessageStatus::Queued) => {
                m.status = MessageStatus::Sent;
                m.sent_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(m) = inner.messages.iter_mut().find(|m| m.id == id) {
            m.status = MessageStatus::Failed;
            m.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn schedule_retry(&self, id: &str, not_before: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(m) = inner.messages.iter_mut().find(|m| m.id == id) {
            m.retry_count += 1;
            m.status = MessageStatus::Pending;
            m.scheduled_at = not_before;
        }
        Ok(())
    }

    async fn expire_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut expired = 0;
        for m in inner.messages.iter_mut() {
            if matches!(m.status, MessageStatus::Pending | MessageStatus::Queued)
                && m.created_at < older_than
            {
                m.status = MessageStatus::Failed;
                m.error = Some("message expired before delivery".to_string());
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn pending_assignments(&self) -> Result<Vec<PendingAssignment>> {
        let now = Utc::now();
        let inner = self.lock();
        let mut seen: Vec<PendingAssignment> = Vec::new();
        for m in &inner.messages {
            if m.status != MessageStatus::Pending || m.scheduled_at > now {
                continue;
            }
            let assignment = PendingAssignment {
                device_id: m.device_id.clone(),
                key: m.pool_key(),
                user_id: Self::user_for_reference(&inner, m.kind, &m.reference_id),
            };
            if !seen.contains(&assignment) {
                seen.push(assignment);
            }
        }
        Ok(seen)
    }

    async fn pending_depth(&self, device_id: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.device_id == device_id && m.status == MessageStatus::Pending)
            .count() as u64)
    }

    async fn broadcast_counts(&self, key: &PoolKey) -> Result<BroadcastCounts> {
        let inner = self.lock();
        let mut counts = BroadcastCounts::default();
        for m in &inner.messages {
            if m.kind != key.kind || m.reference_id != key.broadcast_id {
                continue;
            }
            counts.total += 1;
            match m.status {
                MessageStatus::Pending => counts.pending += 1,
                MessageStatus::Queued => counts.queued += 1,
                MessageStatus::Sent | MessageStatus::Delivered => counts.sent += 1,
                MessageStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let inner = self.lock();
        Ok(inner
            .campaigns
            .values()
            .filter(|c| {
                c.scheduled_at <= now
                    && matches!(c.status, CampaignStatus::Draft | CampaignStatus::Pending)
            })
            .cloned()
            .collect())
    }

    async fn mark_campaign_processing(&self, id: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.campaigns.get_mut(id) {
            Some(c) if matches!(c.status, CampaignStatus::Draft | CampaignStatus::Pending) => {
                c.status = CampaignStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_campaign_sent(&self, id: &str) -> Result<()> {
        if let Some(c) = self.lock().campaigns.get_mut(id) {
            c.status = CampaignStatus::Sent;
        }
        Ok(())
    }

    async fn reset_campaign_pending(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(c) = inner.campaigns.get_mut(id)
            && c.status == CampaignStatus::Processing
        {
            c.status = CampaignStatus::Pending;
        }
        Ok(())
    }

    async fn campaign_audience(&self, campaign: &Campaign) -> Result<Vec<Recipient>> {
        let inner = self.lock();
        Ok(inner
            .audience
            .iter()
            .filter(|m| {
                m.audience == campaign.target.audience
                    && campaign.target.stage.as_ref().is_none_or(|s| &m.stage == s)
            })
            .map(|m| m.recipient.clone())
            .collect())
    }

    async fn connected_devices(&self, user_id: &str) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut devices: Vec<String> = inner
            .devices
            .iter()
            .filter(|(_, row)| row.user_id == user_id && row.connected)
            .map(|(id, _)| id.clone())
            .collect();
        devices.sort();
        Ok(devices)
    }

    async fn due_contacts(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DueContact>> {
        let inner = self.lock();
        let mut due: Vec<DueContact> = Vec::new();
        for contact in inner.contacts.values() {
            if contact.status != ContactStatus::Active
                || contact.processing_device_id.is_some()
                || contact.next_trigger_time > now
            {
                continue;
            }
            let Some(sequence) = inner.sequences.get(&contact.sequence_id) else {
                continue;
            };
            if !sequence.active {
                continue;
            }
            let Some(step) = sequence.step_for(&contact.current_trigger) else {
                continue;
            };
            let preferred = inner
                .messages
                .iter()
                .filter(|m| {
                    m.recipient.address == contact.recipient.address
                        && m.status == MessageStatus::Sent
                })
                .max_by_key(|m| m.sent_at)
                .map(|m| m.device_id.clone());
            due.push(DueContact {
                contact: contact.clone(),
                step: step.clone(),
                user_id: sequence.user_id.clone(),
                preferred_device: preferred,
            });
        }
        due.sort_by_key(|d| d.contact.next_trigger_time);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim_contact(
        &self,
        contact_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.contacts.get_mut(contact_id) {
            Some(c) if c.processing_device_id.is_none() => {
                c.processing_device_id = Some(device_id.to_string());
                c.processing_started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, contact_id: &str) -> Result<()> {
        if let Some(c) = self.lock().contacts.get_mut(contact_id) {
            c.processing_device_id = None;
            c.processing_started_at = None;
            c.retry_count += 1;
        }
        Ok(())
    }

    async fn advance_contact(
        &self,
        contact_id: &str,
        next_trigger: &str,
        next_time: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(c) = self.lock().contacts.get_mut(contact_id) {
            c.current_trigger = next_trigger.to_string();
            c.next_trigger_time = next_time;
            c.processing_device_id = None;
            c.processing_started_at = None;
            c.retry_count = 0;
            c.last_sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn complete_contact(&self, contact_id: &str) -> Result<()> {
        if let Some(c) = self.lock().contacts.get_mut(contact_id) {
            c.status = ContactStatus::Completed;
            c.processing_device_id = None;
            c.processing_started_at = None;
            c.last_sent_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn pause_contact(&self, contact_id: &str) -> Result<()> {
        if let Some(c) = self.lock().contacts.get_mut(contact_id) {
            c.status = ContactStatus::Paused;
            c.processing_device_id = None;
            c.processing_started_at = None;
        }
        Ok(())
    }

    async fn resume_contact(&self, contact_id: &str) -> Result<()> {
        if let Some(c) = self.lock().contacts.get_mut(contact_id)
            && c.status == ContactStatus::Paused
        {
            c.status = ContactStatus::Active;
        }
        Ok(())
    }

    async fn reclaim_expired(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut reclaimed = 0;
        for c in inner.contacts.values_mut() {
            if c.processing_device_id.is_some()
                && c.processing_started_at.is_some_and(|t| t < started_before)
            {
                c.processing_device_id = None;
                c.processing_started_at = None;
                c.retry_count += 1;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn find_contact(
        &self,
        sequence_id: &str,
        recipient: &str,
    ) -> Result<Option<SequenceContact>> {
        let inner = self.lock();
        Ok(inner
            .contacts
            .values()
            .find(|c| c.sequence_id == sequence_id && c.recipient.address == recipient)
            .cloned())
    }

    async fn step_for(&self, sequence_id: &str, trigger: &str) -> Result<Option<SequenceStep>> {
        let inner = self.lock();
        Ok(inner
            .sequences
            .get(sequence_id)
            .and_then(|s| s.step_for(trigger))
            .cloned())
    }

    async fn enroll_contact(
        &self,
        sequence_id: &str,
        recipient: &Recipient,
        entry_trigger: &str,
        first_due: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        if !inner.sequences.contains_key(sequence_id) {
            return Err(SendlaneError::store(format!("unknown sequence {sequence_id}")));
        }
        let exists = inner
            .contacts
            .values()
            .any(|c| c.sequence_id == sequence_id && c.recipient.address == recipient.address);
        if exists {
            return Ok(false);
        }
        let contact = SequenceContact {
            id: uuid::Uuid::new_v4().to_string(),
            sequence_id: sequence_id.to_string(),
            recipient: recipient.clone(),
            current_trigger: entry_trigger.to_string(),
            next_trigger_time: first_due,
            status: ContactStatus::Active,
            processing_device_id: None,
            processing_started_at: None,
            retry_count: 0,
            last_sent_at: None,
        };
        inner.contacts.insert(contact.id.clone(), contact);
        Ok(true)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn try_acquire(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock();
        match inner.locks.get(key) {
            Some((holder, expires)) if *expires > now && holder != owner => Ok(false),
            _ => {
                inner.locks.insert(
                    key.to_string(),
                    (owner.to_string(), now + chrono::Duration::seconds(ttl_secs as i64)),
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.locks.get(key).is_some_and(|(holder, _)| holder == owner) {
            inner.locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendlane_core::types::BroadcastKind;

    fn message(device: &str, group: Option<(&str, i32)>) -> BroadcastMessage {
        let mut msg = BroadcastMessage::new(
            device,
            BroadcastKind::Campaign,
            "c1",
            Recipient::new("+60123", "Ana"),
            "hi {name}",
        );
        if let Some((gid, order)) = group {
            msg.group_id = Some(gid.to_string());
            msg.group_order = order;
        }
        msg
    }

    #[tokio::test]
    async fn test_mark_sent_is_conditional() {
        let store = MemoryStore::new();
        let msg = message("dev-1", None);
        store.insert_message(&msg).await.unwrap();

        assert!(store.mark_sent(&msg.id).await.unwrap());
        // second attempt loses: the row already went terminal
        assert!(!store.mark_sent(&msg.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_order_respects_groups() {
        let store = MemoryStore::new();
        let mut late = message("dev-1", Some(("g1", 2)));
        let mut early = message("dev-1", Some(("g1", 1)));
        late.created_at = Utc::now();
        early.created_at = Utc::now();
        store.insert_message(&late).await.unwrap();
        store.insert_message(&early).await.unwrap();

        let batch = store.pending_for_device("dev-1", 10).await.unwrap();
        assert_eq!(batch[0].id, early.id);
        assert_eq!(batch[1].id, late.id);
    }

    #[tokio::test]
    async fn test_dedup_key_makes_insert_idempotent() {
        let store = MemoryStore::new();
        let mut msg = message("dev-1", None);
        msg.dedup_key = Some("contact-1:day1".into());
        store.insert_message(&msg).await.unwrap();

        let mut dup = message("dev-1", None);
        dup.dedup_key = Some("contact-1:day1".into());
        store.insert_message(&dup).await.unwrap();

        assert_eq!(store.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_expiry_allows_takeover() {
        let store = MemoryStore::new();
        assert!(store.try_acquire("send:m1", "proc-a", 60).await.unwrap());
        assert!(!store.try_acquire("send:m1", "proc-b", 60).await.unwrap());

        // simulate expiry
        store.lock().locks.insert(
            "send:m1".into(),
            ("proc-a".into(), Utc::now() - chrono::Duration::seconds(1)),
        );
        assert!(store.try_acquire("send:m1", "proc-b", 60).await.unwrap());
    }
}
