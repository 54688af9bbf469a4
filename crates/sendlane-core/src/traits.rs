//! Capability traits the engine consumes.
//!
//! The message store is the single source of truth across processes: every
//! send path re-verifies status against it immediately before transmitting,
//! and all conditional updates ("mark sent if still queued", "claim contact
//! if unclaimed") return whether the row actually changed so racing callers
//! can tell winner from loser.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SendFailure};
use crate::types::{
    BroadcastCounts, BroadcastMessage, Campaign, DueContact, MessageStatus, PendingAssignment,
    PoolKey, Recipient, SequenceContact, SequenceStep,
};

/// Durable records for messages, campaigns, sequences, and contact progress.
#[async_trait]
pub trait MessageStore: Send + Sync {
    // ─── Broadcast messages ──────────────────────────────────

    /// Insert a message. A duplicate `dedup_key` is silently ignored, which
    /// makes materialization idempotent per (contact, step).
    async fn insert_message(&self, msg: &BroadcastMessage) -> Result<()>;

    /// Next batch of due pending messages for one device, ordered by
    /// (group_id, group_order, created_at) to preserve multi-part ordering.
    async fn pending_for_device(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<BroadcastMessage>>;

    /// Current status of a message, if it exists.
    async fn message_status(&self, id: &str) -> Result<Option<MessageStatus>>;

    /// pending → queued. Returns false if the row was not pending.
    async fn mark_queued(&self, id: &str) -> Result<bool>;

    /// pending|queued → sent. Returns false if the row already went terminal
    /// — the caller must short-circuit without resending.
    async fn mark_sent(&self, id: &str) -> Result<bool>;

    /// Terminal failure with an explanatory error.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    /// Retry-eligible failure: increment retry_count and put the row back to
    /// pending, not due before `not_before`.
    async fn schedule_retry(&self, id: &str, not_before: DateTime<Utc>) -> Result<()>;

    /// Rows stuck pending/queued beyond the expiry window go terminal failed
    /// with an explanatory error. Returns how many rows were expired.
    async fn expire_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Distinct (device, broadcast) pairs that still have due pending rows.
    async fn pending_assignments(&self) -> Result<Vec<PendingAssignment>>;

    /// Number of pending rows currently owned by one device.
    async fn pending_depth(&self, device_id: &str) -> Result<u64>;

    /// Per-broadcast message counts for completion detection and progress.
    async fn broadcast_counts(&self, key: &PoolKey) -> Result<BroadcastCounts>;

    // ─── Campaigns ──────────────────────────────────────────

    /// Campaigns due at `now` (schedule ≤ now, status draft or pending).
    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;

    /// draft|pending → processing. Returns false when another scheduler
    /// instance already claimed the campaign — the idempotency guard.
    async fn mark_campaign_processing(&self, id: &str) -> Result<bool>;

    /// Terminal campaign state once every message is terminal (or the
    /// audience was empty).
    async fn mark_campaign_sent(&self, id: &str) -> Result<()>;

    /// processing → pending, used when materialization could not start (no
    /// connected device) so the next tick retries.
    async fn reset_campaign_pending(&self, id: &str) -> Result<()>;

    /// Recipients matching the campaign's stored target filter.
    async fn campaign_audience(&self, campaign: &Campaign) -> Result<Vec<Recipient>>;

    /// Devices of a user currently connected and usable for delivery.
    async fn connected_devices(&self, user_id: &str) -> Result<Vec<String>>;

    // ─── Sequence contacts ──────────────────────────────────

    /// Active, unclaimed contacts whose next_trigger_time ≤ now, joined to
    /// the step their current_trigger names.
    async fn due_contacts(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DueContact>>;

    /// Conditionally claim a contact for one device. Returns false when the
    /// contact is already claimed — the silent-loss path under races.
    async fn claim_contact(
        &self,
        contact_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Clear a claim without advancing (failed enqueue); bumps retry_count.
    async fn release_claim(&self, contact_id: &str) -> Result<()>;

    /// active → active at the next step: set current_trigger and
    /// next_trigger_time, clear the claim, reset retry_count.
    async fn advance_contact(
        &self,
        contact_id: &str,
        next_trigger: &str,
        next_time: DateTime<Utc>,
    ) -> Result<()>;

    /// active → completed; clears the claim.
    async fn complete_contact(&self, contact_id: &str) -> Result<()>;

    /// active → paused (explicit pause or retry-budget exhaustion).
    async fn pause_contact(&self, contact_id: &str) -> Result<()>;

    /// paused → active.
    async fn resume_contact(&self, contact_id: &str) -> Result<()>;

    /// Claims older than `started_before` are treated as abandoned (crashed
    /// worker) and cleared so the contact becomes claimable again.
    async fn reclaim_expired(&self, started_before: DateTime<Utc>) -> Result<u64>;

    /// Contact of one sequence/recipient pair, if enrolled.
    async fn find_contact(
        &self,
        sequence_id: &str,
        recipient: &str,
    ) -> Result<Option<SequenceContact>>;

    /// Step a sequence defines for a trigger name.
    async fn step_for(&self, sequence_id: &str, trigger: &str) -> Result<Option<SequenceStep>>;

    /// Idempotent enrollment at an entry trigger: an already-enrolled
    /// recipient is a no-op. Returns whether a new contact was created.
    async fn enroll_contact(
        &self,
        sequence_id: &str,
        recipient: &Recipient,
        entry_trigger: &str,
        first_due: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Shared coordination primitives for multi-process deployments: leased,
/// owner-scoped locks backed by conditional updates in a store every engine
/// process can reach.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Liveness probe. Failure at startup is fatal for the broadcast
    /// subsystem — there is no degraded in-memory mode.
    async fn ping(&self) -> Result<()>;

    /// Take the lock if free or expired. Returns false when another owner
    /// holds it.
    async fn try_acquire(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool>;

    /// Release the lock if this owner still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// The abstracted messaging-client capability. Connection establishment,
/// login, and reconnection policy live behind this boundary.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message through one device. Permanent failures are terminal;
    /// transient ones re-enter the retry cycle.
    async fn send(
        &self,
        device_id: &str,
        recipient: &Recipient,
        content: &str,
        media_url: Option<&str>,
    ) -> std::result::Result<(), SendFailure>;

    /// Whether the device's session is currently usable.
    async fn is_connected(&self, device_id: &str) -> bool;
}

/// Renders final message text from a template and recipient context.
pub trait Composer: Send + Sync {
    fn render(&self, template: &str, recipient: &Recipient) -> String;
}
