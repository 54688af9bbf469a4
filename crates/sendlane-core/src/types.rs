//! Broadcast data model: messages, campaigns, sequences, contacts, pool keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SendlaneError};

/// What kind of broadcast a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    /// One-shot marketing blast.
    Campaign,
    /// One step of a multi-day nurture sequence.
    Sequence,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastKind::Campaign => "campaign",
            BroadcastKind::Sequence => "sequence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "campaign" => Some(BroadcastKind::Campaign),
            "sequence" => Some(BroadcastKind::Sequence),
            _ => None,
        }
    }
}

impl std::fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one worker pool: derived purely from broadcast identity so
/// independent processes converge on the same logical pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub kind: BroadcastKind,
    pub broadcast_id: String,
}

impl PoolKey {
    pub fn new(kind: BroadcastKind, broadcast_id: impl Into<String>) -> Self {
        Self { kind, broadcast_id: broadcast_id.into() }
    }

    pub fn campaign(id: impl Into<String>) -> Self {
        Self::new(BroadcastKind::Campaign, id)
    }

    pub fn sequence(id: impl Into<String>) -> Self {
        Self::new(BroadcastKind::Sequence, id)
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.broadcast_id)
    }
}

/// Lifecycle of a single outbound message.
///
/// Transitions are forward-monotonic (pending → queued → sent → delivered)
/// except failed → pending on a retry-eligible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Queued,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "queued" => Some(MessageStatus::Queued),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never change again (failed can re-enter the cycle
    /// only through an explicit retry reschedule).
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Failed)
    }
}

/// One recipient of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Network address (phone number, handle — transport-specific).
    pub address: String,
    /// Display name used by the composer for personalization.
    #[serde(default)]
    pub name: String,
}

impl Recipient {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self { address: address.into(), name: name.into() }
    }
}

/// A single materialized outbound message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: String,
    /// Sending identity that owns delivery of this row.
    pub device_id: String,
    pub kind: BroadcastKind,
    /// Campaign id or sequence id this message belongs to.
    pub reference_id: String,
    pub recipient: Recipient,
    /// Template text; the composer renders the final content.
    pub content: String,
    pub media_url: Option<String>,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    /// Intra-device ordering for multi-part deliveries.
    pub group_id: Option<String>,
    pub group_order: i32,
    /// Duplicate guard for idempotent materialization, e.g. "{contact}:{trigger}".
    pub dedup_key: Option<String>,
    /// Per-message pacing bounds, inherited from the campaign or step.
    pub min_delay_secs: u32,
    pub max_delay_secs: u32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl BroadcastMessage {
    /// New pending message with a fresh id, scheduled now.
    pub fn new(
        device_id: impl Into<String>,
        kind: BroadcastKind,
        reference_id: impl Into<String>,
        recipient: Recipient,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            kind,
            reference_id: reference_id.into(),
            recipient,
            content: content.into(),
            media_url: None,
            priority: 0,
            scheduled_at: now,
            status: MessageStatus::Pending,
            retry_count: 0,
            error: None,
            group_id: None,
            group_order: 0,
            dedup_key: None,
            min_delay_secs: 0,
            max_delay_secs: 0,
            created_at: now,
            sent_at: None,
        }
    }

    /// Pool this message routes through.
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.kind, self.reference_id.clone())
    }
}

/// Campaign lifecycle. Triggering a campaign already processing or sent is a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Pending,
    Processing,
    Sent,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Pending => "pending",
            CampaignStatus::Processing => "processing",
            CampaignStatus::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "pending" => Some(CampaignStatus::Pending),
            "processing" => Some(CampaignStatus::Processing),
            "sent" => Some(CampaignStatus::Sent),
            _ => None,
        }
    }
}

/// Which recipients a campaign targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    /// Audience label the recipients were tagged with.
    pub audience: String,
    /// Optional pipeline stage narrowing the audience.
    #[serde(default)]
    pub stage: Option<String>,
}

/// A one-shot campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub media_url: Option<String>,
    pub target: TargetFilter,
    /// When the campaign becomes due. UTC is the single canonical time base
    /// for all due-date evaluation.
    pub scheduled_at: DateTime<Utc>,
    pub min_delay_secs: u32,
    pub max_delay_secs: u32,
    pub status: CampaignStatus,
}

/// One step of a sequence's trigger graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    /// Trigger name this step fires on.
    pub trigger: String,
    /// Trigger of the following step; empty means this step is terminal.
    #[serde(default)]
    pub next_trigger: String,
    /// Hours to wait before the next step becomes due.
    pub delay_hours: u32,
    /// Contacts may enter the sequence at this step.
    #[serde(default)]
    pub entry_point: bool,
    pub content: String,
    pub media_url: Option<String>,
    pub min_delay_secs: u32,
    pub max_delay_secs: u32,
}

impl SequenceStep {
    pub fn is_terminal(&self) -> bool {
        self.next_trigger.is_empty()
    }
}

/// An ordered nurture sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub active: bool,
    pub steps: Vec<SequenceStep>,
}

impl Sequence {
    /// Step for a given trigger name, if the sequence defines one.
    pub fn step_for(&self, trigger: &str) -> Option<&SequenceStep> {
        self.steps.iter().find(|s| s.trigger == trigger)
    }

    /// Validate the step graph: at least one entry point, and every step
    /// reachable from some entry point by following next_trigger edges.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(SendlaneError::InvalidSequence(format!(
                "sequence {} has no steps",
                self.id
            )));
        }
        let entries: Vec<&SequenceStep> = self.steps.iter().filter(|s| s.entry_point).collect();
        if entries.is_empty() {
            return Err(SendlaneError::InvalidSequence(format!(
                "sequence {} has no entry point",
                self.id
            )));
        }
        let mut reachable: Vec<&str> = Vec::new();
        let mut frontier: Vec<&str> = entries.iter().map(|s| s.trigger.as_str()).collect();
        while let Some(trigger) = frontier.pop() {
            if reachable.contains(&trigger) {
                continue;
            }
            reachable.push(trigger);
            if let Some(step) = self.step_for(trigger)
                && !step.next_trigger.is_empty()
            {
                frontier.push(step.next_trigger.as_str());
            }
        }
        for step in &self.steps {
            if !reachable.contains(&step.trigger.as_str()) {
                return Err(SendlaneError::InvalidSequence(format!(
                    "step '{}' in sequence {} is unreachable from any entry point",
                    step.trigger, self.id
                )));
            }
        }
        Ok(())
    }
}

/// Where a contact currently sits in a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Active,
    Paused,
    Completed,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Active => "active",
            ContactStatus::Paused => "paused",
            ContactStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ContactStatus::Active),
            "paused" => Some(ContactStatus::Paused),
            "completed" => Some(ContactStatus::Completed),
            _ => None,
        }
    }
}

/// Per-recipient progress through one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceContact {
    pub id: String,
    pub sequence_id: String,
    pub recipient: Recipient,
    pub current_trigger: String,
    pub next_trigger_time: DateTime<Utc>,
    pub status: ContactStatus,
    /// Non-null means a device worker currently owns this contact's
    /// advancement and must clear the claim within the lease window.
    pub processing_device_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// A due contact joined to the step it fires, as the scheduler consumes it.
#[derive(Debug, Clone)]
pub struct DueContact {
    pub contact: SequenceContact,
    pub step: SequenceStep,
    pub user_id: String,
    /// Device the contact's prior messages went through, if any.
    pub preferred_device: Option<String>,
}

/// Distinct (device, broadcast) pair that still has pending rows — the unit
/// of work the pending-row processor resolves to a pool and a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingAssignment {
    pub device_id: String,
    pub key: PoolKey,
    pub user_id: String,
}

/// Message counts for one broadcast, used for completion detection and the
/// operator-facing progress surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastCounts {
    pub total: u64,
    pub pending: u64,
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
}

impl BroadcastCounts {
    /// All materialized messages reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.queued == 0
    }

    /// Completion percentage (terminal over total), 0.0 when empty.
    pub fn completion_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.sent + self.failed) as f64 * 100.0 / self.total as f64
    }
}
