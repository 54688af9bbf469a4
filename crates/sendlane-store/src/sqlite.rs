//! SQLite-backed persistence for messages, campaigns, sequences, contact
//! progress, and coordination locks.
//!
//! One database file can be shared by several engine processes: WAL mode plus
//! a busy timeout keep concurrent writers safe, and every racy operation is a
//! single conditional UPDATE/INSERT whose changed-row count tells the caller
//! whether it won.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use sendlane_core::error::{Result, SendlaneError};
use sendlane_core::traits::{CoordinationStore, MessageStore};
use sendlane_core::types::{
    BroadcastCounts, BroadcastKind, BroadcastMessage, Campaign, CampaignStatus, ContactStatus,
    DueContact, MessageStatus, PendingAssignment, PoolKey, Recipient, Sequence, SequenceContact,
    SequenceStep, TargetFilter,
};

/// Normalized timestamp encoding so lexicographic comparison in SQL matches
/// chronological order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn db_err(e: rusqlite::Error) -> SendlaneError {
    SendlaneError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> SendlaneError {
    SendlaneError::Store(format!("corrupt steps payload: {e}"))
}

/// SQLite-backed store implementing both the message-store and the
/// coordination-store capabilities.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(db_err)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database, handy for tests of the SQL layer itself.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            -- Materialized outbound messages
            CREATE TABLE IF NOT EXISTS broadcast_messages (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                kind TEXT NOT NULL,              -- 'campaign' or 'sequence'
                reference_id TEXT NOT NULL,
                recipient_address TEXT NOT NULL,
                recipient_name TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                media_url TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                group_id TEXT,
                group_order INTEGER NOT NULL DEFAULT 0,
                dedup_key TEXT UNIQUE,
                min_delay_secs INTEGER NOT NULL DEFAULT 0,
                max_delay_secs INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_device_status
                ON broadcast_messages (device_id, status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_messages_reference
                ON broadcast_messages (kind, reference_id);

            -- One-shot campaigns
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                media_url TEXT,
                audience TEXT NOT NULL DEFAULT '',
                stage TEXT,
                scheduled_at TEXT NOT NULL,
                min_delay_secs INTEGER NOT NULL DEFAULT 0,
                max_delay_secs INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'draft'
            );

            -- Nurture sequences; steps stored as a JSON payload
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                steps TEXT NOT NULL DEFAULT '[]'
            );

            -- Per-recipient sequence progress
            CREATE TABLE IF NOT EXISTS sequence_contacts (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                recipient_address TEXT NOT NULL,
                recipient_name TEXT NOT NULL DEFAULT '',
                current_trigger TEXT NOT NULL,
                next_trigger_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                processing_device_id TEXT,
                processing_started_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_sent_at TEXT,
                UNIQUE (sequence_id, recipient_address)
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_due
                ON sequence_contacts (status, next_trigger_time);

            -- Sending identities
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                connected INTEGER NOT NULL DEFAULT 0
            );

            -- Campaign targeting pool
            CREATE TABLE IF NOT EXISTS audience_members (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                audience TEXT NOT NULL,
                stage TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT ''
            );

            -- Leased cross-process locks
            CREATE TABLE IF NOT EXISTS coord_locks (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ─── Seeding / administration (inherent) ──────────────────

    /// Insert or replace a campaign.
    pub async fn upsert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO campaigns
             (id, user_id, title, content, media_url, audience, stage, scheduled_at,
              min_delay_secs, max_delay_secs, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                campaign.id,
                campaign.user_id,
                campaign.title,
                campaign.content,
                campaign.media_url,
                campaign.target.audience,
                campaign.target.stage,
                ts(campaign.scheduled_at),
                campaign.min_delay_secs,
                campaign.max_delay_secs,
                campaign.status.as_str(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert or replace a sequence definition.
    pub async fn upsert_sequence(&self, sequence: &Sequence) -> Result<()> {
        let steps = serde_json::to_string(&sequence.steps)
            .map_err(|e| SendlaneError::store(format!("serialize steps: {e}")))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sequences (id, user_id, name, active, steps)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sequence.id, sequence.user_id, sequence.name, sequence.active as i32, steps],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Register an audience member for campaign targeting.
    pub async fn add_audience_member(
        &self,
        audience: &str,
        stage: &str,
        recipient: &Recipient,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audience_members (audience, stage, address, name) VALUES (?1, ?2, ?3, ?4)",
            params![audience, stage, recipient.address, recipient.name],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Register a sending device.
    pub async fn upsert_device(&self, user_id: &str, device_id: &str, connected: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO devices (id, user_id, connected) VALUES (?1, ?2, ?3)",
            params![device_id, user_id, connected as i32],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<BroadcastMessage> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let scheduled_at: String = row.get("scheduled_at")?;
        let created_at: String = row.get("created_at")?;
        let sent_at: Option<String> = row.get("sent_at")?;
        Ok(BroadcastMessage {
            id: row.get("id")?,
            device_id: row.get("device_id")?,
            kind: BroadcastKind::parse(&kind).unwrap_or(BroadcastKind::Campaign),
            reference_id: row.get("reference_id")?,
            recipient: Recipient {
                address: row.get("recipient_address")?,
                name: row.get("recipient_name")?,
            },
            content: row.get("content")?,
            media_url: row.get("media_url")?,
            priority: row.get("priority")?,
            scheduled_at: parse_ts(&scheduled_at),
            status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Pending),
            retry_count: row.get("retry_count")?,
            error: row.get("error_message")?,
            group_id: row.get("group_id")?,
            group_order: row.get("group_order")?,
            dedup_key: row.get("dedup_key")?,
            min_delay_secs: row.get("min_delay_secs")?,
            max_delay_secs: row.get("max_delay_secs")?,
            created_at: parse_ts(&created_at),
            sent_at: sent_at.as_deref().map(parse_ts),
        })
    }

    fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceContact> {
        let status: String = row.get("status")?;
        let next_trigger_time: String = row.get("next_trigger_time")?;
        let started_at: Option<String> = row.get("processing_started_at")?;
        let last_sent_at: Option<String> = row.get("last_sent_at")?;
        Ok(SequenceContact {
            id: row.get("id")?,
            sequence_id: row.get("sequence_id")?,
            recipient: Recipient {
                address: row.get("recipient_address")?,
                name: row.get("recipient_name")?,
            },
            current_trigger: row.get("current_trigger")?,
            next_trigger_time: parse_ts(&next_trigger_time),
            status: ContactStatus::parse(&status).unwrap_or(ContactStatus::Active),
            processing_device_id: row.get("processing_device_id")?,
            processing_started_at: started_at.as_deref().map(parse_ts),
            retry_count: row.get("retry_count")?,
            last_sent_at: last_sent_at.as_deref().map(parse_ts),
        })
    }

    fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
        let status: String = row.get("status")?;
        let scheduled_at: String = row.get("scheduled_at")?;
        Ok(Campaign {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            title: row.get("title")?,
            content: row.get("content")?,
            media_url: row.get("media_url")?,
            target: TargetFilter { audience: row.get("audience")?, stage: row.get("stage")? },
            scheduled_at: parse_ts(&scheduled_at),
            min_delay_secs: row.get("min_delay_secs")?,
            max_delay_secs: row.get("max_delay_secs")?,
            status: CampaignStatus::parse(&status).unwrap_or(CampaignStatus::Draft),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, msg: &BroadcastMessage) -> Result<()> {
        let conn = self.conn.lock().await;
        // OR IGNORE: a duplicate dedup_key (or id) is an idempotent no-op
        conn.execute(
            "INSERT OR IGNORE INTO broadcast_messages
             (id, device_id, kind, reference_id, recipient_address, recipient_name, content,
              media_url, priority, scheduled_at, status, retry_count, error_message, group_id,
              group_order, dedup_key, min_delay_secs, max_delay_secs, created_at, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20)",
            params![
                msg.id,
                msg.device_id,
                msg.kind.as_str(),
                msg.reference_id,
                msg.recipient.address,
                msg.recipient.name,
                msg.content,
                msg.media_url,
                msg.priority,
                ts(msg.scheduled_at),
                msg.status.as_str(),
                msg.retry_count,
                msg.error,
                msg.group_id,
                msg.group_order,
                msg.dedup_key,
                msg.min_delay_secs,
                msg.max_delay_secs,
                ts(msg.created_at),
                msg.sent_at.map(ts),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn pending_for_device(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<BroadcastMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM broadcast_messages
                 WHERE device_id = ?1 AND status = 'pending' AND scheduled_at <= ?2
                 ORDER BY group_id, group_order, created_at
                 LIMIT ?3",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![device_id, ts(Utc::now()), limit], Self::row_to_message)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn message_status(&self, id: &str) -> Result<Option<MessageStatus>> {
        let conn = self.conn.lock().await;
        let status: Option<String> = conn
            .query_row("SELECT status FROM broadcast_messages WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(db_err)?;
        Ok(status.as_deref().and_then(MessageStatus::parse))
    }

    async fn mark_queued(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE broadcast_messages SET status = 'queued' WHERE id = ?1 AND status = 'pending'",
                [id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn mark_sent(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE broadcast_messages SET status = 'sent', sent_at = ?1, error_message = NULL
                 WHERE id = ?2 AND status IN ('pending', 'queued')",
                params![ts(Utc::now()), id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE broadcast_messages SET status = 'failed', error_message = ?1 WHERE id = ?2",
            params![error, id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn schedule_retry(&self, id: &str, not_before: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE broadcast_messages
             SET status = 'pending', retry_count = retry_count + 1, scheduled_at = ?1
             WHERE id = ?2",
            params![ts(not_before), id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn expire_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE broadcast_messages
                 SET status = 'failed', error_message = 'message expired before delivery'
                 WHERE status IN ('pending', 'queued') AND created_at < ?1",
                [ts(older_than)],
            )
            .map_err(db_err)?;
        Ok(changed as u64)
    }

    async fn pending_assignments(&self) -> Result<Vec<PendingAssignment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT bm.device_id, bm.kind, bm.reference_id,
                        COALESCE(c.user_id, s.user_id, '') AS user_id
                 FROM broadcast_messages bm
                 LEFT JOIN campaigns c ON bm.kind = 'campaign' AND c.id = bm.reference_id
                 LEFT JOIN sequences s ON bm.kind = 'sequence' AND s.id = bm.reference_id
                 WHERE bm.status = 'pending' AND bm.scheduled_at <= ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([ts(Utc::now())], |row| {
                let kind: String = row.get(1)?;
                Ok(PendingAssignment {
                    device_id: row.get(0)?,
                    key: PoolKey::new(
                        BroadcastKind::parse(&kind).unwrap_or(BroadcastKind::Campaign),
                        row.get::<_, String>(2)?,
                    ),
                    user_id: row.get(3)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn pending_depth(&self, device_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM broadcast_messages WHERE device_id = ?1 AND status = 'pending'",
            [device_id],
            |row| row.get::<_, u64>(0),
        )
        .map_err(db_err)
    }

    async fn broadcast_counts(&self, key: &PoolKey) -> Result<BroadcastCounts> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM broadcast_messages
                 WHERE kind = ?1 AND reference_id = ?2 GROUP BY status",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![key.kind.as_str(), key.broadcast_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })
            .map_err(db_err)?;
        let mut counts = BroadcastCounts::default();
        for row in rows {
            let (status, n) = row.map_err(db_err)?;
            counts.total += n;
            match MessageStatus::parse(&status) {
                Some(MessageStatus::Pending) => counts.pending += n,
                Some(MessageStatus::Queued) => counts.queued += n,
                Some(MessageStatus::Sent) | Some(MessageStatus::Delivered) => counts.sent += n,
                Some(MessageStatus::Failed) => counts.failed += n,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM campaigns
                 WHERE scheduled_at <= ?1 AND status IN ('draft', 'pending')
                 ORDER BY scheduled_at",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([ts(now)], Self::row_to_campaign).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn mark_campaign_processing(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE campaigns SET status = 'processing'
                 WHERE id = ?1 AND status IN ('draft', 'pending')",
                [id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn mark_campaign_sent(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE campaigns SET status = 'sent' WHERE id = ?1", [id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn reset_campaign_pending(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE campaigns SET status = 'pending' WHERE id = ?1 AND status = 'processing'",
            [id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn campaign_audience(&self, campaign: &Campaign) -> Result<Vec<Recipient>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT address, name FROM audience_members
                 WHERE audience = ?1 AND (?2 IS NULL OR stage = ?2)
                 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![campaign.target.audience, campaign.target.stage], |row| {
                Ok(Recipient { address: row.get(0)?, name: row.get(1)? })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn connected_devices(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM devices WHERE user_id = ?1 AND connected = 1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt.query_map([user_id], |row| row.get::<_, String>(0)).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn due_contacts(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DueContact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT sc.*, s.user_id AS seq_user_id, s.steps AS seq_steps
                 FROM sequence_contacts sc
                 JOIN sequences s ON s.id = sc.sequence_id
                 WHERE sc.status = 'active'
                   AND s.active = 1
                   AND sc.next_trigger_time <= ?1
                   AND sc.processing_device_id IS NULL
                 ORDER BY sc.next_trigger_time
                 LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(now), limit], |row| {
                let contact = Self::row_to_contact(row)?;
                let user_id: String = row.get("seq_user_id")?;
                let steps: String = row.get("seq_steps")?;
                Ok((contact, user_id, steps))
            })
            .map_err(db_err)?;

        let mut due = Vec::new();
        for row in rows {
            let (contact, user_id, steps_json) = row.map_err(db_err)?;
            let steps: Vec<SequenceStep> = serde_json::from_str(&steps_json).map_err(json_err)?;
            let Some(step) = steps.iter().find(|s| s.trigger == contact.current_trigger) else {
                continue;
            };
            let preferred: Option<String> = conn
                .query_row(
                    "SELECT device_id FROM broadcast_messages
                     WHERE recipient_address = ?1 AND status = 'sent'
                     ORDER BY sent_at DESC LIMIT 1",
                    [&contact.recipient.address],
                    |r| r.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
                .map_err(db_err)?;
            due.push(DueContact { contact, step: step.clone(), user_id, preferred_device: preferred });
        }
        Ok(due)
    }

    async fn claim_contact(
        &self,
        contact_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE sequence_contacts
                 SET processing_device_id = ?1, processing_started_at = ?2
                 WHERE id = ?3 AND processing_device_id IS NULL",
                params![device_id, ts(now), contact_id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    async fn release_claim(&self, contact_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sequence_contacts
             SET processing_device_id = NULL, processing_started_at = NULL,
                 retry_count = retry_count + 1
             WHERE id = ?1",
            [contact_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn advance_contact(
        &self,
        contact_id: &str,
        next_trigger: &str,
        next_time: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sequence_contacts
             SET current_trigger = ?1, next_trigger_time = ?2, last_sent_at = ?3,
                 processing_device_id = NULL, processing_started_at = NULL, retry_count = 0
             WHERE id = ?4",
            params![next_trigger, ts(next_time), ts(Utc::now()), contact_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete_contact(&self, contact_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sequence_contacts
             SET status = 'completed', last_sent_at = ?1,
                 processing_device_id = NULL, processing_started_at = NULL
             WHERE id = ?2",
            params![ts(Utc::now()), contact_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn pause_contact(&self, contact_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sequence_contacts
             SET status = 'paused', processing_device_id = NULL, processing_started_at = NULL
             WHERE id = ?1",
            [contact_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn resume_contact(&self, contact_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sequence_contacts SET status = 'active' WHERE id = ?1 AND status = 'paused'",
            [contact_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn reclaim_expired(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE sequence_contacts
                 SET processing_device_id = NULL, processing_started_at = NULL,
                     retry_count = retry_count + 1
                 WHERE processing_device_id IS NOT NULL AND processing_started_at < ?1",
                [ts(started_before)],
            )
            .map_err(db_err)?;
        Ok(changed as u64)
    }

    async fn find_contact(
        &self,
        sequence_id: &str,
        recipient: &str,
    ) -> Result<Option<SequenceContact>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM sequence_contacts WHERE sequence_id = ?1 AND recipient_address = ?2",
            params![sequence_id, recipient],
            Self::row_to_contact,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
        .map_err(db_err)
    }

    async fn step_for(&self, sequence_id: &str, trigger: &str) -> Result<Option<SequenceStep>> {
        let conn = self.conn.lock().await;
        let steps_json: Option<String> = conn
            .query_row("SELECT steps FROM sequences WHERE id = ?1", [sequence_id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(db_err)?;
        let Some(json) = steps_json else { return Ok(None) };
        let steps: Vec<SequenceStep> = serde_json::from_str(&json).map_err(json_err)?;
        Ok(steps.into_iter().find(|s| s.trigger == trigger))
    }

    async fn enroll_contact(
        &self,
        sequence_id: &str,
        recipient: &Recipient,
        entry_trigger: &str,
        first_due: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        // OR IGNORE on the (sequence, recipient) unique key: re-enrollment is
        // a no-op
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO sequence_contacts
                 (id, sequence_id, recipient_address, recipient_name, current_trigger,
                  next_trigger_time, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active')",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    sequence_id,
                    recipient.address,
                    recipient.name,
                    entry_trigger,
                    ts(first_due),
                ],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| SendlaneError::Coordination(e.to_string()))?;
        Ok(())
    }

    async fn try_acquire(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(ttl_secs as i64);
        let conn = self.conn.lock().await;
        // Upsert that only steals the row when the current lease expired or
        // the caller already owns it
        let changed = conn
            .execute(
                "INSERT INTO coord_locks (key, owner, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET owner = excluded.owner,
                                                expires_at = excluded.expires_at
                 WHERE coord_locks.expires_at <= ?4 OR coord_locks.owner = excluded.owner",
                params![key, owner, ts(expires), ts(now)],
            )
            .map_err(|e| SendlaneError::Coordination(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM coord_locks WHERE key = ?1 AND owner = ?2", params![key, owner])
            .map_err(|e| SendlaneError::Coordination(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign(id: &str, status: CampaignStatus) -> Campaign {
        Campaign {
            id: id.into(),
            user_id: "user-1".into(),
            title: "spring promo".into(),
            content: "hello {name}".into(),
            media_url: None,
            target: TargetFilter { audience: "fitness".into(), stage: None },
            scheduled_at: Utc::now() - chrono::Duration::minutes(1),
            min_delay_secs: 5,
            max_delay_secs: 15,
            status,
        }
    }

    #[tokio::test]
    async fn test_campaign_processing_guard() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_campaign(&campaign("c1", CampaignStatus::Pending)).await.unwrap();

        assert!(store.mark_campaign_processing("c1").await.unwrap());
        // second scheduler instance loses the conditional flip
        assert!(!store.mark_campaign_processing("c1").await.unwrap());

        let due = store.due_campaigns(Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_mark_sent_short_circuits_on_terminal_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let msg = BroadcastMessage::new(
            "dev-1",
            BroadcastKind::Campaign,
            "c1",
            Recipient::new("+60100", "Kai"),
            "hi",
        );
        store.insert_message(&msg).await.unwrap();

        assert!(store.mark_queued(&msg.id).await.unwrap());
        assert!(store.mark_sent(&msg.id).await.unwrap());
        assert!(!store.mark_sent(&msg.id).await.unwrap());
        assert_eq!(store.message_status(&msg.id).await.unwrap(), Some(MessageStatus::Sent));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_and_reclaimable() {
        let store = SqliteStore::open_in_memory().unwrap();
        let seq = Sequence {
            id: "s1".into(),
            user_id: "user-1".into(),
            name: "warmup".into(),
            active: true,
            steps: vec![SequenceStep {
                trigger: "day1".into(),
                next_trigger: "day2".into(),
                delay_hours: 24,
                entry_point: true,
                content: "step 1".into(),
                media_url: None,
                min_delay_secs: 5,
                max_delay_secs: 15,
            }],
        };
        store.upsert_sequence(&seq).await.unwrap();
        store
            .enroll_contact("s1", &Recipient::new("+60111", "Mei"), "day1", Utc::now())
            .await
            .unwrap();

        let due = store.due_contacts(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let contact_id = due[0].contact.id.clone();

        let t0 = Utc::now();
        assert!(store.claim_contact(&contact_id, "dev-1", t0).await.unwrap());
        assert!(!store.claim_contact(&contact_id, "dev-2", t0).await.unwrap());

        // claimed contact no longer shows up as due
        assert!(store.due_contacts(Utc::now(), 10).await.unwrap().is_empty());

        // expired lease makes it claimable again
        let reclaimed = store.reclaim_expired(t0 + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(reclaimed, 1);
        assert!(store.claim_contact(&contact_id, "dev-2", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_enrollment_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let seq = Sequence {
            id: "s1".into(),
            user_id: "u".into(),
            name: "n".into(),
            active: true,
            steps: vec![],
        };
        store.upsert_sequence(&seq).await.unwrap();
        let recipient = Recipient::new("+60122", "Lee");
        assert!(store.enroll_contact("s1", &recipient, "day1", Utc::now()).await.unwrap());
        assert!(!store.enroll_contact("s1", &recipient, "day1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_coordination_lock_lifecycle() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ping().await.unwrap();

        assert!(store.try_acquire("send:m1", "proc-a", 60).await.unwrap());
        assert!(!store.try_acquire("send:m1", "proc-b", 60).await.unwrap());
        // re-entrant for the same owner
        assert!(store.try_acquire("send:m1", "proc-a", 60).await.unwrap());

        store.release("send:m1", "proc-a").await.unwrap();
        assert!(store.try_acquire("send:m1", "proc-b", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_assignment_resolution() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_campaign(&campaign("c1", CampaignStatus::Processing)).await.unwrap();
        let msg = BroadcastMessage::new(
            "dev-1",
            BroadcastKind::Campaign,
            "c1",
            Recipient::new("+60133", "Nor"),
            "hi",
        );
        store.insert_message(&msg).await.unwrap();

        let assignments = store.pending_assignments().await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].device_id, "dev-1");
        assert_eq!(assignments[0].key, PoolKey::campaign("c1"));
        assert_eq!(assignments[0].user_id, "user-1");
    }
}
