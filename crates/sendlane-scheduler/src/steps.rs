//! Per-recipient sequence state machine.
//!
//! A contact moves through a sequence's trigger graph one delivery at a
//! time. Device workers call into this module after each send attempt; the
//! scheduler never advances a contact on its own.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use sendlane_core::error::Result;
use sendlane_core::traits::MessageStore;
use sendlane_core::types::{Recipient, Sequence};

/// What happened to a contact after a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Moved to the next step; due again at `due`.
    Advanced { next_trigger: String, due: DateTime<Utc> },
    /// The delivered step was terminal; the contact finished the sequence.
    Completed,
    /// No contact row for this (sequence, recipient) pair.
    NotEnrolled,
}

/// Drives contacts through sequence steps via the shared store, so any
/// process observing a delivery lands the contact in the same place.
pub struct SequenceStateMachine {
    store: Arc<dyn MessageStore>,
}

impl SequenceStateMachine {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Enroll a recipient at the sequence's first entry point, due
    /// immediately. Re-enrolling is a no-op; returns whether a new contact
    /// was created.
    pub async fn enroll(&self, sequence: &Sequence, recipient: &Recipient) -> Result<bool> {
        sequence.validate()?;
        // validate() guarantees at least one entry point exists
        let entry = sequence
            .steps
            .iter()
            .find(|s| s.entry_point)
            .map(|s| s.trigger.clone())
            .unwrap_or_default();
        let created =
            self.store.enroll_contact(&sequence.id, recipient, &entry, Utc::now()).await?;
        if created {
            tracing::info!(
                "🌱 Enrolled {} in sequence '{}' at step '{}'",
                recipient.address,
                sequence.name,
                entry
            );
        }
        Ok(created)
    }

    /// Record a successful delivery for this contact's current step and move
    /// the contact forward. Clears the processing claim either way.
    pub async fn advance_on_sent(
        &self,
        sequence_id: &str,
        recipient_address: &str,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let Some(contact) = self.store.find_contact(sequence_id, recipient_address).await? else {
            return Ok(StepOutcome::NotEnrolled);
        };

        let step = self.store.step_for(sequence_id, &contact.current_trigger).await?;
        match step {
            Some(step) if !step.is_terminal() => {
                let due = now + Duration::hours(i64::from(step.delay_hours));
                self.store.advance_contact(&contact.id, &step.next_trigger, due).await?;
                tracing::debug!(
                    "➡️ Contact {} advanced '{}' → '{}', due {}",
                    contact.id,
                    step.trigger,
                    step.next_trigger,
                    due
                );
                Ok(StepOutcome::Advanced { next_trigger: step.next_trigger, due })
            }
            // Terminal step, or the sequence definition dropped the step the
            // contact sits on — either way there is nowhere left to go.
            _ => {
                self.store.complete_contact(&contact.id).await?;
                tracing::info!(
                    "🏁 Contact {} completed sequence {}",
                    contact.id,
                    contact.sequence_id
                );
                Ok(StepOutcome::Completed)
            }
        }
    }

    /// A permanently failed delivery pauses the contact so it stops
    /// generating messages until an operator resumes it.
    pub async fn pause_on_failure(&self, sequence_id: &str, recipient_address: &str) -> Result<()> {
        if let Some(contact) = self.store.find_contact(sequence_id, recipient_address).await? {
            self.store.pause_contact(&contact.id).await?;
            tracing::warn!(
                "⏸️ Contact {} paused after permanent delivery failure",
                contact.id
            );
        }
        Ok(())
    }

    /// Operator pause.
    pub async fn pause(&self, contact_id: &str) -> Result<()> {
        self.store.pause_contact(contact_id).await
    }

    /// Operator resume; only paused contacts change.
    pub async fn resume(&self, contact_id: &str) -> Result<()> {
        self.store.resume_contact(contact_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sendlane_core::types::{ContactStatus, SequenceStep};
    use sendlane_store::MemoryStore;

    fn two_step_sequence() -> Sequence {
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
                    min_delay_secs: 5,
                    max_delay_secs: 15,
                },
                SequenceStep {
                    trigger: "day2".into(),
                    next_trigger: String::new(),
                    delay_hours: 0,
                    entry_point: false,
                    content: "followup {name}".into(),
                    media_url: None,
                    min_delay_secs: 5,
                    max_delay_secs: 15,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_day1_to_day2_to_completed() {
        let store = Arc::new(MemoryStore::new());
        let sequence = two_step_sequence();
        store.add_sequence(sequence.clone());
        let machine = SequenceStateMachine::new(store.clone());

        let recipient = Recipient::new("+60123", "Ana");
        assert!(machine.enroll(&sequence, &recipient).await.unwrap());
        // second enrollment is a no-op
        assert!(!machine.enroll(&sequence, &recipient).await.unwrap());

        let now = Utc::now();
        let outcome = machine.advance_on_sent("seq-1", "+60123", now).await.unwrap();
        match outcome {
            StepOutcome::Advanced { next_trigger, due } => {
                assert_eq!(next_trigger, "day2");
                assert_eq!(due, now + Duration::hours(24));
            }
            other => panic!("expected Advanced, got {other:?}"),
        }

        let outcome = machine.advance_on_sent("seq-1", "+60123", now).await.unwrap();
        assert_eq!(outcome, StepOutcome::Completed);

        let contact = store.find_contact("seq-1", "+60123").await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_not_enrolled() {
        let store = Arc::new(MemoryStore::new());
        store.add_sequence(two_step_sequence());
        let machine = SequenceStateMachine::new(store);

        let outcome = machine.advance_on_sent("seq-1", "+9999", Utc::now()).await.unwrap();
        assert_eq!(outcome, StepOutcome::NotEnrolled);
    }

    #[tokio::test]
    async fn test_permanent_failure_pauses_then_resume_reactivates() {
        let store = Arc::new(MemoryStore::new());
        let sequence = two_step_sequence();
        store.add_sequence(sequence.clone());
        let machine = SequenceStateMachine::new(store.clone());

        let recipient = Recipient::new("+60124", "Ben");
        machine.enroll(&sequence, &recipient).await.unwrap();
        machine.pause_on_failure("seq-1", "+60124").await.unwrap();

        let contact = store.find_contact("seq-1", "+60124").await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Paused);

        machine.resume(&contact.id).await.unwrap();
        let contact = store.find_contact("seq-1", "+60124").await.unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Active);
    }

    #[tokio::test]
    async fn test_enroll_rejects_invalid_graph() {
        let store = Arc::new(MemoryStore::new());
        let mut sequence = two_step_sequence();
        for step in &mut sequence.steps {
            step.entry_point = false;
        }
        store.add_sequence(sequence.clone());
        let machine = SequenceStateMachine::new(store);

        let result = machine.enroll(&sequence, &Recipient::new("+60125", "Cy")).await;
        assert!(result.is_err());
    }
}
