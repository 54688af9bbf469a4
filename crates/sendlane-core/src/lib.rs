//! # Sendlane Core
//!
//! Shared foundation for the Sendlane delivery engine: the broadcast data
//! model, the capability traits the engine consumes (message store,
//! coordination store, transport, composer), the error taxonomy, and the
//! configuration system.
//!
//! Everything upstream (`sendlane-scheduler`, `sendlane-broadcast`) couples
//! to collaborators exclusively through the traits defined here — the engine
//! never talks to a concrete database or messaging client directly.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::SendlaneConfig;
pub use error::{Result, SendFailure, SendlaneError};
pub use traits::{Composer, CoordinationStore, MessageStore, Transport};
pub use types::{
    BroadcastCounts, BroadcastKind, BroadcastMessage, Campaign, CampaignStatus, ContactStatus,
    DueContact, MessageStatus, PendingAssignment, PoolKey, Recipient, Sequence, SequenceContact,
    SequenceStep, TargetFilter,
};
