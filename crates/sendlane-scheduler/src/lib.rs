//! # Sendlane Scheduler
//!
//! Time-based triggering for campaigns and sequences. Nothing here touches a
//! transport: the scheduler's whole job is turning due work into pending
//! message rows that device workers later drain.
//!
//! ## Architecture
//! ```text
//! TriggerScheduler (tokio intervals)
//!   ├── campaign tick (60s)
//!   │     due campaigns → processing guard → audience fan-out
//!   │     → round-robin across connected devices → pending rows
//!   └── sequence tick (30s)
//!         reclaim expired claims → due contacts → device selection
//!         → conditional claim → one pending row per (contact, step)
//!
//! SequenceStateMachine (called by device workers after delivery)
//!   ├── sent, next step exists   → advance (next trigger + due time)
//!   ├── sent, step terminal      → complete
//!   └── permanently failed       → pause
//! ```
//!
//! Both ticks are safe to run in several processes at once: every mutation
//! that matters is a conditional store update, and losing a race is a silent
//! no-op.

pub mod campaigns;
pub mod engine;
pub mod sequences;
pub mod steps;

pub use campaigns::CampaignTrigger;
pub use engine::{TriggerScheduler, start_trigger_scheduler};
pub use sequences::SequenceTrigger;
pub use steps::{SequenceStateMachine, StepOutcome};
