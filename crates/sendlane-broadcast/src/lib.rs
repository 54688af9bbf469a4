//! # Sendlane Broadcast
//!
//! The delivery runtime: pools of per-device workers that drain pending
//! message rows, paced to look human and coordinated so no message goes out
//! twice no matter how many engine processes run.
//!
//! ## Architecture
//! ```text
//! BroadcastManager (process-wide registry)
//!   ├── DevicePool "campaign:42"
//!   │     ├── DeviceWorker dev-a ──┐  fetch batch → re-verify status
//!   │     └── DeviceWorker dev-b ──┤  → per-message send lock → send
//!   │                              │  → mark sent / retry / fail
//!   ├── DevicePool "sequence:s1"   │  → advance contact on success
//!   │     └── DeviceWorker dev-a ──┘
//!   └── completion monitor per pool → teardown when all rows terminal
//!
//! Pending-row processor (tokio interval)
//!   └── distinct (device, broadcast) pairs with pending rows
//!        → ensure pool exists → ensure worker exists
//! ```
//!
//! Every worker sends strictly serially through its device, with a random
//! pause between messages; parallelism comes only from having many devices.

pub mod composer;
pub mod manager;
pub mod pool;
pub mod processor;
pub mod transport;
pub mod worker;

pub use composer::TemplateComposer;
pub use manager::BroadcastManager;
pub use pool::{DevicePool, PoolStatus};
pub use processor::start_broadcast_processor;
pub use transport::DryRunTransport;
pub use worker::{DeviceWorker, WorkerContext};
