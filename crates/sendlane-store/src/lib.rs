//! # Sendlane Store
//!
//! Implementations of the store capabilities the engine consumes:
//!
//! - [`SqliteStore`] — durable, file-backed, usable by several engine
//!   processes against one shared database file. Implements both
//!   `MessageStore` and `CoordinationStore` (leased locks live in the same
//!   file, so conditional updates are atomic).
//! - [`MemoryStore`] — in-process store for unit tests and local experiments
//!   with collaborator behavior. The engine never falls back to it for
//!   coordination: a multi-process deployment without a shared store refuses
//!   to start.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
