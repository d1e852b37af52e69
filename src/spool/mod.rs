//! # Spool Module
//!
//! Asynchronous write path in front of a disk store.
//!
//! ## Flow
//!
//! ```text
//! update/remove ──► Purgatory (staged, visible to get)
//!                      │
//!                      ▼ (same lock)
//!                  EventQueue ──► spool-{region} thread ──► DiskStore
//! ```
//!
//! A staged put is answered from purgatory until the worker has written it.
//! A staged remove leaves a tombstone so that a later `get` never falls
//! through to the copy that is still on disk.

mod coordinator;
mod event_queue;
mod purgatory;

pub use coordinator::{SpoolCoordinator, SpoolStats};
pub use event_queue::{EventQueue, QueueStatus, SpoolEvent, SpoolListener};
pub use purgatory::{Lookup, Purgatory, PurgatoryState};
