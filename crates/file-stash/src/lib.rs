//! Transient file stash
//!
//! Stores uploaded files under random identifiers until they are fetched
//! (optionally removing them on first complete read) or age out. Removal
//! after access and removal by the background sweeper go through the same
//! idempotent delete, and per-item locking keeps a delete from pulling a
//! file out from under a reader.

mod access;
mod error;
mod id;
mod stash;
mod store;
mod sweeper;
mod types;

#[cfg(test)]
mod testing;

pub use access::{AccessPolicy, Delivery};
pub use error::{Result, StashError};
pub use id::StashId;
pub use stash::Stash;
pub use store::{sanitize_name, DeleteTicket, ItemReader, ItemStore, StoredItem};
pub use sweeper::{Sweeper, SweeperHandle};
pub use types::{DeleteOutcome, ItemInfo, ItemState, StashConfig, StashStats, SweepReport};
