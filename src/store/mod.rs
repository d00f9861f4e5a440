//! Persistent work-item storage.
//!
//! `WorkItemStore` provides optimistically-locked CRUD over the embedded
//! SQLite database, multiplexed through the `ConnectionPool`. An optional
//! flat JSONL export mirrors the item set for external tooling; it is a
//! best-effort side channel, never part of the correctness contract.

mod export;
mod work_item_store;

pub use work_item_store::{WorkItemFilter, WorkItemStore};
