//! Domain types for Convoy.
//!
//! `WorkItem` is the durable unit of work; `Convoy` is one scheduling run
//! over a batch of members. Both are plain serde types with no storage or
//! scheduling logic of their own.

mod convoy;
mod work_item;

pub use convoy::{
    AutoTuningPolicy, Convoy, ConvoyMember, ConvoyProgress, ConvoyStatus, MemberStatus,
};
pub use work_item::{WorkItem, WorkItemStatus};
