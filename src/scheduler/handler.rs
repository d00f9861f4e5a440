//! Handler seam for member execution.
//!
//! Handlers are registered on the scheduler under string ids and resolved at
//! dispatch time. The trait-object seam keeps the engine independent of what
//! a handler actually does; anything `Send + Sync` that can produce a JSON
//! result qualifies.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::WorkItem;
use crate::error::Result;
use crate::store::WorkItemStore;

/// Executes one work item and produces a JSON result payload.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, work_item_id: &str, ctx: &HandlerContext) -> Result<serde_json::Value>;
}

/// Per-dispatch context passed to every handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    /// Rate-limit caller identity for this run.
    pub caller: String,

    /// Convoy the member belongs to; `None` in direct-task mode.
    pub convoy_id: Option<String>,

    /// Work-item store, when the scheduler has one attached.
    pub store: Option<Arc<WorkItemStore>>,
}

impl HandlerContext {
    /// Point read of the work item under execution, when a store is attached.
    pub fn work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        match &self.store {
            Some(store) => store.get(id),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("caller", &self.caller)
            .field("convoy_id", &self.convoy_id)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
