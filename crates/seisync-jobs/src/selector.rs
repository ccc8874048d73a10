//! Work selection.
//!
//! What to do next is a pure function of persisted status: resuming a
//! run is selecting again.

use std::sync::Arc;

use tracing::debug;

use seisync_core::{DocumentQuery, DocumentRef, Result, StateStore, WorkItem, WorkQuery};

/// A selection plus how many matching items the limit left out.
#[derive(Debug, Clone)]
pub struct Selection<T> {
    pub items: Vec<T>,
    pub remaining: u64,
}

/// Selects work items and documents that still need work.
#[derive(Clone)]
pub struct WorkSelector {
    store: Arc<dyn StateStore>,
}

impl WorkSelector {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Work items with a non-terminal status in any of the query's stages,
    /// in insertion order.
    pub async fn work_items(&self, query: &WorkQuery) -> Result<Selection<WorkItem>> {
        let items = self.store.select_work_items(query).await?;
        let total = self.store.count_work_items(query).await?;
        let remaining = (total as u64).saturating_sub(items.len() as u64);
        debug!(
            subsystem = "selector",
            stages = ?query.stages,
            scope = ?query.scope_prefix,
            selected = items.len(),
            remaining,
            "Selected work items"
        );
        Ok(Selection { items, remaining })
    }

    /// Document references still to download, in insertion order.
    pub async fn documents(&self, query: &DocumentQuery) -> Result<Selection<DocumentRef>> {
        let items = self.store.select_documents(query).await?;
        let total = self.store.count_documents(query).await?;
        let remaining = (total as u64).saturating_sub(items.len() as u64);
        debug!(
            subsystem = "selector",
            scope = ?query.scope_prefix,
            selected = items.len(),
            remaining,
            "Selected documents"
        );
        Ok(Selection { items, remaining })
    }
}
