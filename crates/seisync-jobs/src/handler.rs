//! Per-item worker contract.

use async_trait::async_trait;
use serde::Serialize;

use seisync_core::Result;

/// What happened to one item in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// All work for the item is persisted.
    Completed,
    /// The item reached `error` (cap reached or terminal failure).
    Errored,
    /// A retryable failure left the item `pending` for a later run.
    Deferred,
    /// Another run owns the item or it was already terminal.
    Skipped,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Completed => "completed",
            ItemOutcome::Errored => "errored",
            ItemOutcome::Deferred => "deferred",
            ItemOutcome::Skipped => "skipped",
        }
    }
}

/// Processes one item of a batch.
///
/// Per-item failures are recorded in the state store and reported as an
/// [`ItemOutcome`]. An `Err` means the infrastructure failed (state store
/// unreachable, credentials rejected) and aborts the run.
#[async_trait]
pub trait ItemWorker: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Short name used in logs and events.
    fn name(&self) -> &'static str;

    /// Identifier of an item for logs and events.
    fn item_key(&self, item: &Self::Item) -> String;

    async fn process(&self, item: Self::Item) -> Result<ItemOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ItemOutcome::Deferred).unwrap(),
            "\"deferred\""
        );
        assert_eq!(ItemOutcome::Skipped.as_str(), "skipped");
    }
}
