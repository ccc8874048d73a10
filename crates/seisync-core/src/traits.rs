//! Core traits for seisync abstractions.
//!
//! The State Store is split into one repository trait per table family.
//! [`StateStore`] is the union the pipelines depend on; it is implemented
//! for every type that implements all of them.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// WORK ITEMS
// =============================================================================

/// Read access to work items, plus seeding for the upstream extraction step.
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Insert work items; existing protocols are left untouched.
    /// Returns how many rows were new.
    async fn insert_work_items(&self, items: &[NewWorkItem]) -> Result<u64>;

    /// Items matching the query, in insertion order.
    async fn select_work_items(&self, query: &WorkQuery) -> Result<Vec<WorkItem>>;

    /// Number of items matching the query, ignoring its limit.
    async fn count_work_items(&self, query: &WorkQuery) -> Result<i64>;
}

// =============================================================================
// PIPELINE STATUS
// =============================================================================

/// Per-stage state transitions of work items.
#[async_trait]
pub trait PipelineStatusRepository: Send + Sync {
    /// Status row of an item, if one was ever written.
    async fn get_status(&self, protocol: &str) -> Result<Option<PipelineStatus>>;

    /// Move a stage to `in_progress` under a fresh claim token.
    ///
    /// Succeeds when the stage is `pending` (or has no row yet), or is
    /// `in_progress` with a claim older than `lease`. Returns `None` when
    /// the stage is terminal or currently owned by someone else.
    async fn claim_stage(
        &self,
        protocol: &str,
        stage: Stage,
        lease: Duration,
    ) -> Result<Option<StageClaim>>;

    /// Upsert the process record and mark the metadata stage completed.
    /// Returns `false` if the claim was lost; nothing is written then.
    async fn complete_metadata(&self, claim: &StageClaim, record: &ProcessRecord) -> Result<bool>;

    /// Insert unseen document references as `pending` and mark the
    /// documents stage completed. Returns the number of new references,
    /// or `None` if the claim was lost.
    async fn complete_documents(
        &self,
        claim: &StageClaim,
        documents: &[NewDocumentRef],
    ) -> Result<Option<u64>>;

    /// Replace the item's activity history and mark the stage completed.
    async fn complete_activity(
        &self,
        claim: &StageClaim,
        activities: &[ActivityRecord],
    ) -> Result<bool>;

    /// Record a failed attempt. Returns the resulting status, or `None`
    /// if the claim was lost.
    async fn fail_stage(
        &self,
        claim: &StageClaim,
        error: &str,
        kind: FailureKind,
        max_retries: i32,
    ) -> Result<Option<SubStatus>>;

    /// Operator action: move `error` stages back to `pending` with a
    /// cleared retry count. Returns the number of rows reset.
    async fn reset_stage_errors(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<u64>;

    /// Status histogram of one stage. Items without a row count as pending.
    async fn stage_counts(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<StatusCounts>;
}

// =============================================================================
// FETCHED RECORDS
// =============================================================================

/// Read access to persisted payloads.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn get_process(&self, protocol: &str) -> Result<Option<ProcessRecord>>;

    /// Activity history of a process in timestamp order.
    async fn list_activities(&self, protocol: &str) -> Result<Vec<ActivityRecord>>;
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Document reference lifecycle.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Downloadable references (`pending`, or `downloading` left over by
    /// an interrupted run) in insertion order.
    async fn select_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentRef>>;

    /// Number of downloadable references, ignoring the limit.
    async fn count_documents(&self, query: &DocumentQuery) -> Result<i64>;

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>>;

    /// References of one process, in insertion order.
    async fn list_documents(&self, protocol: &str) -> Result<Vec<DocumentRef>>;

    /// Move a reference to `downloading` and count the attempt.
    async fn claim_document(
        &self,
        document_id: &str,
        lease: Duration,
    ) -> Result<Option<DocumentClaim>>;

    /// Mark the download completed with its stored object.
    async fn complete_document(&self, claim: &DocumentClaim, object: &StoredObject)
        -> Result<bool>;

    /// Record a failed download. `error` once `attempts` reaches
    /// `max_attempts` or for terminal failures, else back to `pending`.
    async fn fail_document(
        &self,
        claim: &DocumentClaim,
        error: &str,
        kind: FailureKind,
        max_attempts: i32,
    ) -> Result<Option<DocumentStatus>>;

    /// Operator action: move `error` documents back to `pending` with a
    /// cleared attempt counter.
    async fn reset_document_errors(&self, scope_prefix: Option<&str>) -> Result<u64>;

    /// Status histogram; `downloading` is reported as `in_progress`.
    async fn document_counts(&self, scope_prefix: Option<&str>) -> Result<StatusCounts>;
}

/// Everything the pipelines need from the durable store.
pub trait StateStore:
    WorkItemRepository + PipelineStatusRepository + RecordRepository + DocumentRepository
{
}

impl<T> StateStore for T where
    T: WorkItemRepository + PipelineStatusRepository + RecordRepository + DocumentRepository
{
}
