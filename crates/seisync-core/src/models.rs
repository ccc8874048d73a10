//! Core data models for seisync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;

// =============================================================================
// WORK ITEMS
// =============================================================================

/// One SEI process eligible for synchronization.
///
/// Created by the upstream extraction step and never mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Insertion order; the selector sorts on it.
    pub id: i64,
    /// SEI protocol number, e.g. `00002.006238/2025-95`.
    pub protocol: String,
    /// Internal SEI protocol id.
    pub external_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    /// Procedure type reported by the extraction step.
    pub classification: Option<String>,
    /// Organizational unit label, e.g. `SEAD/DG`.
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

/// Request to seed a work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub protocol: String,
    pub external_id: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub classification: Option<String>,
    pub scope: String,
}

impl NewWorkItem {
    pub fn new(protocol: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            scope: scope.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// PIPELINE STATUS
// =============================================================================

/// The three independent progress tracks of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Process metadata (`procedimentos/consulta`).
    Metadata,
    /// Document listing (`procedimentos/documentos`).
    Documents,
    /// Activity history (`procedimentos/andamentos`).
    Activity,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Metadata, Stage::Documents, Stage::Activity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Metadata => "metadata",
            Stage::Documents => "documents",
            Stage::Activity => "activity",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata" => Ok(Stage::Metadata),
            "documents" => Ok(Stage::Documents),
            "activity" => Ok(Stage::Activity),
            other => Err(Error::InvalidInput(format!("unknown stage: {}", other))),
        }
    }
}

/// Status of one sub-pipeline of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Error,
}

impl SubStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatus::Pending => "pending",
            SubStatus::InProgress => "in_progress",
            SubStatus::Completed => "completed",
            SubStatus::Error => "error",
        }
    }

    /// Terminal statuses are never selected again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubStatus::Completed | SubStatus::Error)
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubStatus::Pending),
            "in_progress" => Ok(SubStatus::InProgress),
            "completed" => Ok(SubStatus::Completed),
            "error" => Ok(SubStatus::Error),
            other => Err(Error::InvalidInput(format!("unknown sub-status: {}", other))),
        }
    }
}

/// State of a single stage within a [`PipelineStatus`] row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub status: SubStatus,
    /// Failed retryable attempts so far.
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-item progress row. A missing row reads as all stages pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub protocol: String,
    pub metadata: StageState,
    pub documents: StageState,
    pub activity: StageState,
}

impl PipelineStatus {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            metadata: StageState::default(),
            documents: StageState::default(),
            activity: StageState::default(),
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Metadata => &self.metadata,
            Stage::Documents => &self.documents,
            Stage::Activity => &self.activity,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::Metadata => &mut self.metadata,
            Stage::Documents => &mut self.documents,
            Stage::Activity => &mut self.activity,
        }
    }

    /// True when every stage is completed.
    pub fn is_complete(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|s| self.stage(*s).status == SubStatus::Completed)
    }
}

/// Proof of ownership of one stage of one work item.
///
/// Completion and failure writes are conditional on the token, so a run
/// that lost the claim to another scheduler cannot overwrite its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageClaim {
    pub protocol: String,
    pub stage: Stage,
    pub token: Uuid,
}

/// How a failed attempt is charged against the retry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Counts one attempt; moves to `error` once the cap is reached.
    Retryable,
    /// Moves to `error` immediately without consuming a retry.
    Terminal,
}

/// Counts of one stage's statuses, for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub error: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.error
    }
}

// =============================================================================
// QUERIES
// =============================================================================

/// Selection of work items for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQuery {
    /// An item matches when any of these stages is not terminal.
    pub stages: Vec<Stage>,
    /// Prefix match on [`WorkItem::scope`].
    pub scope_prefix: Option<String>,
    /// Only items that occurred at or after this instant. Items without
    /// an `occurred_at` never match once this is set.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

impl WorkQuery {
    pub fn for_stage(stage: Stage) -> Self {
        Self {
            stages: vec![stage],
            scope_prefix: None,
            since: None,
            limit: None,
        }
    }

    /// All three metadata-pipeline stages.
    pub fn all_stages() -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
            scope_prefix: None,
            since: None,
            limit: None,
        }
    }

    pub fn with_scope(mut self, prefix: impl Into<String>) -> Self {
        self.scope_prefix = Some(prefix.into());
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an item's status row (or its absence) matches this query.
    pub fn matches_status(&self, status: Option<&PipelineStatus>) -> bool {
        match status {
            None => !self.stages.is_empty(),
            Some(row) => self
                .stages
                .iter()
                .any(|stage| !row.stage(*stage).status.is_terminal()),
        }
    }

    pub fn matches_scope(&self, scope: &str) -> bool {
        self.scope_prefix
            .as_deref()
            .map(|prefix| scope.starts_with(prefix))
            .unwrap_or(true)
    }

    pub fn matches_since(&self, occurred_at: Option<DateTime<Utc>>) -> bool {
        match (self.since, occurred_at) {
            (None, _) => true,
            (Some(since), Some(at)) => at >= since,
            (Some(_), None) => false,
        }
    }
}

/// Selection of document references for a download run.
///
/// `document_id` and `protocol` narrow the run to one document (or one
/// process). Status rules still apply: a `completed` or `error` document
/// is only picked up again after a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentQuery {
    /// Prefix match on the owning work item's scope.
    pub scope_prefix: Option<String>,
    /// Exact SEI document id.
    pub document_id: Option<String>,
    /// Exact protocol of the owning work item.
    pub protocol: Option<String>,
    pub limit: Option<i64>,
}

impl DocumentQuery {
    pub fn with_scope(mut self, prefix: impl Into<String>) -> Self {
        self.scope_prefix = Some(prefix.into());
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn matches(&self, document_id: &str, protocol: &str) -> bool {
        self.document_id.as_deref().map_or(true, |id| id == document_id)
            && self.protocol.as_deref().map_or(true, |p| p == protocol)
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Fetched process metadata. Upserted by protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub protocol: String,
    /// SEI procedure id (`IdProcedimento`).
    pub procedure_id: Option<String>,
    /// Unit id the metadata was fetched through.
    pub unit_id: String,
    pub procedure_type: Option<String>,
    pub specification: Option<String>,
    pub access_level: Option<String>,
    pub legal_basis: Option<String>,
    pub observation: Option<String>,
    pub opened_at: Option<NaiveDateTime>,
    pub concluded_at: Option<NaiveDateTime>,
    pub interested: JsonValue,
    pub subjects: JsonValue,
    pub generating_unit: Option<String>,
    pub raw: JsonValue,
}

/// Download status of a document reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Downloading => "downloading",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Error)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "downloading" => Ok(DocumentStatus::Downloading),
            "completed" => Ok(DocumentStatus::Completed),
            "error" => Ok(DocumentStatus::Error),
            other => Err(Error::InvalidInput(format!(
                "unknown document status: {}",
                other
            ))),
        }
    }
}

/// A document discovered in a process's document listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocumentRef {
    /// SEI document id (`IdDocumento`), the unique key.
    pub document_id: String,
    pub protocol: String,
    /// Unit the listing was fetched through; downloads reuse it.
    pub unit_id: String,
    pub number: Option<String>,
    pub doc_type: Option<String>,
    pub document_date: Option<NaiveDateTime>,
    pub generating_unit: Option<String>,
    pub signed: bool,
    pub signers: JsonValue,
    pub access_level: Option<String>,
    pub raw: JsonValue,
}

/// A document reference row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: i64,
    pub document_id: String,
    pub protocol: String,
    pub unit_id: String,
    /// Scope of the owning work item.
    pub scope: Option<String>,
    pub number: Option<String>,
    pub doc_type: Option<String>,
    pub document_date: Option<NaiveDateTime>,
    pub signed: bool,
    pub status: DocumentStatus,
    /// Download attempts started so far.
    pub attempts: i32,
    pub last_error: Option<String>,
    /// SHA-256 of the stored bytes, lowercase hex.
    pub content_hash: Option<String>,
    pub storage_key: Option<String>,
    pub size_bytes: Option<i64>,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Proof of ownership of one document download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentClaim {
    pub document_id: String,
    pub token: Uuid,
    /// Attempt number of this claim (1-based).
    pub attempt: i32,
}

/// Result of writing a document to object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub storage_key: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
}

/// One entry of a process's activity history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub protocol: String,
    pub activity_id: Option<String>,
    pub task: Option<String>,
    pub description: Option<String>,
    pub user_login: Option<String>,
    pub user_name: Option<String>,
    pub unit: Option<String>,
    pub occurred_at: Option<NaiveDateTime>,
    pub attributes: JsonValue,
    pub raw: JsonValue,
}

/// Clip an error message to the stored length, on a char boundary.
pub fn truncate_error(message: &str) -> String {
    message
        .chars()
        .take(defaults::LAST_ERROR_MAX_CHARS)
        .collect()
}
