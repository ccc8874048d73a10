//! In-memory state store.
//!
//! Implements the same repository contracts as the Postgres store,
//! including claim tokens and leases, so pipeline tests run without a
//! database. Enabled by the `memory` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use seisync_core::{
    truncate_error, ActivityRecord, DocumentClaim, DocumentQuery, DocumentRef, DocumentRepository,
    DocumentStatus, Error, FailureKind, NewDocumentRef, NewWorkItem, PipelineStatus,
    PipelineStatusRepository, ProcessRecord, RecordRepository, Result, Stage, StageClaim,
    StatusCounts, StoredObject, SubStatus, WorkItem, WorkItemRepository, WorkQuery,
};

use crate::documents::next_document_status;
use crate::pipeline_status::next_failure_state;

#[derive(Debug, Clone, Default)]
struct ClaimSlot {
    token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct StatusEntry {
    row: PipelineStatus,
    claims: HashMap<Stage, ClaimSlot>,
}

#[derive(Debug, Clone)]
struct DocumentEntry {
    doc: DocumentRef,
    claim: ClaimSlot,
}

#[derive(Debug, Default)]
struct Inner {
    work_items: Vec<WorkItem>,
    statuses: HashMap<String, StatusEntry>,
    processes: HashMap<String, ProcessRecord>,
    activities: HashMap<String, Vec<ActivityRecord>>,
    documents: Vec<DocumentEntry>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn scope_of(&self, protocol: &str) -> Option<&str> {
        self.work_items
            .iter()
            .find(|w| w.protocol == protocol)
            .map(|w| w.scope.as_str())
    }

    fn in_scope(&self, protocol: &str, prefix: Option<&str>) -> bool {
        match prefix {
            None => true,
            Some(prefix) => self
                .scope_of(protocol)
                .map(|scope| scope.starts_with(prefix))
                .unwrap_or(false),
        }
    }

    /// Claimed stage entry, if the token still owns it.
    fn owned_stage(&mut self, claim: &StageClaim) -> Option<&mut StatusEntry> {
        self.statuses.get_mut(&claim.protocol).filter(|entry| {
            entry.row.stage(claim.stage).status == SubStatus::InProgress
                && entry
                    .claims
                    .get(&claim.stage)
                    .and_then(|slot| slot.token)
                    == Some(claim.token)
        })
    }

    fn finish_stage(&mut self, claim: &StageClaim) -> bool {
        let Some(entry) = self.owned_stage(claim) else {
            return false;
        };
        let state = entry.row.stage_mut(claim.stage);
        state.status = SubStatus::Completed;
        state.last_error = None;
        state.updated_at = Some(Utc::now());
        entry.claims.insert(claim.stage, ClaimSlot::default());
        true
    }

    fn owned_document(&mut self, claim: &DocumentClaim) -> Option<&mut DocumentEntry> {
        self.documents.iter_mut().find(|entry| {
            entry.doc.document_id == claim.document_id
                && entry.doc.status == DocumentStatus::Downloading
                && entry.claim.token == Some(claim.token)
        })
    }
}

fn lease_expired(claimed_at: Option<DateTime<Utc>>, lease: Duration) -> bool {
    match claimed_at {
        None => true,
        Some(at) => chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| at.checked_add_signed(lease))
            .map(|expires| expires <= Utc::now())
            .unwrap_or(false),
    }
}

/// Thread-safe in-memory implementation of all State Store traits.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, simulating a lost connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Internal("state store unavailable".to_string()));
        }
        Ok(())
    }

    /// Overwrite a stage's state directly, for arranging test scenarios.
    pub async fn set_stage_status(&self, protocol: &str, stage: Stage, status: SubStatus) {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .statuses
            .entry(protocol.to_string())
            .or_insert_with(|| StatusEntry {
                row: PipelineStatus::new(protocol),
                claims: HashMap::new(),
            });
        entry.row.stage_mut(stage).status = status;
        if status == SubStatus::InProgress {
            entry.claims.insert(
                stage,
                ClaimSlot {
                    token: Some(Uuid::new_v4()),
                    claimed_at: Some(Utc::now()),
                },
            );
        }
    }
}

#[async_trait]
impl WorkItemRepository for MemoryStateStore {
    async fn insert_work_items(&self, items: &[NewWorkItem]) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let mut inserted = 0;
        for item in items {
            if inner.work_items.iter().any(|w| w.protocol == item.protocol) {
                continue;
            }
            let id = inner.next_id();
            inner.work_items.push(WorkItem {
                id,
                protocol: item.protocol.clone(),
                external_id: item.external_id.clone(),
                occurred_at: item.occurred_at,
                classification: item.classification.clone(),
                scope: item.scope.clone(),
                created_at: Utc::now(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn select_work_items(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let limit = query.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(inner
            .work_items
            .iter()
            .filter(|w| query.matches_scope(&w.scope))
            .filter(|w| query.matches_since(w.occurred_at))
            .filter(|w| query.matches_status(inner.statuses.get(&w.protocol).map(|e| &e.row)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_work_items(&self, query: &WorkQuery) -> Result<i64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .work_items
            .iter()
            .filter(|w| query.matches_scope(&w.scope))
            .filter(|w| query.matches_since(w.occurred_at))
            .filter(|w| query.matches_status(inner.statuses.get(&w.protocol).map(|e| &e.row)))
            .count() as i64)
    }
}

#[async_trait]
impl PipelineStatusRepository for MemoryStateStore {
    async fn get_status(&self, protocol: &str) -> Result<Option<PipelineStatus>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.statuses.get(protocol).map(|e| e.row.clone()))
    }

    async fn claim_stage(
        &self,
        protocol: &str,
        stage: Stage,
        lease: Duration,
    ) -> Result<Option<StageClaim>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let entry = inner
            .statuses
            .entry(protocol.to_string())
            .or_insert_with(|| StatusEntry {
                row: PipelineStatus::new(protocol),
                claims: HashMap::new(),
            });

        let slot = entry.claims.get(&stage).cloned().unwrap_or_default();
        let claimable = match entry.row.stage(stage).status {
            SubStatus::Pending => true,
            SubStatus::InProgress => lease_expired(slot.claimed_at, lease),
            SubStatus::Completed | SubStatus::Error => false,
        };
        if !claimable {
            return Ok(None);
        }

        let token = Uuid::new_v4();
        let now = Utc::now();
        let state = entry.row.stage_mut(stage);
        state.status = SubStatus::InProgress;
        state.updated_at = Some(now);
        entry.claims.insert(
            stage,
            ClaimSlot {
                token: Some(token),
                claimed_at: Some(now),
            },
        );

        Ok(Some(StageClaim {
            protocol: protocol.to_string(),
            stage,
            token,
        }))
    }

    async fn complete_metadata(&self, claim: &StageClaim, record: &ProcessRecord) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if !inner.finish_stage(claim) {
            return Ok(false);
        }
        inner
            .processes
            .insert(record.protocol.clone(), record.clone());
        Ok(true)
    }

    async fn complete_documents(
        &self,
        claim: &StageClaim,
        documents: &[NewDocumentRef],
    ) -> Result<Option<u64>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if !inner.finish_stage(claim) {
            return Ok(None);
        }

        let mut inserted = 0;
        for doc in documents {
            if inner
                .documents
                .iter()
                .any(|e| e.doc.document_id == doc.document_id)
            {
                continue;
            }
            let scope = inner.scope_of(&doc.protocol).map(str::to_string);
            let id = inner.next_id();
            inner.documents.push(DocumentEntry {
                doc: DocumentRef {
                    id,
                    document_id: doc.document_id.clone(),
                    protocol: doc.protocol.clone(),
                    unit_id: doc.unit_id.clone(),
                    scope,
                    number: doc.number.clone(),
                    doc_type: doc.doc_type.clone(),
                    document_date: doc.document_date,
                    signed: doc.signed,
                    status: DocumentStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    content_hash: None,
                    storage_key: None,
                    size_bytes: None,
                    content_type: None,
                    created_at: Utc::now(),
                    downloaded_at: None,
                },
                claim: ClaimSlot::default(),
            });
            inserted += 1;
        }
        Ok(Some(inserted))
    }

    async fn complete_activity(
        &self,
        claim: &StageClaim,
        activities: &[ActivityRecord],
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if !inner.finish_stage(claim) {
            return Ok(false);
        }
        inner
            .activities
            .insert(claim.protocol.clone(), activities.to_vec());
        Ok(true)
    }

    async fn fail_stage(
        &self,
        claim: &StageClaim,
        error: &str,
        kind: FailureKind,
        max_retries: i32,
    ) -> Result<Option<SubStatus>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.owned_stage(claim) else {
            return Ok(None);
        };

        let state = entry.row.stage_mut(claim.stage);
        let (retry_count, status) = next_failure_state(state.retry_count, kind, max_retries);
        state.status = status;
        state.retry_count = retry_count;
        state.last_error = Some(truncate_error(error));
        state.updated_at = Some(Utc::now());
        entry.claims.insert(claim.stage, ClaimSlot::default());
        Ok(Some(status))
    }

    async fn reset_stage_errors(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let protocols: Vec<String> = inner
            .statuses
            .iter()
            .filter(|(_, e)| e.row.stage(stage).status == SubStatus::Error)
            .map(|(p, _)| p.clone())
            .filter(|p| inner.in_scope(p, scope_prefix))
            .collect();

        for protocol in &protocols {
            if let Some(entry) = inner.statuses.get_mut(protocol) {
                let state = entry.row.stage_mut(stage);
                state.status = SubStatus::Pending;
                state.retry_count = 0;
                state.updated_at = Some(Utc::now());
            }
        }
        Ok(protocols.len() as u64)
    }

    async fn stage_counts(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<StatusCounts> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut counts = StatusCounts::default();
        for item in inner
            .work_items
            .iter()
            .filter(|w| inner.in_scope(&w.protocol, scope_prefix))
        {
            let status = inner
                .statuses
                .get(&item.protocol)
                .map(|e| e.row.stage(stage).status)
                .unwrap_or_default();
            match status {
                SubStatus::Pending => counts.pending += 1,
                SubStatus::InProgress => counts.in_progress += 1,
                SubStatus::Completed => counts.completed += 1,
                SubStatus::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl RecordRepository for MemoryStateStore {
    async fn get_process(&self, protocol: &str) -> Result<Option<ProcessRecord>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.processes.get(protocol).cloned())
    }

    async fn list_activities(&self, protocol: &str) -> Result<Vec<ActivityRecord>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.activities.get(protocol).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DocumentRepository for MemoryStateStore {
    async fn select_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentRef>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let limit = query.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(inner
            .documents
            .iter()
            .filter(|e| !e.doc.status.is_terminal())
            .filter(|e| inner.in_scope(&e.doc.protocol, query.scope_prefix.as_deref()))
            .filter(|e| query.matches(&e.doc.document_id, &e.doc.protocol))
            .take(limit)
            .map(|e| e.doc.clone())
            .collect())
    }

    async fn count_documents(&self, query: &DocumentQuery) -> Result<i64> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .iter()
            .filter(|e| !e.doc.status.is_terminal())
            .filter(|e| inner.in_scope(&e.doc.protocol, query.scope_prefix.as_deref()))
            .filter(|e| query.matches(&e.doc.document_id, &e.doc.protocol))
            .count() as i64)
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .iter()
            .find(|e| e.doc.document_id == document_id)
            .map(|e| e.doc.clone()))
    }

    async fn list_documents(&self, protocol: &str) -> Result<Vec<DocumentRef>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .iter()
            .filter(|e| e.doc.protocol == protocol)
            .map(|e| e.doc.clone())
            .collect())
    }

    async fn claim_document(
        &self,
        document_id: &str,
        lease: Duration,
    ) -> Result<Option<DocumentClaim>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner
            .documents
            .iter_mut()
            .find(|e| e.doc.document_id == document_id)
        else {
            return Ok(None);
        };

        let claimable = match entry.doc.status {
            DocumentStatus::Pending => true,
            DocumentStatus::Downloading => lease_expired(entry.claim.claimed_at, lease),
            DocumentStatus::Completed | DocumentStatus::Error => false,
        };
        if !claimable {
            return Ok(None);
        }

        let token = Uuid::new_v4();
        entry.doc.status = DocumentStatus::Downloading;
        entry.doc.attempts += 1;
        entry.claim = ClaimSlot {
            token: Some(token),
            claimed_at: Some(Utc::now()),
        };

        Ok(Some(DocumentClaim {
            document_id: document_id.to_string(),
            token,
            attempt: entry.doc.attempts,
        }))
    }

    async fn complete_document(
        &self,
        claim: &DocumentClaim,
        object: &StoredObject,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.owned_document(claim) else {
            return Ok(false);
        };
        entry.doc.status = DocumentStatus::Completed;
        entry.doc.content_hash = Some(object.content_hash.clone());
        entry.doc.storage_key = Some(object.storage_key.clone());
        entry.doc.size_bytes = Some(object.size_bytes);
        entry.doc.content_type = object.content_type.clone();
        entry.doc.last_error = None;
        entry.doc.downloaded_at = Some(Utc::now());
        entry.claim = ClaimSlot::default();
        Ok(true)
    }

    async fn fail_document(
        &self,
        claim: &DocumentClaim,
        error: &str,
        kind: FailureKind,
        max_attempts: i32,
    ) -> Result<Option<DocumentStatus>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.owned_document(claim) else {
            return Ok(None);
        };
        let status = next_document_status(claim.attempt, kind, max_attempts);
        entry.doc.status = status;
        entry.doc.last_error = Some(truncate_error(error));
        entry.claim = ClaimSlot::default();
        Ok(Some(status))
    }

    async fn reset_document_errors(&self, scope_prefix: Option<&str>) -> Result<u64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .documents
            .iter()
            .filter(|e| e.doc.status == DocumentStatus::Error)
            .filter(|e| inner.in_scope(&e.doc.protocol, scope_prefix))
            .map(|e| e.doc.document_id.clone())
            .collect();

        for entry in inner
            .documents
            .iter_mut()
            .filter(|e| ids.contains(&e.doc.document_id))
        {
            entry.doc.status = DocumentStatus::Pending;
            entry.doc.attempts = 0;
        }
        Ok(ids.len() as u64)
    }

    async fn document_counts(&self, scope_prefix: Option<&str>) -> Result<StatusCounts> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut counts = StatusCounts::default();
        for entry in inner
            .documents
            .iter()
            .filter(|e| inner.in_scope(&e.doc.protocol, scope_prefix))
        {
            match entry.doc.status {
                DocumentStatus::Pending => counts.pending += 1,
                DocumentStatus::Downloading => counts.in_progress += 1,
                DocumentStatus::Completed => counts.completed += 1,
                DocumentStatus::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }
}
