//! Document fetch pipeline.
//!
//! Per document reference: claim, download, hash, store, record.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use seisync_client::{ApiError, DownloadedDocument, ErrorKind, SeiClient};
use seisync_core::{
    DocumentQuery, DocumentRef, DocumentStatus, Error, FailureKind, Result, StateStore,
    StoredObject,
};
use seisync_db::{store_document, StorageBackend};

use crate::config::SchedulerConfig;
use crate::handler::{ItemOutcome, ItemWorker};
use crate::metadata::with_unit_fallback;
use crate::scheduler::{BatchScheduler, BatchSummary, StopHandle};
use crate::selector::WorkSelector;
use crate::stage::{failure_kind, infrastructure_error};

/// Why a download attempt failed.
#[derive(Debug)]
enum DownloadFailure {
    Api(ApiError),
    /// The server answered 200 with no bytes.
    EmptyBody,
    /// Object storage refused the derived key.
    Rejected(String),
}

/// Worker that downloads one document.
pub struct DocumentWorker {
    client: Arc<SeiClient>,
    store: Arc<dyn StateStore>,
    storage: Arc<dyn StorageBackend>,
    config: SchedulerConfig,
}

impl DocumentWorker {
    pub fn new(
        client: Arc<SeiClient>,
        store: Arc<dyn StateStore>,
        storage: Arc<dyn StorageBackend>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            client,
            store,
            storage,
            config,
        }
    }

    /// Units to try: the one recorded on the reference, then the
    /// candidates for its scope.
    async fn units_for(&self, doc: &DocumentRef) -> std::result::Result<Vec<String>, ApiError> {
        let mut units = vec![doc.unit_id.clone()];
        if let Some(scope) = &doc.scope {
            for unit in self.client.unit_candidates(scope).await? {
                if !units.contains(&unit) {
                    units.push(unit);
                }
            }
        }
        Ok(units)
    }

    async fn download(
        &self,
        doc: &DocumentRef,
    ) -> std::result::Result<DownloadedDocument, DownloadFailure> {
        let client = &self.client;
        let document_id = doc.document_id.as_str();

        let first = client.download_document(&doc.unit_id, document_id).await;
        let downloaded = match first {
            Err(err) if err.kind() == ErrorKind::UnitAccessDenied => {
                let units = self.units_for(doc).await.map_err(DownloadFailure::Api)?;
                with_unit_fallback(&units[1..], |unit| async move {
                    client.download_document(&unit, document_id).await
                })
                .await
                .map_err(DownloadFailure::Api)?
            }
            other => other.map_err(DownloadFailure::Api)?,
        };

        if downloaded.bytes.is_empty() {
            return Err(DownloadFailure::EmptyBody);
        }
        Ok(downloaded)
    }
    /// Write the bytes to object storage. A refused key fails this
    /// document only; any other storage error aborts the run.
    async fn write_object(
        &self,
        doc: &DocumentRef,
        downloaded: &DownloadedDocument,
    ) -> Result<std::result::Result<StoredObject, DownloadFailure>> {
        let stored = store_document(
            self.storage.as_ref(),
            &doc.protocol,
            &doc.document_id,
            downloaded.filename.as_deref(),
            downloaded.content_type.clone(),
            &downloaded.bytes,
        )
        .await;
        match stored {
            Ok(object) => Ok(Ok(object)),
            Err(Error::InvalidInput(reason)) => Ok(Err(DownloadFailure::Rejected(reason))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ItemWorker for DocumentWorker {
    type Item = DocumentRef;

    fn name(&self) -> &'static str {
        "documents"
    }

    fn item_key(&self, doc: &DocumentRef) -> String {
        doc.document_id.clone()
    }

    async fn process(&self, doc: DocumentRef) -> Result<ItemOutcome> {
        let Some(claim) = self
            .store
            .claim_document(&doc.document_id, self.config.claim_lease)
            .await?
        else {
            debug!(subsystem = "pipeline", document_id = %doc.document_id, "Document not claimable");
            return Ok(ItemOutcome::Skipped);
        };

        let start = Instant::now();
        let fetched = match self.download(&doc).await {
            Ok(downloaded) => self.write_object(&doc, &downloaded).await?,
            Err(failure) => Err(failure),
        };
        let (message, kind) = match fetched {
            Ok(object) => {
                if !self.store.complete_document(&claim, &object).await? {
                    warn!(
                        subsystem = "pipeline",
                        document_id = %doc.document_id,
                        "Claim lost before completion"
                    );
                    return Ok(ItemOutcome::Skipped);
                }
                info!(
                    subsystem = "pipeline",
                    protocol = %doc.protocol,
                    document_id = %doc.document_id,
                    storage_key = %object.storage_key,
                    size_bytes = object.size_bytes,
                    attempt = claim.attempt,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Document stored"
                );
                return Ok(ItemOutcome::Completed);
            }
            Err(DownloadFailure::Api(err)) => {
                if let Some(fatal) = infrastructure_error(&err) {
                    return Err(fatal);
                }
                (err.to_string(), failure_kind(&err))
            }
            Err(DownloadFailure::EmptyBody) => (
                "empty document body".to_string(),
                FailureKind::Retryable,
            ),
            Err(DownloadFailure::Rejected(reason)) => (reason, FailureKind::Terminal),
        };

        let status = self
            .store
            .fail_document(&claim, &message, kind, self.config.max_retries)
            .await?;
        let outcome = match status {
            Some(DocumentStatus::Error) => ItemOutcome::Errored,
            Some(_) => ItemOutcome::Deferred,
            None => ItemOutcome::Skipped,
        };
        warn!(
            subsystem = "pipeline",
            protocol = %doc.protocol,
            document_id = %doc.document_id,
            attempt = claim.attempt,
            error = %message,
            outcome = outcome.as_str(),
            "Document download failed"
        );
        Ok(outcome)
    }
}

/// Document pipeline: selection plus one scheduler run.
pub struct DocumentPipeline {
    client: Arc<SeiClient>,
    store: Arc<dyn StateStore>,
    storage: Arc<dyn StorageBackend>,
    config: SchedulerConfig,
    stop: StopHandle,
}

impl DocumentPipeline {
    pub fn new(
        client: Arc<SeiClient>,
        store: Arc<dyn StateStore>,
        storage: Arc<dyn StorageBackend>,
        config: SchedulerConfig,
        stop: StopHandle,
    ) -> Self {
        Self {
            client,
            store,
            storage,
            config,
            stop,
        }
    }

    pub async fn run(&self, query: &DocumentQuery) -> Result<BatchSummary> {
        self.config.validate()?;
        let selection = WorkSelector::new(self.store.clone()).documents(query).await?;

        let worker = DocumentWorker::new(
            self.client.clone(),
            self.store.clone(),
            self.storage.clone(),
            self.config.clone(),
        );
        let scheduler = BatchScheduler::new(self.config.clone(), self.stop.clone());

        let mut summary = scheduler.run(selection.items, Arc::new(worker)).await?;
        summary.remaining = selection.remaining;
        Ok(summary)
    }
}
