//! Lifecycle of one pipeline stage of one work item.
//!
//! ```text
//! pending/in_progress ──claim──▶ in_progress ──fetch ok──▶ completed
//!                                     │
//!                                     └─fetch failed──▶ pending (retryable, below cap)
//!                                                       error   (cap reached or terminal)
//! ```
//!
//! Persisting the payload and marking the stage `completed` happen in one
//! store transaction guarded by the claim token.

use std::future::Future;
use std::time::Instant;

use tracing::{debug, info, warn};

use seisync_client::{ApiError, ErrorKind};
use seisync_core::{
    ActivityRecord, Error, FailureKind, NewDocumentRef, ProcessRecord, Result, Stage, StateStore,
    SubStatus,
};

use crate::config::SchedulerConfig;

/// Payload produced by a stage fetch.
#[derive(Debug, Clone)]
pub enum StagePayload {
    Metadata(ProcessRecord),
    Documents(Vec<NewDocumentRef>),
    Activity(Vec<ActivityRecord>),
}

impl StagePayload {
    fn stage(&self) -> Stage {
        match self {
            StagePayload::Metadata(_) => Stage::Metadata,
            StagePayload::Documents(_) => Stage::Documents,
            StagePayload::Activity(_) => Stage::Activity,
        }
    }
}

/// Result of driving one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    /// Retryable failure below the cap; back to `pending`.
    Deferred,
    Errored,
    /// Not claimed (terminal already, or owned by another run), or the
    /// claim was lost before it could be finished.
    NotClaimed,
}

/// How a failed call counts against the item.
pub fn failure_kind(err: &ApiError) -> FailureKind {
    match err.kind() {
        ErrorKind::ServerError
        | ErrorKind::Timeout
        | ErrorKind::NetworkError
        | ErrorKind::RateLimited => FailureKind::Retryable,
        _ => FailureKind::Terminal,
    }
}

/// Errors that must abort the run instead of being recorded on the item.
pub fn infrastructure_error(err: &ApiError) -> Option<Error> {
    match err {
        ApiError::Auth(message) => Some(Error::Auth(message.clone())),
        _ => None,
    }
}

/// Claim `stage` of `protocol`, run `fetch`, and record the result.
///
/// `fetch` is not called when the stage cannot be claimed. Returns `Err`
/// only for state store failures and rejected credentials; in the latter
/// case the claim is left in place and is reclaimable by the next run.
pub async fn drive<F, Fut>(
    store: &dyn StateStore,
    config: &SchedulerConfig,
    protocol: &str,
    stage: Stage,
    fetch: F,
) -> Result<StageOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<StagePayload, ApiError>>,
{
    let Some(claim) = store.claim_stage(protocol, stage, config.claim_lease).await? else {
        debug!(subsystem = "pipeline", protocol, %stage, "Stage not claimable");
        return Ok(StageOutcome::NotClaimed);
    };

    let start = Instant::now();
    let result = fetch().await;

    match result {
        Ok(payload) => {
            debug_assert_eq!(payload.stage(), stage);
            let persisted = match &payload {
                StagePayload::Metadata(record) => store.complete_metadata(&claim, record).await?,
                StagePayload::Documents(docs) => {
                    let inserted = store.complete_documents(&claim, docs).await?;
                    if let Some(inserted) = inserted {
                        debug!(
                            subsystem = "pipeline",
                            protocol,
                            listed = docs.len(),
                            inserted,
                            "Document listing stored"
                        );
                    }
                    inserted.is_some()
                }
                StagePayload::Activity(activities) => {
                    store.complete_activity(&claim, activities).await?
                }
            };

            if !persisted {
                warn!(subsystem = "pipeline", protocol, %stage, "Claim lost before completion");
                return Ok(StageOutcome::NotClaimed);
            }
            info!(
                subsystem = "pipeline",
                protocol,
                %stage,
                duration_ms = start.elapsed().as_millis() as u64,
                "Stage completed"
            );
            Ok(StageOutcome::Completed)
        }
        Err(err) => {
            if let Some(fatal) = infrastructure_error(&err) {
                return Err(fatal);
            }

            let kind = failure_kind(&err);
            let message = err.to_string();
            let status = store
                .fail_stage(&claim, &message, kind, config.max_retries)
                .await?;

            let outcome = match status {
                Some(SubStatus::Error) => StageOutcome::Errored,
                Some(_) => StageOutcome::Deferred,
                None => StageOutcome::NotClaimed,
            };
            warn!(
                subsystem = "pipeline",
                protocol,
                %stage,
                error_kind = err.kind().as_str(),
                error = %message,
                outcome = ?outcome,
                duration_ms = start.elapsed().as_millis() as u64,
                "Stage failed"
            );
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use seisync_core::{NewWorkItem, PipelineStatusRepository, WorkItemRepository};
    use seisync_db::MemoryStateStore;
    use serde_json::json;

    const PROTOCOL: &str = "00002.000001/2025-01";

    fn record() -> ProcessRecord {
        ProcessRecord {
            protocol: PROTOCOL.to_string(),
            procedure_id: Some("1".to_string()),
            unit_id: "7".to_string(),
            procedure_type: None,
            specification: None,
            access_level: None,
            legal_basis: None,
            observation: None,
            opened_at: None,
            concluded_at: None,
            interested: json!([]),
            subjects: json!([]),
            generating_unit: None,
            raw: json!({}),
        }
    }

    async fn store() -> MemoryStateStore {
        let store = MemoryStateStore::new();
        store
            .insert_work_items(&[NewWorkItem::new(PROTOCOL, "SEAD-PI/GAB")])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_success_completes_stage() {
        let store = store().await;
        let outcome = drive(&store, &SchedulerConfig::default(), PROTOCOL, Stage::Metadata, || async {
            Ok(StagePayload::Metadata(record()))
        })
        .await
        .unwrap();

        assert_eq!(outcome, StageOutcome::Completed);
        let status = store.get_status(PROTOCOL).await.unwrap().unwrap();
        assert_eq!(status.metadata.status, SubStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_stage_is_not_fetched() {
        let store = store().await;
        store
            .set_stage_status(PROTOCOL, Stage::Metadata, SubStatus::Completed)
            .await;
        let calls = AtomicUsize::new(0);

        let outcome = drive(&store, &SchedulerConfig::default(), PROTOCOL, Stage::Metadata, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(StagePayload::Metadata(record()))
        })
        .await
        .unwrap();

        assert_eq!(outcome, StageOutcome::NotClaimed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_defers_until_cap() {
        let store = store().await;
        let config = SchedulerConfig::default().with_max_retries(2);

        let fail = || async {
            Err(ApiError::Server {
                status: 503,
                message: "down".to_string(),
            })
        };
        let first = drive(&store, &config, PROTOCOL, Stage::Activity, fail).await.unwrap();
        let second = drive(&store, &config, PROTOCOL, Stage::Activity, fail).await.unwrap();

        assert_eq!(first, StageOutcome::Deferred);
        assert_eq!(second, StageOutcome::Errored);
        let status = store.get_status(PROTOCOL).await.unwrap().unwrap();
        assert_eq!(status.activity.retry_count, 2);
        assert!(status.activity.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_not_found_is_terminal_without_retry() {
        let store = store().await;
        let outcome = drive(&store, &SchedulerConfig::default(), PROTOCOL, Stage::Metadata, || async {
            Err(ApiError::NotFound("Processo não encontrado".to_string()))
        })
        .await
        .unwrap();

        assert_eq!(outcome, StageOutcome::Errored);
        let status = store.get_status(PROTOCOL).await.unwrap().unwrap();
        assert_eq!(status.metadata.status, SubStatus::Error);
        assert_eq!(status.metadata.retry_count, 0);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts() {
        let store = store().await;
        let err = drive(&store, &SchedulerConfig::default(), PROTOCOL, Stage::Metadata, || async {
            Err(ApiError::Auth("bad password".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = store().await;
        store.set_unavailable(true);
        let result = drive(&store, &SchedulerConfig::default(), PROTOCOL, Stage::Metadata, || async {
            Ok(StagePayload::Metadata(record()))
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(failure_kind(&ApiError::Timeout), FailureKind::Retryable);
        assert_eq!(failure_kind(&ApiError::RateLimited), FailureKind::Retryable);
        assert_eq!(
            failure_kind(&ApiError::NotFound(String::new())),
            FailureKind::Terminal
        );
        assert_eq!(
            failure_kind(&ApiError::Unauthorized(String::new())),
            FailureKind::Terminal
        );
        assert_eq!(
            failure_kind(&ApiError::Decode(String::new())),
            FailureKind::Terminal
        );
    }
}
