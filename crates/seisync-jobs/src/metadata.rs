//! Metadata fetch pipeline.
//!
//! For each work item the three stages (process metadata, document
//! listing, activity history) are driven concurrently and independently.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use seisync_client::{ApiError, ErrorKind, SeiClient};
use seisync_core::{Result, Stage, StateStore, WorkItem, WorkQuery};

use crate::config::SchedulerConfig;
use crate::handler::{ItemOutcome, ItemWorker};
use crate::scheduler::{BatchScheduler, BatchSummary, StopHandle};
use crate::selector::WorkSelector;
use crate::stage::{drive, StageOutcome, StagePayload};

/// Run `call` against each candidate unit in turn while the API answers
/// that the unit cannot see the process.
pub async fn with_unit_fallback<T, F, Fut>(
    candidates: &[String],
    mut call: F,
) -> std::result::Result<T, ApiError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let mut last_denial = None;
    for unit in candidates {
        match call(unit.clone()).await {
            Err(err) if err.kind() == ErrorKind::UnitAccessDenied => {
                last_denial = Some(err);
            }
            other => return other,
        }
    }
    Err(last_denial.unwrap_or_else(|| {
        ApiError::UnitAccessDenied("no unit available for this scope".to_string())
    }))
}

/// Combine per-stage outcomes into the item outcome.
pub fn combine_outcomes(outcomes: &[StageOutcome]) -> ItemOutcome {
    if outcomes.contains(&StageOutcome::Errored) {
        ItemOutcome::Errored
    } else if outcomes.contains(&StageOutcome::Deferred) {
        ItemOutcome::Deferred
    } else if outcomes.iter().all(|o| *o == StageOutcome::NotClaimed) {
        ItemOutcome::Skipped
    } else {
        ItemOutcome::Completed
    }
}

/// Worker that fetches the metadata stages of one work item.
pub struct MetadataWorker {
    client: Arc<SeiClient>,
    store: Arc<dyn StateStore>,
    config: SchedulerConfig,
    stages: Vec<Stage>,
}

impl MetadataWorker {
    pub fn new(client: Arc<SeiClient>, store: Arc<dyn StateStore>, config: SchedulerConfig) -> Self {
        Self {
            client,
            store,
            config,
            stages: Stage::ALL.to_vec(),
        }
    }

    /// Restrict the worker to some stages.
    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    async fn fetch(&self, item: &WorkItem, stage: Stage) -> std::result::Result<StagePayload, ApiError> {
        let candidates = self.client.unit_candidates(&item.scope).await?;
        let protocol = item.protocol.as_str();
        let client = &self.client;

        match stage {
            Stage::Metadata => with_unit_fallback(&candidates, |unit| async move {
                client.fetch_process(&unit, protocol).await
            })
            .await
            .map(StagePayload::Metadata),
            Stage::Documents => with_unit_fallback(&candidates, |unit| async move {
                client.list_documents(&unit, protocol).await
            })
            .await
            .map(StagePayload::Documents),
            Stage::Activity => with_unit_fallback(&candidates, |unit| async move {
                client.list_activities(&unit, protocol).await
            })
            .await
            .map(StagePayload::Activity),
        }
    }
}

#[async_trait]
impl ItemWorker for MetadataWorker {
    type Item = WorkItem;

    fn name(&self) -> &'static str {
        "metadata"
    }

    fn item_key(&self, item: &WorkItem) -> String {
        item.protocol.clone()
    }

    async fn process(&self, item: WorkItem) -> Result<ItemOutcome> {
        let item = &item;
        let runs = self.stages.iter().map(|&stage| {
            drive(
                self.store.as_ref(),
                &self.config,
                &item.protocol,
                stage,
                move || self.fetch(item, stage),
            )
        });

        let mut outcomes = Vec::with_capacity(self.stages.len());
        for result in join_all(runs).await {
            outcomes.push(result?);
        }
        Ok(combine_outcomes(&outcomes))
    }
}

/// Metadata pipeline: selection plus a scheduler run per scope.
pub struct MetadataPipeline {
    client: Arc<SeiClient>,
    store: Arc<dyn StateStore>,
    config: SchedulerConfig,
    stop: StopHandle,
}

impl MetadataPipeline {
    pub fn new(
        client: Arc<SeiClient>,
        store: Arc<dyn StateStore>,
        config: SchedulerConfig,
        stop: StopHandle,
    ) -> Self {
        Self {
            client,
            store,
            config,
            stop,
        }
    }

    /// Select work for `query` and process it.
    pub async fn run(&self, query: &WorkQuery) -> Result<BatchSummary> {
        self.config.validate()?;
        let selection = WorkSelector::new(self.store.clone()).work_items(query).await?;

        let worker = MetadataWorker::new(self.client.clone(), self.store.clone(), self.config.clone())
            .with_stages(query.stages.clone());
        let scheduler = BatchScheduler::new(self.config.clone(), self.stop.clone());

        let mut summary = scheduler.run(selection.items, Arc::new(worker)).await?;
        summary.remaining = selection.remaining;
        Ok(summary)
    }

    /// Run several scopes as independent concurrent scheduler runs over
    /// the same store. Each scope reports its own result.
    pub async fn run_scopes(
        &self,
        base: &WorkQuery,
        scopes: &[String],
    ) -> Vec<(String, Result<BatchSummary>)> {
        info!(
            subsystem = "pipeline",
            component = "metadata",
            scopes = scopes.len(),
            "Starting scoped metadata runs"
        );
        let runs = scopes.iter().map(|scope| {
            let query = base.clone().with_scope(scope.clone());
            async move {
                let result = self.run(&query).await;
                if let Err(e) = &result {
                    warn!(
                        subsystem = "pipeline",
                        component = "metadata",
                        scope = %scope,
                        error = %e,
                        "Scoped run failed"
                    );
                }
                (scope.clone(), result)
            }
        });
        join_all(runs).await
    }
}
