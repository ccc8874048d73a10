//! # seisync-db
//!
//! PostgreSQL state store and object storage for seisync.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for work items, pipeline status, fetched
//!   records and document references
//! - Filesystem object storage for downloaded documents
//! - An in-memory state store (`memory` feature) for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use seisync_db::{Database, WorkItemRepository, WorkQuery};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/seisync").await?;
//!     let pending = db.select_work_items(&WorkQuery::all_stages().with_limit(10)).await?;
//!     println!("{} items pending", pending.len());
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

pub mod documents;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod object_storage;
pub mod pipeline_status;
pub mod pool;
pub mod records;
pub mod work_items;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use seisync_core::*;

pub use documents::PgDocumentRepository;
#[cfg(any(test, feature = "memory"))]
pub use memory::MemoryStateStore;
pub use object_storage::{
    compute_content_hash, detect_extension, document_key, store_document, FilesystemBackend,
    StorageBackend,
};
pub use pipeline_status::PgPipelineStatusRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use records::PgRecordRepository;
pub use work_items::PgWorkItemRepository;

/// Escape LIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// LIKE pattern for a scope prefix filter.
pub(crate) fn scope_pattern(prefix: &str) -> String {
    format!("{}%", escape_like(prefix))
}

/// Database handle bundling all repositories over one pool.
pub struct Database {
    pub pool: Pool<Postgres>,
    pub work_items: PgWorkItemRepository,
    pub status: PgPipelineStatusRepository,
    pub records: PgRecordRepository,
    pub documents: PgDocumentRepository,
}

impl Database {
    /// Create a new database handle from an existing pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            work_items: PgWorkItemRepository::new(pool.clone()),
            status: PgPipelineStatusRepository::new(pool.clone()),
            records: PgRecordRepository::new(pool.clone()),
            documents: PgDocumentRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the default pool configuration.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Connect with a custom pool configuration.
    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(database_url, config).await?;
        Ok(Self::new(pool))
    }

    /// Apply the schema migrations in `migrations/`.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl WorkItemRepository for Database {
    async fn insert_work_items(&self, items: &[NewWorkItem]) -> Result<u64> {
        self.work_items.insert_work_items(items).await
    }

    async fn select_work_items(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        self.work_items.select_work_items(query).await
    }

    async fn count_work_items(&self, query: &WorkQuery) -> Result<i64> {
        self.work_items.count_work_items(query).await
    }
}

#[async_trait]
impl PipelineStatusRepository for Database {
    async fn get_status(&self, protocol: &str) -> Result<Option<PipelineStatus>> {
        self.status.get_status(protocol).await
    }

    async fn claim_stage(
        &self,
        protocol: &str,
        stage: Stage,
        lease: Duration,
    ) -> Result<Option<StageClaim>> {
        self.status.claim_stage(protocol, stage, lease).await
    }

    async fn complete_metadata(&self, claim: &StageClaim, record: &ProcessRecord) -> Result<bool> {
        self.status.complete_metadata(claim, record).await
    }

    async fn complete_documents(
        &self,
        claim: &StageClaim,
        documents: &[NewDocumentRef],
    ) -> Result<Option<u64>> {
        self.status.complete_documents(claim, documents).await
    }

    async fn complete_activity(
        &self,
        claim: &StageClaim,
        activities: &[ActivityRecord],
    ) -> Result<bool> {
        self.status.complete_activity(claim, activities).await
    }

    async fn fail_stage(
        &self,
        claim: &StageClaim,
        error: &str,
        kind: FailureKind,
        max_retries: i32,
    ) -> Result<Option<SubStatus>> {
        self.status.fail_stage(claim, error, kind, max_retries).await
    }

    async fn reset_stage_errors(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<u64> {
        self.status.reset_stage_errors(stage, scope_prefix).await
    }

    async fn stage_counts(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<StatusCounts> {
        self.status.stage_counts(stage, scope_prefix).await
    }
}

#[async_trait]
impl RecordRepository for Database {
    async fn get_process(&self, protocol: &str) -> Result<Option<ProcessRecord>> {
        self.records.get_process(protocol).await
    }

    async fn list_activities(&self, protocol: &str) -> Result<Vec<ActivityRecord>> {
        self.records.list_activities(protocol).await
    }
}

#[async_trait]
impl DocumentRepository for Database {
    async fn select_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentRef>> {
        self.documents.select_documents(query).await
    }

    async fn count_documents(&self, query: &DocumentQuery) -> Result<i64> {
        self.documents.count_documents(query).await
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>> {
        self.documents.get_document(document_id).await
    }

    async fn list_documents(&self, protocol: &str) -> Result<Vec<DocumentRef>> {
        self.documents.list_documents(protocol).await
    }

    async fn claim_document(
        &self,
        document_id: &str,
        lease: Duration,
    ) -> Result<Option<DocumentClaim>> {
        self.documents.claim_document(document_id, lease).await
    }

    async fn complete_document(
        &self,
        claim: &DocumentClaim,
        object: &StoredObject,
    ) -> Result<bool> {
        self.documents.complete_document(claim, object).await
    }

    async fn fail_document(
        &self,
        claim: &DocumentClaim,
        error: &str,
        kind: FailureKind,
        max_attempts: i32,
    ) -> Result<Option<DocumentStatus>> {
        self.documents
            .fail_document(claim, error, kind, max_attempts)
            .await
    }

    async fn reset_document_errors(&self, scope_prefix: Option<&str>) -> Result<u64> {
        self.documents.reset_document_errors(scope_prefix).await
    }

    async fn document_counts(&self, scope_prefix: Option<&str>) -> Result<StatusCounts> {
        self.documents.document_counts(scope_prefix).await
    }
}
