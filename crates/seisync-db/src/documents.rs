//! Document reference repository implementation.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use seisync_core::{
    truncate_error, DocumentClaim, DocumentQuery, DocumentRef, DocumentRepository, DocumentStatus,
    Error, FailureKind, Result, StatusCounts, StoredObject,
};

use crate::scope_pattern;

const DOCUMENT_COLUMNS: &str = "d.id, d.document_id, d.protocol, d.unit_id, d.number, d.doc_type,
    d.document_date, d.signed, d.status, d.attempts, d.last_error, d.content_hash, d.storage_key,
    d.size_bytes, d.content_type, d.created_at, d.downloaded_at, w.scope";

/// PostgreSQL implementation of DocumentRepository.
pub struct PgDocumentRepository {
    pool: Pool<Postgres>,
}

impl PgDocumentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_document_row(row: sqlx::postgres::PgRow) -> Result<DocumentRef> {
        let status: String = row.get("status");
        Ok(DocumentRef {
            id: row.get("id"),
            document_id: row.get("document_id"),
            protocol: row.get("protocol"),
            unit_id: row.get("unit_id"),
            scope: row.get("scope"),
            number: row.get("number"),
            doc_type: row.get("doc_type"),
            document_date: row.get("document_date"),
            signed: row.get("signed"),
            status: status.parse()?,
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            content_hash: row.get("content_hash"),
            storage_key: row.get("storage_key"),
            size_bytes: row.get("size_bytes"),
            content_type: row.get("content_type"),
            created_at: row.get("created_at"),
            downloaded_at: row.get("downloaded_at"),
        })
    }
}

/// Status after a failed download attempt number `attempts`.
pub fn next_document_status(attempts: i32, kind: FailureKind, max_attempts: i32) -> DocumentStatus {
    match kind {
        FailureKind::Terminal => DocumentStatus::Error,
        FailureKind::Retryable if attempts >= max_attempts => DocumentStatus::Error,
        FailureKind::Retryable => DocumentStatus::Pending,
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn select_documents(&self, query: &DocumentQuery) -> Result<Vec<DocumentRef>> {
        let sql = format!(
            "SELECT {}
             FROM documents d
             JOIN work_items w ON w.protocol = d.protocol
             WHERE d.status IN ('pending', 'downloading')
               AND ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')
               AND ($3::text IS NULL OR d.document_id = $3)
               AND ($4::text IS NULL OR d.protocol = $4)
             ORDER BY d.id ASC
             LIMIT $2",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(query.scope_prefix.as_deref().map(scope_pattern))
            .bind(query.limit)
            .bind(query.document_id.as_deref())
            .bind(query.protocol.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_document_row).collect()
    }

    async fn count_documents(&self, query: &DocumentQuery) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM documents d
             JOIN work_items w ON w.protocol = d.protocol
             WHERE d.status IN ('pending', 'downloading')
               AND ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')
               AND ($2::text IS NULL OR d.document_id = $2)
               AND ($3::text IS NULL OR d.protocol = $3)",
        )
        .bind(query.scope_prefix.as_deref().map(scope_pattern))
        .bind(query.document_id.as_deref())
        .bind(query.protocol.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRef>> {
        let sql = format!(
            "SELECT {}
             FROM documents d
             LEFT JOIN work_items w ON w.protocol = d.protocol
             WHERE d.document_id = $1",
            DOCUMENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_document_row).transpose()
    }

    async fn list_documents(&self, protocol: &str) -> Result<Vec<DocumentRef>> {
        let sql = format!(
            "SELECT {}
             FROM documents d
             LEFT JOIN work_items w ON w.protocol = d.protocol
             WHERE d.protocol = $1
             ORDER BY d.id ASC",
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(protocol)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_document_row).collect()
    }

    async fn claim_document(
        &self,
        document_id: &str,
        lease: Duration,
    ) -> Result<Option<DocumentClaim>> {
        let token = Uuid::new_v4();
        let attempt: Option<i32> = sqlx::query_scalar(
            "UPDATE documents
             SET status = 'downloading', attempts = attempts + 1, claim_token = $2,
                 claimed_at = now(), updated_at = now()
             WHERE document_id = $1
               AND (status = 'pending'
                    OR (status = 'downloading'
                        AND (claimed_at IS NULL
                             OR claimed_at <= now() - make_interval(secs => $3))))
             RETURNING attempts",
        )
        .bind(document_id)
        .bind(token)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(attempt.map(|attempt| DocumentClaim {
            document_id: document_id.to_string(),
            token,
            attempt,
        }))
    }

    async fn complete_document(
        &self,
        claim: &DocumentClaim,
        object: &StoredObject,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents
             SET status = 'completed', content_hash = $3, storage_key = $4, size_bytes = $5,
                 content_type = $6, last_error = NULL, claim_token = NULL,
                 downloaded_at = now(), updated_at = now()
             WHERE document_id = $1 AND claim_token = $2 AND status = 'downloading'",
        )
        .bind(&claim.document_id)
        .bind(claim.token)
        .bind(&object.content_hash)
        .bind(&object.storage_key)
        .bind(object.size_bytes)
        .bind(&object.content_type)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_document(
        &self,
        claim: &DocumentClaim,
        error: &str,
        kind: FailureKind,
        max_attempts: i32,
    ) -> Result<Option<DocumentStatus>> {
        let status = next_document_status(claim.attempt, kind, max_attempts);
        let result = sqlx::query(
            "UPDATE documents
             SET status = $3, last_error = $4, claim_token = NULL, updated_at = now()
             WHERE document_id = $1 AND claim_token = $2 AND status = 'downloading'",
        )
        .bind(&claim.document_id)
        .bind(claim.token)
        .bind(status.as_str())
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok((result.rows_affected() == 1).then_some(status))
    }

    async fn reset_document_errors(&self, scope_prefix: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE documents d
             SET status = 'pending', attempts = 0, claim_token = NULL, updated_at = now()
             FROM work_items w
             WHERE w.protocol = d.protocol
               AND d.status = 'error'
               AND ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')",
        )
        .bind(scope_prefix.map(scope_pattern))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn document_counts(&self, scope_prefix: Option<&str>) -> Result<StatusCounts> {
        let rows = sqlx::query(
            "SELECT d.status, COUNT(*) AS n
             FROM documents d
             JOIN work_items w ON w.protocol = d.protocol
             WHERE ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')
             GROUP BY d.status",
        )
        .bind(scope_prefix.map(scope_pattern))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<DocumentStatus>()? {
                DocumentStatus::Pending => counts.pending += n,
                DocumentStatus::Downloading => counts.in_progress += n,
                DocumentStatus::Completed => counts.completed += n,
                DocumentStatus::Error => counts.error += n,
            }
        }
        Ok(counts)
    }
}
