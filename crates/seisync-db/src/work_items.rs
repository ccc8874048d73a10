//! Work item repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use seisync_core::{Error, NewWorkItem, Result, Stage, WorkItem, WorkItemRepository, WorkQuery};

use crate::scope_pattern;

/// PostgreSQL implementation of WorkItemRepository.
pub struct PgWorkItemRepository {
    pool: Pool<Postgres>,
}

impl PgWorkItemRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_work_item_row(row: sqlx::postgres::PgRow) -> WorkItem {
        WorkItem {
            id: row.get("id"),
            protocol: row.get("protocol"),
            external_id: row.get("external_id"),
            occurred_at: row.get("occurred_at"),
            classification: row.get("classification"),
            scope: row.get("scope"),
            created_at: row.get("created_at"),
        }
    }
}

/// `WHERE` fragment matching items with any of the stages not terminal.
/// A missing status row reads as pending.
pub(crate) fn open_stages_clause(stages: &[Stage]) -> String {
    if stages.is_empty() {
        return "FALSE".to_string();
    }
    let parts: Vec<String> = stages
        .iter()
        .map(|stage| {
            format!(
                "COALESCE(s.{}_status, 'pending') IN ('pending', 'in_progress')",
                stage.as_str()
            )
        })
        .collect();
    format!("({})", parts.join(" OR "))
}

#[async_trait]
impl WorkItemRepository for PgWorkItemRepository {
    async fn insert_work_items(&self, items: &[NewWorkItem]) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut inserted = 0;

        for item in items {
            let result = sqlx::query(
                "INSERT INTO work_items (protocol, external_id, occurred_at, classification, scope)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (protocol) DO NOTHING",
            )
            .bind(&item.protocol)
            .bind(&item.external_id)
            .bind(item.occurred_at)
            .bind(&item.classification)
            .bind(&item.scope)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(inserted)
    }

    async fn select_work_items(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT w.id, w.protocol, w.external_id, w.occurred_at, w.classification, w.scope,
                    w.created_at
             FROM work_items w
             LEFT JOIN pipeline_status s ON s.protocol = w.protocol
             WHERE ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')
               AND ($3::timestamptz IS NULL OR w.occurred_at >= $3)
               AND {}
             ORDER BY w.id ASC
             LIMIT $2",
            open_stages_clause(&query.stages)
        );

        let rows = sqlx::query(&sql)
            .bind(query.scope_prefix.as_deref().map(scope_pattern))
            .bind(query.limit)
            .bind(query.since)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_work_item_row).collect())
    }

    async fn count_work_items(&self, query: &WorkQuery) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*)
             FROM work_items w
             LEFT JOIN pipeline_status s ON s.protocol = w.protocol
             WHERE ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')
               AND ($2::timestamptz IS NULL OR w.occurred_at >= $2)
               AND {}",
            open_stages_clause(&query.stages)
        );

        let count: i64 = sqlx::query_scalar(&sql)
            .bind(query.scope_prefix.as_deref().map(scope_pattern))
            .bind(query.since)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }
}
