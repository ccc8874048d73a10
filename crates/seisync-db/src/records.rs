//! Read access to fetched process records and activity history.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use seisync_core::{ActivityRecord, Error, ProcessRecord, RecordRepository, Result};

/// PostgreSQL implementation of RecordRepository.
pub struct PgRecordRepository {
    pool: Pool<Postgres>,
}

impl PgRecordRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordRepository for PgRecordRepository {
    async fn get_process(&self, protocol: &str) -> Result<Option<ProcessRecord>> {
        let row = sqlx::query(
            "SELECT protocol, procedure_id, unit_id, procedure_type, specification, access_level,
                    legal_basis, observation, opened_at, concluded_at, interested, subjects,
                    generating_unit, raw
             FROM processes WHERE protocol = $1",
        )
        .bind(protocol)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| ProcessRecord {
            protocol: row.get("protocol"),
            procedure_id: row.get("procedure_id"),
            unit_id: row.get("unit_id"),
            procedure_type: row.get("procedure_type"),
            specification: row.get("specification"),
            access_level: row.get("access_level"),
            legal_basis: row.get("legal_basis"),
            observation: row.get("observation"),
            opened_at: row.get("opened_at"),
            concluded_at: row.get("concluded_at"),
            interested: row.get("interested"),
            subjects: row.get("subjects"),
            generating_unit: row.get("generating_unit"),
            raw: row.get("raw"),
        }))
    }

    async fn list_activities(&self, protocol: &str) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            "SELECT protocol, activity_id, task, description, user_login, user_name, unit,
                    occurred_at, attributes, raw
             FROM activities WHERE protocol = $1
             ORDER BY occurred_at ASC NULLS LAST, id ASC",
        )
        .bind(protocol)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ActivityRecord {
                protocol: row.get("protocol"),
                activity_id: row.get("activity_id"),
                task: row.get("task"),
                description: row.get("description"),
                user_login: row.get("user_login"),
                user_name: row.get("user_name"),
                unit: row.get("unit"),
                occurred_at: row.get("occurred_at"),
                attributes: row.get("attributes"),
                raw: row.get("raw"),
            })
            .collect())
    }
}
