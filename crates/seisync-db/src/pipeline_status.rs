//! Pipeline status repository implementation.
//!
//! Every stage transition is a conditional update: claims only succeed
//! from a claimable status, and completion/failure only apply while the
//! caller's claim token is still the one on the row. Payload writes share
//! a transaction with the status update of the stage they belong to.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use seisync_core::{
    truncate_error, ActivityRecord, Error, FailureKind, NewDocumentRef, PipelineStatus,
    PipelineStatusRepository, ProcessRecord, Result, Stage, StageClaim, StageState, StatusCounts,
    SubStatus,
};

use crate::scope_pattern;

/// PostgreSQL implementation of PipelineStatusRepository.
pub struct PgPipelineStatusRepository {
    pool: Pool<Postgres>,
}

impl PgPipelineStatusRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_stage(row: &sqlx::postgres::PgRow, stage: Stage) -> Result<StageState> {
        let prefix = stage.as_str();
        let status: String = row.get(format!("{}_status", prefix).as_str());
        Ok(StageState {
            status: status.parse()?,
            retry_count: row.get(format!("{}_retry_count", prefix).as_str()),
            last_error: row.get(format!("{}_last_error", prefix).as_str()),
            updated_at: row.get(format!("{}_updated_at", prefix).as_str()),
        })
    }

    fn parse_status_row(row: sqlx::postgres::PgRow) -> Result<PipelineStatus> {
        Ok(PipelineStatus {
            protocol: row.get("protocol"),
            metadata: Self::parse_stage(&row, Stage::Metadata)?,
            documents: Self::parse_stage(&row, Stage::Documents)?,
            activity: Self::parse_stage(&row, Stage::Activity)?,
        })
    }

    /// Mark a claimed stage completed inside `tx`. Returns `false` when the
    /// claim token no longer matches.
    async fn finish_stage(tx: &mut Transaction<'_, Postgres>, claim: &StageClaim) -> Result<bool> {
        let p = claim.stage.as_str();
        let sql = format!(
            "UPDATE pipeline_status
             SET {p}_status = 'completed', {p}_last_error = NULL, {p}_claim_token = NULL,
                 {p}_updated_at = now()
             WHERE protocol = $1 AND {p}_claim_token = $2 AND {p}_status = 'in_progress'",
            p = p
        );
        let result = sqlx::query(&sql)
            .bind(&claim.protocol)
            .bind(claim.token)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }
}

/// Retry bookkeeping shared by the Postgres and in-memory stores.
///
/// Returns the new retry count and status after a failed attempt.
pub fn next_failure_state(retry_count: i32, kind: FailureKind, max_retries: i32) -> (i32, SubStatus) {
    match kind {
        FailureKind::Terminal => (retry_count, SubStatus::Error),
        FailureKind::Retryable => {
            let count = retry_count + 1;
            if count >= max_retries {
                (count, SubStatus::Error)
            } else {
                (count, SubStatus::Pending)
            }
        }
    }
}

#[async_trait]
impl PipelineStatusRepository for PgPipelineStatusRepository {
    async fn get_status(&self, protocol: &str) -> Result<Option<PipelineStatus>> {
        let row = sqlx::query("SELECT * FROM pipeline_status WHERE protocol = $1")
            .bind(protocol)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_status_row).transpose()
    }

    async fn claim_stage(
        &self,
        protocol: &str,
        stage: Stage,
        lease: Duration,
    ) -> Result<Option<StageClaim>> {
        sqlx::query(
            "INSERT INTO pipeline_status (protocol) VALUES ($1)
             ON CONFLICT (protocol) DO NOTHING",
        )
        .bind(protocol)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let token = Uuid::new_v4();
        let p = stage.as_str();
        let sql = format!(
            "UPDATE pipeline_status
             SET {p}_status = 'in_progress', {p}_claim_token = $2, {p}_claimed_at = now(),
                 {p}_updated_at = now()
             WHERE protocol = $1
               AND ({p}_status = 'pending'
                    OR ({p}_status = 'in_progress'
                        AND ({p}_claimed_at IS NULL
                             OR {p}_claimed_at <= now() - make_interval(secs => $3))))
             RETURNING protocol",
            p = p
        );

        let row = sqlx::query(&sql)
            .bind(protocol)
            .bind(token)
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "pipeline_status",
            op = "claim",
            protocol = %protocol,
            stage = %stage,
            claimed = row.is_some(),
            "Stage claim attempted"
        );

        Ok(row.map(|_| StageClaim {
            protocol: protocol.to_string(),
            stage,
            token,
        }))
    }

    async fn complete_metadata(&self, claim: &StageClaim, record: &ProcessRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !Self::finish_stage(&mut tx, claim).await? {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO processes (protocol, procedure_id, unit_id, procedure_type, specification,
                                    access_level, legal_basis, observation, opened_at,
                                    concluded_at, interested, subjects, generating_unit, raw,
                                    fetched_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now())
             ON CONFLICT (protocol) DO UPDATE SET
                procedure_id = EXCLUDED.procedure_id,
                unit_id = EXCLUDED.unit_id,
                procedure_type = EXCLUDED.procedure_type,
                specification = EXCLUDED.specification,
                access_level = EXCLUDED.access_level,
                legal_basis = EXCLUDED.legal_basis,
                observation = EXCLUDED.observation,
                opened_at = EXCLUDED.opened_at,
                concluded_at = EXCLUDED.concluded_at,
                interested = EXCLUDED.interested,
                subjects = EXCLUDED.subjects,
                generating_unit = EXCLUDED.generating_unit,
                raw = EXCLUDED.raw,
                fetched_at = now()",
        )
        .bind(&record.protocol)
        .bind(&record.procedure_id)
        .bind(&record.unit_id)
        .bind(&record.procedure_type)
        .bind(&record.specification)
        .bind(&record.access_level)
        .bind(&record.legal_basis)
        .bind(&record.observation)
        .bind(record.opened_at)
        .bind(record.concluded_at)
        .bind(&record.interested)
        .bind(&record.subjects)
        .bind(&record.generating_unit)
        .bind(&record.raw)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(true)
    }

    async fn complete_documents(
        &self,
        claim: &StageClaim,
        documents: &[NewDocumentRef],
    ) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !Self::finish_stage(&mut tx, claim).await? {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        }

        let mut inserted = 0;
        for doc in documents {
            // Known documents keep their download state untouched.
            let result = sqlx::query(
                "INSERT INTO documents (document_id, protocol, unit_id, number, doc_type,
                                        document_date, generating_unit, signed, signers,
                                        access_level, raw)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (document_id) DO NOTHING",
            )
            .bind(&doc.document_id)
            .bind(&doc.protocol)
            .bind(&doc.unit_id)
            .bind(&doc.number)
            .bind(&doc.doc_type)
            .bind(doc.document_date)
            .bind(&doc.generating_unit)
            .bind(doc.signed)
            .bind(&doc.signers)
            .bind(&doc.access_level)
            .bind(&doc.raw)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(Some(inserted))
    }

    async fn complete_activity(
        &self,
        claim: &StageClaim,
        activities: &[ActivityRecord],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !Self::finish_stage(&mut tx, claim).await? {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM activities WHERE protocol = $1")
            .bind(&claim.protocol)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for activity in activities {
            sqlx::query(
                "INSERT INTO activities (protocol, activity_id, task, description, user_login,
                                         user_name, unit, occurred_at, attributes, raw)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&activity.protocol)
            .bind(&activity.activity_id)
            .bind(&activity.task)
            .bind(&activity.description)
            .bind(&activity.user_login)
            .bind(&activity.user_name)
            .bind(&activity.unit)
            .bind(activity.occurred_at)
            .bind(&activity.attributes)
            .bind(&activity.raw)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(true)
    }

    async fn fail_stage(
        &self,
        claim: &StageClaim,
        error: &str,
        kind: FailureKind,
        max_retries: i32,
    ) -> Result<Option<SubStatus>> {
        let p = claim.stage.as_str();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let select = format!(
            "SELECT {p}_retry_count FROM pipeline_status
             WHERE protocol = $1 AND {p}_claim_token = $2 AND {p}_status = 'in_progress'
             FOR UPDATE",
            p = p
        );
        let retry_count: Option<i32> = sqlx::query_scalar(&select)
            .bind(&claim.protocol)
            .bind(claim.token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let Some(retry_count) = retry_count else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        let (retry_count, status) = next_failure_state(retry_count, kind, max_retries);
        let update = format!(
            "UPDATE pipeline_status
             SET {p}_status = $3, {p}_retry_count = $4, {p}_last_error = $5,
                 {p}_claim_token = NULL, {p}_updated_at = now()
             WHERE protocol = $1 AND {p}_claim_token = $2",
            p = p
        );
        sqlx::query(&update)
            .bind(&claim.protocol)
            .bind(claim.token)
            .bind(status.as_str())
            .bind(retry_count)
            .bind(truncate_error(error))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(Some(status))
    }

    async fn reset_stage_errors(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<u64> {
        let p = stage.as_str();
        let sql = format!(
            "UPDATE pipeline_status s
             SET {p}_status = 'pending', {p}_retry_count = 0, {p}_claim_token = NULL,
                 {p}_updated_at = now()
             FROM work_items w
             WHERE w.protocol = s.protocol
               AND s.{p}_status = 'error'
               AND ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')",
            p = p
        );
        let result = sqlx::query(&sql)
            .bind(scope_prefix.map(scope_pattern))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn stage_counts(&self, stage: Stage, scope_prefix: Option<&str>) -> Result<StatusCounts> {
        let sql = format!(
            "SELECT COALESCE(s.{p}_status, 'pending') AS status, COUNT(*) AS n
             FROM work_items w
             LEFT JOIN pipeline_status s ON s.protocol = w.protocol
             WHERE ($1::text IS NULL OR w.scope LIKE $1 ESCAPE '\\')
             GROUP BY 1",
            p = stage.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(scope_prefix.map(scope_pattern))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<SubStatus>()? {
                SubStatus::Pending => counts.pending += n,
                SubStatus::InProgress => counts.in_progress += n,
                SubStatus::Completed => counts.completed += n,
                SubStatus::Error => counts.error += n,
            }
        }
        Ok(counts)
    }
}
