//! Postgres-backed job store.
//!
//! Each queue lives in its own table `<queue>_jobs`; dead letters from every
//! queue share `dead_letter_jobs`. Queue names are validated identifiers
//! (`[a-z][a-z0-9_]*`), which is what makes splicing the table name into SQL
//! safe.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` (or `None` from `insert_if_absent`) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! Rows that cannot be turned back into domain values (unknown status,
//! malformed dedup key, negative counters) surface as `InvalidRow`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use std::sync::Arc;
use tracing::{Span, instrument};

use taskforge_core::{
    DeadLetterEntry, DeadLetterId, DeadLetterStats, DeadLetterStatus, DedupKey, DomainError, Job,
    JobId, JobSnapshot, JobStats, JobStatus, QueueName,
};

use super::store::{DeadLetterFilter, DeadLetterStore, JobFilter, JobStore, JobStoreError};

const JOB_COLUMNS: &str = "id, job_type, dedup_key, payload, status, retry_count, max_retries, \
     error_message, locked_at, run_after, cursor_state, created_at, updated_at";

const DEAD_LETTER_COLUMNS: &str = "id, original_queue, original_job_id, job_type, payload, \
     error_message, retry_count, failed_at, status, resolved_at";

/// Postgres-backed job and dead-letter store.
///
/// Every transition is a single conditional statement (`... WHERE status =
/// <expected>`), so workers in any number of processes can share the tables.
/// The dead-letter move is the only multi-statement operation and runs in a
/// transaction.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue's table and indexes if missing.
    ///
    /// With `unique_dedup` the live-dedup index is `UNIQUE`, so two racing
    /// enqueues of the same target cannot both insert.
    #[instrument(skip(self), fields(queue = %queue), err)]
    pub async fn ensure_queue_schema(
        &self,
        queue: &QueueName,
        unique_dedup: bool,
    ) -> Result<(), JobStoreError> {
        let table = queue.jobs_table();
        let dedup_index = if unique_dedup {
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_live_dedup_uidx \
                 ON {table} (job_type, dedup_key) \
                 WHERE status IN ('pending', 'processing')"
            )
        } else {
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_live_dedup_idx \
                 ON {table} (job_type, dedup_key) \
                 WHERE status IN ('pending', 'processing')"
            )
        };

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    seq BIGSERIAL NOT NULL,
                    job_type TEXT NOT NULL,
                    dedup_key TEXT NOT NULL DEFAULT '',
                    payload JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    status TEXT NOT NULL
                        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
                    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                    max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
                    error_message TEXT,
                    locked_at TIMESTAMPTZ,
                    run_after TIMESTAMPTZ NOT NULL,
                    cursor_state JSONB,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    CHECK ((status = 'processing') = (locked_at IS NOT NULL))
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_eligible_idx ON {table} (status, run_after, seq)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_retention_idx ON {table} (status, updated_at)"
            ),
            dedup_index,
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_queue_schema", e))?;
        }

        Ok(())
    }

    /// Create the shared dead-letter table if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_dead_letter_schema(&self) -> Result<(), JobStoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS dead_letter_jobs (
                id UUID PRIMARY KEY,
                original_queue TEXT NOT NULL,
                original_job_id UUID NOT NULL,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                error_message TEXT,
                retry_count INTEGER NOT NULL CHECK (retry_count >= 0),
                failed_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('dead', 'retried', 'ignored')),
                resolved_at TIMESTAMPTZ
            )
            "#,
            "CREATE INDEX IF NOT EXISTS dead_letter_jobs_queue_status_idx \
             ON dead_letter_jobs (original_queue, status)",
            "CREATE INDEX IF NOT EXISTS dead_letter_jobs_failed_at_idx \
             ON dead_letter_jobs (failed_at DESC)",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_dead_letter_schema", e))?;
        }

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(queue = %queue, job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert_if_absent(&self, queue: &QueueName, job: Job) -> Result<Option<Job>, JobStoreError> {
        let table = queue.jobs_table();
        let sql = format!(
            r#"
            INSERT INTO {table} (
                id, job_type, dedup_key, payload, status, retry_count, max_retries,
                error_message, locked_at, run_after, cursor_state, created_at, updated_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            WHERE NOT EXISTS (
                SELECT 1 FROM {table}
                WHERE job_type = $2
                  AND dedup_key = $3
                  AND status IN ('pending', 'processing')
            )
            "#
        );

        let result = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.job_type)
            .bind(job.dedup_key.canonical())
            .bind(&job.payload)
            .bind(job.status.as_str())
            .bind(to_db_count(job.retry_count)?)
            .bind(to_db_count(job.max_retries)?)
            .bind(&job.error_message)
            .bind(job.locked_at)
            .bind(job.run_after)
            .bind(&job.cursor)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&*self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(Some(job)),
            Ok(_) => Ok(None),
            // Lost the race against a concurrent enqueue of the same target.
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(map_sqlx_error("insert_if_absent", e)),
        }
    }

    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM {} WHERE id = $1", queue.jobs_table());

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| JobRow::decode(&row, queue)).transpose()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn list(&self, queue: &QueueName, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM {}
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY seq DESC
            LIMIT $3
            "#,
            queue.jobs_table()
        );

        let rows = sqlx::query(&sql)
            .bind(filter.status.map(JobStatus::as_str))
            .bind(filter.job_type.as_deref())
            .bind(to_db_limit(filter.limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(|row| JobRow::decode(row, queue)).collect()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn stats(&self, queue: &QueueName) -> Result<JobStats, JobStoreError> {
        let sql = format!(
            "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
            queue.jobs_table()
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(invalid_row)?;
            let count: i64 = row.try_get("count").map_err(invalid_row)?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::InvalidRow(e.to_string()))?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self, dedup_key), fields(queue = %queue, job_type = %job_type), err)]
    async fn last_cursor(
        &self,
        queue: &QueueName,
        job_type: &str,
        dedup_key: &DedupKey,
    ) -> Result<Option<JsonValue>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT cursor_state
            FROM {}
            WHERE job_type = $1 AND dedup_key = $2 AND status = 'completed'
            ORDER BY updated_at DESC, seq DESC
            LIMIT 1
            "#,
            queue.jobs_table()
        );

        let row = sqlx::query(&sql)
            .bind(job_type)
            .bind(dedup_key.canonical())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("last_cursor", e))?;

        match row {
            Some(row) => row.try_get::<Option<JsonValue>, _>("cursor_state").map_err(invalid_row),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(queue = %queue, candidates), err)]
    async fn select_eligible(
        &self,
        queue: &QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM {}
            WHERE status = 'pending' AND run_after <= $1
            ORDER BY run_after ASC, seq ASC
            LIMIT $2
            "#,
            queue.jobs_table()
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(to_db_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("select_eligible", e))?;

        Span::current().record("candidates", rows.len());
        rows.iter().map(|row| JobRow::decode(row, queue)).collect()
    }

    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    async fn try_lease(
        &self,
        queue: &QueueName,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'processing', locked_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#,
            queue.jobs_table()
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_lease", e))?;

        row.map(|row| JobRow::decode(&row, queue)).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(queue = %queue, job_id = %job.id, expected = %expected, next = %job.status),
        err
    )]
    async fn compare_and_set(
        &self,
        queue: &QueueName,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $2,
                retry_count = $3,
                error_message = $4,
                locked_at = $5,
                run_after = $6,
                cursor_state = $7,
                updated_at = $8
            WHERE id = $1 AND status = $9
            "#,
            queue.jobs_table()
        );

        let result = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(to_db_count(job.retry_count)?)
            .bind(&job.error_message)
            .bind(job.locked_at)
            .bind(job.run_after)
            .bind(&job.cursor)
            .bind(job.updated_at)
            .bind(expected.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("compare_and_set", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, entry),
        fields(queue = %queue, job_id = %id, dead_letter_id = %entry.id),
        err
    )]
    async fn move_to_dead_letter(
        &self,
        queue: &QueueName,
        id: JobId,
        entry: &DeadLetterEntry,
    ) -> Result<bool, JobStoreError> {
        let payload = serde_json::to_value(&entry.payload)
            .map_err(|e| JobStoreError::InvalidRow(format!("failed to encode dead-letter payload: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let delete = format!(
            "DELETE FROM {} WHERE id = $1 AND status = 'processing'",
            queue.jobs_table()
        );
        let deleted = sqlx::query(&delete)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_job", e))?;

        if deleted.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO dead_letter_jobs (
                id, original_queue, original_job_id, job_type, payload,
                error_message, retry_count, failed_at, status, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.original_queue.as_str())
        .bind(entry.original_job_id.as_uuid())
        .bind(&entry.job_type)
        .bind(&payload)
        .bind(&entry.error_message)
        .bind(to_db_count(entry.retry_count)?)
        .bind(entry.failed_at)
        .bind(entry.status.as_str())
        .bind(entry.resolved_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(true)
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn reclaim_stale(
        &self,
        queue: &QueueName,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = 'pending', locked_at = NULL, updated_at = $2
            WHERE status = 'processing' AND locked_at < $1
            RETURNING id
            "#,
            queue.jobs_table()
        );

        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(invalid_row)
            })
            .collect()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn sweep(&self, queue: &QueueName, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE status IN ('completed', 'failed') AND updated_at < $1",
            queue.jobs_table()
        );

        let result = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("sweep", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeadLetterStore for PostgresJobStore {
    #[instrument(skip(self), fields(dead_letter_id = %id), err)]
    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.as_ref().map(DeadLetterRow::decode).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letter_jobs
            WHERE ($1::text IS NULL OR original_queue = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY failed_at DESC
            LIMIT $3
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(filter.queue.as_ref().map(QueueName::as_str))
            .bind(filter.status.map(DeadLetterStatus::as_str))
            .bind(to_db_limit(filter.limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(DeadLetterRow::decode).collect()
    }

    #[instrument(skip(self), fields(dead_letter_id = %id, to = %to), err)]
    async fn resolve_dead_letter(
        &self,
        id: DeadLetterId,
        to: DeadLetterStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_jobs
            SET status = $2, resolved_at = $3
            WHERE id = $1 AND status = 'dead'
            "#,
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve_dead_letter", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT original_queue, status, COUNT(*) AS count
            FROM dead_letter_jobs
            GROUP BY original_queue, status
            ORDER BY original_queue, status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_stats", e))?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            let queue: String = row.try_get("original_queue").map_err(invalid_row)?;
            let status: String = row.try_get("status").map_err(invalid_row)?;
            let count: i64 = row.try_get("count").map_err(invalid_row)?;
            stats.push(DeadLetterStats {
                queue: QueueName::new(queue).map_err(|e| JobStoreError::InvalidRow(e.to_string()))?,
                status: status
                    .parse()
                    .map_err(|e: DomainError| JobStoreError::InvalidRow(e.to_string()))?,
                count: count.max(0) as u64,
            });
        }
        Ok(stats)
    }
}

fn to_db_count(value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::InvalidRow(format!("counter {value} does not fit in INTEGER")))
}

fn from_db_count(column: &str, value: i32) -> Result<u32, JobStoreError> {
    u32::try_from(value).map_err(|_| JobStoreError::InvalidRow(format!("negative {column}: {value}")))
}

fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn invalid_row(err: sqlx::Error) -> JobStoreError {
    JobStoreError::InvalidRow(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    dedup_key: String,
    payload: JsonValue,
    status: String,
    retry_count: i32,
    max_retries: i32,
    error_message: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    run_after: DateTime<Utc>,
    cursor_state: Option<JsonValue>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            dedup_key: row.try_get("dedup_key")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            locked_at: row.try_get("locked_at")?,
            run_after: row.try_get("run_after")?,
            cursor_state: row.try_get("cursor_state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl JobRow {
    fn decode(row: &sqlx::postgres::PgRow, queue: &QueueName) -> Result<Job, JobStoreError> {
        JobRow::from_row(row).map_err(invalid_row)?.into_job(queue)
    }

    fn into_job(self, queue: &QueueName) -> Result<Job, JobStoreError> {
        let id = self.id;
        let bad = |e: DomainError| JobStoreError::InvalidRow(format!("job {id}: {e}"));

        Ok(Job {
            id: JobId::from_uuid(id),
            queue: queue.clone(),
            job_type: self.job_type,
            dedup_key: DedupKey::parse(&self.dedup_key).map_err(bad)?,
            payload: self.payload,
            status: self.status.parse().map_err(bad)?,
            retry_count: from_db_count("retry_count", self.retry_count)?,
            max_retries: from_db_count("max_retries", self.max_retries)?,
            error_message: self.error_message,
            locked_at: self.locked_at,
            run_after: self.run_after,
            cursor: self.cursor_state,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug)]
struct DeadLetterRow {
    id: uuid::Uuid,
    original_queue: String,
    original_job_id: uuid::Uuid,
    job_type: String,
    payload: JsonValue,
    error_message: Option<String>,
    retry_count: i32,
    failed_at: DateTime<Utc>,
    status: String,
    resolved_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for DeadLetterRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeadLetterRow {
            id: row.try_get("id")?,
            original_queue: row.try_get("original_queue")?,
            original_job_id: row.try_get("original_job_id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            failed_at: row.try_get("failed_at")?,
            status: row.try_get("status")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

impl DeadLetterRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, JobStoreError> {
        DeadLetterRow::from_row(row).map_err(invalid_row)?.try_into()
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = JobStoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let bad = |e: DomainError| JobStoreError::InvalidRow(format!("dead letter {id}: {e}"));
        let payload: JobSnapshot = serde_json::from_value(row.payload).map_err(|e| {
            JobStoreError::InvalidRow(format!("dead letter {id}: bad payload: {e}"))
        })?;

        Ok(DeadLetterEntry {
            id: DeadLetterId::from_uuid(id),
            original_queue: QueueName::new(row.original_queue).map_err(bad)?,
            original_job_id: JobId::from_uuid(row.original_job_id),
            job_type: row.job_type,
            payload,
            error_message: row.error_message,
            retry_count: from_db_count("retry_count", row.retry_count)?,
            failed_at: row.failed_at,
            status: row.status.parse().map_err(bad)?,
            resolved_at: row.resolved_at,
        })
    }
}
