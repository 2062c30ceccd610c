//! SQLite implementation of the job index
//!
//! Safe for several processes sharing one database file: IDs come from
//! `INSERT ... RETURNING id`, and every status change is a single conditional
//! `UPDATE`, so concurrent claimants are arbitrated by SQLite itself.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use super::{IndexRecord, IndexStore, IndexUpdate, JobFilter, NewIndexRecord};
use crate::core::config::JobsConfig;
use crate::core::errors::{JobError, Result};
use crate::jobs::model::JobId;
use crate::jobs::status::JobStatus;

const COLUMNS: &str = "id, project, job_name, job_type, status, working_directory, storage_path, \
     master_id, queue_id, reason, cancel_requested, claim_token, created_at, updated_at, \
     started_at, finished_at";

/// SQLite index backed by an sqlx pool
#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Connect to the index described by `config` and create the schema if needed
    pub async fn connect(config: &JobsConfig) -> Result<Self> {
        let in_memory = config.index_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.index_url)?
            .create_if_missing(true)
            .busy_timeout(config.index_busy_timeout);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.index_max_connections);
        if in_memory {
            // Each connection to ":memory:" is its own database; keep the single one alive
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let index = Self { pool };
        index.initialize_schema().await?;
        debug!(url = %config.index_url, "Connected to job index");
        Ok(index)
    }

    /// Wrap an existing pool
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let index = Self { pool };
        index.initialize_schema().await?;
        Ok(index)
    }

    /// Initialize the database schema from the embedded SQL file
    pub async fn initialize_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in schema_statements(include_str!("schema.sql")) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl IndexStore for SqliteIndex {
    async fn insert_job(&self, record: &NewIndexRecord) -> Result<JobId> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (project, job_name, job_type, status, working_directory, storage_path,
                              master_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(path_str(&record.project))
        .bind(&record.job_name)
        .bind(&record.job_type)
        .bind(record.status.as_str())
        .bind(path_str(&record.working_directory))
        .bind(path_str(&record.storage_path))
        .bind(record.master_id.map(|id| id as i64))
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                let id: i64 = row.try_get("id")?;
                debug!(job_id = id, job_name = %record.job_name, "Allocated job id");
                Ok(id as JobId)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(JobError::conflict(format!(
                    "a job named '{}' already exists in {}",
                    record.job_name,
                    record.project.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_job(&self, record: &IndexRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, project, job_name, job_type, status, working_directory, storage_path,
                              master_id, queue_id, reason, cancel_requested, claim_token,
                              created_at, updated_at, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id as i64)
        .bind(path_str(&record.project))
        .bind(&record.job_name)
        .bind(&record.job_type)
        .bind(record.status.as_str())
        .bind(path_str(&record.working_directory))
        .bind(path_str(&record.storage_path))
        .bind(record.master_id.map(|id| id as i64))
        .bind(&record.queue_id)
        .bind(&record.reason)
        .bind(record.cancel_requested)
        .bind(&record.claim_token)
        .bind(timestamp(record.created_at))
        .bind(timestamp(record.updated_at))
        .bind(record.started_at.map(timestamp))
        .bind(record.finished_at.map(timestamp))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(JobError::conflict(
                format!("job {} ({}) is already indexed", record.id, record.job_name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<IndexRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", COLUMNS))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_name(&self, project: &Path, job_name: &str) -> Result<Option<IndexRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE project = ? AND job_name = ?",
            COLUMNS
        ))
        .bind(path_str(project))
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update_status(&self, id: JobId, old: JobStatus, new: JobStatus) -> Result<bool> {
        let now = Utc::now();
        let (started, finished) = lifecycle_stamps(new, now);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, updated_at = ?,
                started_at = COALESCE(started_at, ?),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(new.as_str())
        .bind(timestamp(now))
        .bind(started)
        .bind(finished)
        .bind(id as i64)
        .bind(old.as_str())
        .execute(&self.pool)
        .await?;

        let swapped = result.rows_affected() == 1;
        debug!(job_id = id, from = %old, to = %new, swapped, "Index status CAS");
        Ok(swapped)
    }

    async fn force_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        let now = Utc::now();
        let (started, finished) = lifecycle_stamps(status, now);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, updated_at = ?,
                started_at = COALESCE(started_at, ?),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(timestamp(now))
        .bind(started)
        .bind(finished)
        .bind(id as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::not_found(format!("job {} in index", id)));
        }
        Ok(())
    }

    async fn claim(&self, id: JobId, expected: JobStatus, token: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, claim_token = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Busy.as_str())
        .bind(token)
        .bind(timestamp(Utc::now()))
        .bind(id as i64)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, id: JobId, update: &IndexUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET updated_at = ");
        builder.push_bind(timestamp(Utc::now()));
        if let Some(master_id) = update.master_id {
            builder.push(", master_id = ").push_bind(master_id.map(|id| id as i64));
        }
        if let Some(queue_id) = &update.queue_id {
            builder.push(", queue_id = ").push_bind(queue_id.clone());
        }
        if let Some(reason) = &update.reason {
            builder.push(", reason = ").push_bind(reason.clone());
        }
        builder.push(" WHERE id = ").push_bind(id as i64);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(JobError::not_found(format!("job {} in index", id)));
        }
        Ok(())
    }

    async fn request_cancel(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE id = ?")
            .bind(timestamp(Utc::now()))
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<IndexRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", COLUMNS));

        if let Some(project) = &filter.project {
            let project = path_str(project);
            if filter.recursive {
                // Literal prefix match, directory names may hold `%`, `_` or `*`
                let prefix = format!("{}/", project.trim_end_matches('/'));
                builder
                    .push(" AND (project = ")
                    .push_bind(project.clone())
                    .push(" OR substr(project, 1, ")
                    .push_bind(prefix.chars().count() as i64)
                    .push(") = ")
                    .push_bind(prefix)
                    .push(")");
            } else {
                builder.push(" AND project = ").push_bind(project);
            }
        }
        if !filter.statuses.is_empty() {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(pattern) = &filter.name_pattern {
            builder.push(" AND job_name GLOB ").push_bind(pattern.clone());
        }
        if let Some(job_type) = &filter.job_type {
            builder.push(" AND job_type = ").push_bind(job_type.clone());
        }
        if let Some(master_id) = filter.master_id {
            builder.push(" AND master_id = ").push_bind(master_id as i64);
        }
        if let Some(before) = filter.created_before {
            builder.push(" AND created_at < ").push_bind(timestamp(before));
        }
        if let Some(after) = filter.created_after {
            builder.push(" AND created_at > ").push_bind(timestamp(after));
        }
        builder.push(" ORDER BY id");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Fixed-width RFC 3339 so that timestamps compare correctly as text
/// Split a schema script into statements, dropping `--` comment lines first
fn schema_statements(script: &str) -> Vec<String> {
    let code: String = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    code.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobError::internal(format!("invalid timestamp '{}' in index: {}", value, e)))
}

fn lifecycle_stamps(status: JobStatus, now: DateTime<Utc>) -> (Option<String>, Option<String>) {
    let started = (status == JobStatus::Running).then(|| timestamp(now));
    let finished = status.is_terminal().then(|| timestamp(now));
    (started, finished)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn record_from_row(row: &SqliteRow) -> Result<IndexRecord> {
    let status: String = row.try_get("status")?;
    Ok(IndexRecord {
        id: row.try_get::<i64, _>("id")? as JobId,
        project: PathBuf::from(row.try_get::<String, _>("project")?),
        job_name: row.try_get("job_name")?,
        job_type: row.try_get("job_type")?,
        status: status.parse()?,
        working_directory: PathBuf::from(row.try_get::<String, _>("working_directory")?),
        storage_path: PathBuf::from(row.try_get::<String, _>("storage_path")?),
        master_id: row.try_get::<Option<i64>, _>("master_id")?.map(|id| id as JobId),
        queue_id: row.try_get("queue_id")?,
        reason: row.try_get("reason")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        claim_token: row.try_get("claim_token")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        started_at: row
            .try_get::<Option<String>, _>("started_at")?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        finished_at: row
            .try_get::<Option<String>, _>("finished_at")?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}
