//! src/services/metadata_store.rs
//!
//! Metadata store for shared files. `FileRepository` is the seam the
//! consistency engine talks to; `SqliteFileStore` is the production
//! implementation backed by a pooled SQLite database.
//!
//! Updates are fenced by `version`: the row is only rewritten when the
//! stored version still equals the one the caller read, and the version is
//! bumped in the same statement. Every round trip is bounded by a deadline.

use crate::models::file::{FileRecord, FileRow, NewFile, UserId};
use crate::services::token;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{future::Future, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::debug;

/// Embedded schema, also applied by `--migrate`.
pub const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str = "id, token, owner_id, filename, storage_path, \
     created_at, last_accessed_at, download_count, version";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("file record not found")]
    NotFound,
    #[error("token `{0}` is already taken")]
    DuplicateToken(String),
    #[error("edit conflict: record changed since it was read")]
    EditConflict,
    #[error("metadata store did not complete `{op}` within {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Persistence operations on file records.
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Insert a new record. The store assigns id, timestamps and version.
    async fn insert(&self, file: NewFile) -> MetadataResult<FileRecord>;

    /// Look a record up by token. Malformed tokens are `NotFound`.
    async fn get_by_token(&self, token: &str) -> MetadataResult<FileRecord>;

    /// Write `record` back if its `version` is still current, returning the
    /// stored result with the bumped version. Otherwise `EditConflict`, and
    /// nothing is written.
    async fn update(&self, record: &FileRecord) -> MetadataResult<FileRecord>;

    /// Delete the record for `token`, but only if `owner` owns it.
    async fn delete(&self, token: &str, owner: UserId) -> MetadataResult<()>;

    /// All records uploaded by `owner_id`. Non-positive ids are `NotFound`.
    async fn get_all_for_user(&self, owner_id: i64) -> MetadataResult<Vec<FileRecord>>;

    /// Cheap connectivity check for readiness checks.
    async fn ping(&self) -> MetadataResult<()>;
}

/// SQLite-backed `FileRepository`.
#[derive(Clone, Debug)]
pub struct SqliteFileStore {
    pool: SqlitePool,
    query_timeout: Duration,
}

impl SqliteFileStore {
    pub fn new(pool: SqlitePool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// Connect to the database at `url` (e.g. `sqlite://./data/meta/dropit.db`).
    pub async fn connect(
        url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options, max_connections, query_timeout).await
    }

    /// Connect with explicit options. WAL plus a busy timeout lets
    /// concurrent writers queue on the database lock instead of failing.
    ///
    /// The busy timeout is kept below `query_timeout`, so a statement stuck
    /// on the lock gives up inside SQLite before the deadline abandons it.
    /// An abandoned write could otherwise still commit afterwards.
    pub async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
        query_timeout: Duration,
    ) -> MetadataResult<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout_for(query_timeout));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool, query_timeout))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> MetadataResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn within_deadline<T, F>(&self, op: &'static str, fut: F) -> MetadataResult<T>
    where
        F: Future<Output = MetadataResult<T>>,
    {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MetadataError::Timeout {
                op,
                after: self.query_timeout,
            }),
        }
    }
}

#[async_trait]
impl FileRepository for SqliteFileStore {
    async fn insert(&self, file: NewFile) -> MetadataResult<FileRecord> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO files (token, owner_id, filename, storage_path,
                                created_at, last_accessed_at, download_count, version)
             VALUES (?, ?, ?, ?, ?, ?, 0, 1)
             RETURNING {FILE_COLUMNS}"
        );

        self.within_deadline("insert", async {
            sqlx::query_as::<_, FileRow>(&sql)
                .bind(&file.token)
                .bind(file.owner.as_column())
                .bind(&file.filename)
                .bind(&file.storage_path)
                .bind(now)
                .bind(now)
                .fetch_one(&self.pool)
                .await
                .map(FileRecord::from)
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        MetadataError::DuplicateToken(file.token.clone())
                    } else {
                        MetadataError::Sqlx(err)
                    }
                })
        })
        .await
    }

    async fn get_by_token(&self, token: &str) -> MetadataResult<FileRecord> {
        if !token::is_well_formed(token) {
            return Err(MetadataError::NotFound);
        }
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE token = ?");

        self.within_deadline("get_by_token", async {
            sqlx::query_as::<_, FileRow>(&sql)
                .bind(token)
                .fetch_optional(&self.pool)
                .await?
                .map(FileRecord::from)
                .ok_or(MetadataError::NotFound)
        })
        .await
    }

    async fn update(&self, record: &FileRecord) -> MetadataResult<FileRecord> {
        let sql = format!(
            "UPDATE files
             SET filename = ?, last_accessed_at = ?, download_count = ?,
                 version = version + 1
             WHERE id = ? AND version = ?
             RETURNING {FILE_COLUMNS}"
        );

        self.within_deadline("update", async {
            sqlx::query_as::<_, FileRow>(&sql)
                .bind(&record.filename)
                .bind(record.last_accessed_at)
                .bind(record.download_count)
                .bind(record.id)
                .bind(record.version)
                .fetch_optional(&self.pool)
                .await?
                .map(FileRecord::from)
                .ok_or(MetadataError::EditConflict)
        })
        .await
    }

    async fn delete(&self, token: &str, owner: UserId) -> MetadataResult<()> {
        if !token::is_well_formed(token) {
            return Err(MetadataError::NotFound);
        }

        self.within_deadline("delete", async {
            let result = sqlx::query("DELETE FROM files WHERE token = ? AND owner_id = ?")
                .bind(token)
                .bind(owner.get())
                .execute(&self.pool)
                .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound);
            }
            Ok(())
        })
        .await
    }

    async fn get_all_for_user(&self, owner_id: i64) -> MetadataResult<Vec<FileRecord>> {
        let owner = UserId::new(owner_id).ok_or(MetadataError::NotFound)?;
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE owner_id = ? ORDER BY created_at, id"
        );

        self.within_deadline("get_all_for_user", async {
            let rows = sqlx::query_as::<_, FileRow>(&sql)
                .bind(owner.get())
                .fetch_all(&self.pool)
                .await?;
            Ok::<_, MetadataError>(rows.into_iter().map(FileRecord::from).collect())
        })
        .await
    }

    async fn ping(&self) -> MetadataResult<()> {
        self.within_deadline("ping", async {
            let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
            debug!(result = one, "metadata store ping");
            Ok::<_, MetadataError>(())
        })
        .await
    }
}

/// Lock wait allowed inside SQLite for a given per-operation deadline.
fn busy_timeout_for(query_timeout: Duration) -> Duration {
    query_timeout * 3 / 4
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
